//! Collaborator boundary: browser automation and client liveness.
//!
//! The DOM automation layer (prompt filling, clicking, CDP plumbing) lives
//! outside this workspace. Everything the core needs from it is expressed
//! here as traits: prompt submission, a live-page probe, a cookie-injection
//! primitive for credential swaps, a canary navigation check, and a DOM-text
//! probe for late-body recovery. The [`mock`] module provides scripted
//! implementations used throughout the test suites and as a stand-in until
//! an automation layer is attached.

use async_trait::async_trait;
use thiserror::Error;

use crate::rotation::AuthProfile;

/// Browser automation errors.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The canary element never appeared after navigation.
    #[error("canary check failed: {0}")]
    Canary(String),

    /// Cookie injection failed for a profile.
    #[error("cookie swap failed: {0}")]
    CookieSwap(String),

    /// The page or browser is gone.
    #[error("browser unavailable: {0}")]
    Unavailable(String),
}

/// Result type for browser operations.
pub type Result<T> = std::result::Result<T, BrowserError>;

/// Handle onto the automated browser session.
#[async_trait]
pub trait BrowserPort: Send + Sync {
    /// Types a prompt into the chat input and submits it.
    async fn submit_prompt(&self, text: &str) -> Result<()>;

    /// Live "still generating" probe against the page.
    async fn is_generating(&self) -> bool;

    /// Swaps session cookies to the given profile's stored credentials.
    async fn swap_cookies(&self, profile: &AuthProfile) -> Result<()>;

    /// Post-swap health check: navigate and wait for a defining element.
    async fn canary_check(&self) -> Result<()>;

    /// Reads late body text out of the DOM, if the page has any.
    async fn read_late_body(&self) -> Option<String>;

    /// Reloads the page to recover from a wedged generation.
    async fn reload(&self);
}

/// Client-liveness probe, provided by the HTTP layer.
pub trait DisconnectProbe: Send + Sync {
    /// Returns true while the requesting client is still connected.
    fn is_connected(&self) -> bool;
}

/// A probe for a client that never disconnects. Useful in tests and for
/// fire-and-forget callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConnected;

impl DisconnectProbe for AlwaysConnected {
    fn is_connected(&self) -> bool {
        true
    }
}

/// Scripted collaborators for tests and for running without automation.
pub mod mock {
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    use parking_lot::RwLock;

    use super::*;

    /// A scriptable [`BrowserPort`].
    ///
    /// Behavior is controlled through atomic knobs so tests can flip them
    /// mid-flight from another task.
    #[derive(Default)]
    pub struct MockBrowser {
        /// Value returned by `is_generating`.
        pub generating: AtomicBool,
        /// Remaining canary checks that should fail before succeeding.
        pub canary_failures: AtomicU32,
        /// Text returned by `read_late_body`, if set.
        pub late_body: RwLock<Option<String>>,
        /// Number of `swap_cookies` calls observed.
        pub swaps: AtomicUsize,
        /// Number of `reload` calls observed.
        pub reloads: AtomicUsize,
        /// Paths of profiles swapped in, in order.
        pub swap_log: RwLock<Vec<String>>,
        /// Prompts submitted, in order.
        pub prompts: RwLock<Vec<String>>,
    }

    impl MockBrowser {
        /// Creates a healthy mock: not generating, canary passes, no late
        /// body.
        pub fn new() -> Self {
            Self::default()
        }

        /// Sets the "still generating" probe result.
        pub fn set_generating(&self, value: bool) {
            self.generating.store(value, Ordering::SeqCst);
        }

        /// Makes the next `n` canary checks fail.
        pub fn fail_canaries(&self, n: u32) {
            self.canary_failures.store(n, Ordering::SeqCst);
        }

        /// Sets the late-body text the DOM probe will report.
        pub fn set_late_body(&self, text: impl Into<String>) {
            *self.late_body.write() = Some(text.into());
        }
    }

    #[async_trait]
    impl BrowserPort for MockBrowser {
        async fn submit_prompt(&self, text: &str) -> Result<()> {
            self.prompts.write().push(text.to_string());
            Ok(())
        }

        async fn is_generating(&self) -> bool {
            self.generating.load(Ordering::SeqCst)
        }

        async fn swap_cookies(&self, profile: &AuthProfile) -> Result<()> {
            self.swaps.fetch_add(1, Ordering::SeqCst);
            self.swap_log
                .write()
                .push(profile.path.display().to_string());
            Ok(())
        }

        async fn canary_check(&self) -> Result<()> {
            let remaining = self.canary_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.canary_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(BrowserError::Canary("defining element not found".into()));
            }
            Ok(())
        }

        async fn read_late_body(&self) -> Option<String> {
            self.late_body.read().clone()
        }

        async fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A [`DisconnectProbe`] backed by a shared flag.
    #[derive(Default)]
    pub struct FlagProbe {
        connected: AtomicBool,
    }

    impl FlagProbe {
        /// Creates a probe that starts connected.
        pub fn connected() -> Self {
            let probe = Self::default();
            probe.connected.store(true, Ordering::SeqCst);
            probe
        }

        /// Simulates the client going away.
        pub fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    impl DisconnectProbe for FlagProbe {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use crate::rotation::{AuthProfile, ProfileTier};

    #[tokio::test]
    async fn test_mock_canary_fails_then_recovers() {
        let browser = MockBrowser::new();
        browser.fail_canaries(2);
        assert!(browser.canary_check().await.is_err());
        assert!(browser.canary_check().await.is_err());
        assert!(browser.canary_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_records_swaps() {
        let browser = MockBrowser::new();
        let profile = AuthProfile::new("/profiles/a", ProfileTier::Standard);
        browser.swap_cookies(&profile).await.unwrap();
        assert_eq!(browser.swaps.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(browser.swap_log.read()[0], "/profiles/a");
    }

    #[test]
    fn test_flag_probe() {
        let probe = FlagProbe::connected();
        assert!(probe.is_connected());
        probe.disconnect();
        assert!(!probe.is_connected());
    }
}
