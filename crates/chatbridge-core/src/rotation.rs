//! Credential rotation controller.
//!
//! Owns the profile pool, the cooldown table and the usage ranking, and
//! gates the serving pipeline while a rotation is in flight. Selection
//! excludes cooled-down profiles, ranks the rest by ascending persisted
//! token usage with random tie-breaking, and falls back to the emergency
//! tier only when the standard tier is empty. A depletion guard counts
//! attempts in a sliding window; exceeding it engages a permanent emergency
//! lock after one unverified soft swap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use chatbridge_store::{CooldownStore, StoreError, UsageStore};

use crate::browser::{BrowserError, BrowserPort};
use crate::config::RotationConfig;
use crate::context::CoordinationContext;

/// Profile tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileTier {
    /// Normal rotation pool.
    Standard,
    /// Used only when the standard tier is fully cooled or empty.
    Emergency,
}

impl ProfileTier {
    /// Returns the tier as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Emergency => "emergency",
        }
    }
}

/// One stored session-credential bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthProfile {
    /// Absolute path of the stored profile directory.
    pub path: PathBuf,
    /// Rotation tier.
    pub tier: ProfileTier,
    /// Persisted cumulative token usage (selection rank key).
    pub cumulative_tokens: u64,
    /// Cooldown expiry, if cooling.
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl AuthProfile {
    /// Creates a profile record.
    pub fn new(path: impl Into<PathBuf>, tier: ProfileTier) -> Self {
        Self {
            path: path.into(),
            tier,
            cumulative_tokens: 0,
            cooldown_until: None,
        }
    }
}

/// What kind of failure triggered the rotation; drives cooldown length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaFailure {
    /// Transient rate limiting: short cooldown.
    RateLimit,
    /// Hard quota exhaustion: the profile is out for the day.
    HardQuota,
}

/// Rotation errors.
#[derive(Debug, Error)]
pub enum RotationError {
    /// No profile is eligible for selection.
    #[error("no eligible profiles: all tiers empty or cooling down")]
    NoCandidates,

    /// The depletion guard tripped; the pipeline is emergency-locked.
    #[error("rotation attempts exhausted; emergency lock engaged")]
    Exhausted,

    /// Browser automation failed during the swap.
    #[error("browser error during rotation: {0}")]
    Browser(#[from] BrowserError),

    /// Persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for rotation operations.
pub type Result<T> = std::result::Result<T, RotationError>;

/// Discovers profiles as immediate subdirectories of a tier directory.
pub fn discover_profiles(dir: &Path, tier: ProfileTier) -> Vec<AuthProfile> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut profiles: Vec<AuthProfile> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| AuthProfile::new(e.path(), tier))
        .collect();
    profiles.sort_by(|a, b| a.path.cmp(&b.path));
    profiles
}

/// Picks the next candidate from `profiles`.
///
/// Cooled-down profiles are excluded; the survivors are shuffled for
/// tie-breaking fairness and then stably sorted by ascending persisted
/// usage. Emergency-tier profiles are considered only when no standard
/// profile is eligible.
pub fn select_candidate(
    profiles: &[AuthProfile],
    cooldowns: &CooldownStore,
    usage: &UsageStore,
    now: DateTime<Utc>,
) -> Option<AuthProfile> {
    let pick = |tier: ProfileTier| -> Option<AuthProfile> {
        let mut eligible: Vec<&AuthProfile> = profiles
            .iter()
            .filter(|p| p.tier == tier && !cooldowns.is_cooling(&p.path, now))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        eligible.shuffle(&mut rand::thread_rng());
        eligible.sort_by_key(|p| usage.get(&p.path));
        eligible.first().map(|p| (*p).clone())
    };

    pick(ProfileTier::Standard).or_else(|| pick(ProfileTier::Emergency))
}

/// State guarded by the controller's operation lock.
struct RotationInner {
    profiles: Vec<AuthProfile>,
    cooldowns: CooldownStore,
    usage: UsageStore,
    /// Recent attempt times for the depletion guard.
    attempts: Vec<Instant>,
    /// Currently active profile path.
    active: Option<PathBuf>,
}

/// Snapshot of rotation state for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RotationStatus {
    /// Active profile path, if one has been selected.
    pub active_profile: Option<String>,
    /// Total profiles in the pool.
    pub pool_size: usize,
    /// Profiles currently cooling down.
    pub cooling: usize,
    /// Tokens consumed by the active profile since its last rotation.
    pub tokens_since_rotation: u64,
    /// True while the emergency lock is engaged.
    pub emergency_locked: bool,
}

/// The rotation controller. One instance owns the pool and the stores.
pub struct RotationController {
    ctx: Arc<CoordinationContext>,
    browser: Arc<dyn BrowserPort>,
    config: RotationConfig,
    inner: Mutex<RotationInner>,
}

impl RotationController {
    /// Creates a controller over a profile pool and its persistence.
    pub fn new(
        ctx: Arc<CoordinationContext>,
        browser: Arc<dyn BrowserPort>,
        config: RotationConfig,
        profiles: Vec<AuthProfile>,
        cooldowns: CooldownStore,
        usage: UsageStore,
    ) -> Self {
        Self {
            ctx,
            browser,
            config,
            inner: Mutex::new(RotationInner {
                profiles,
                cooldowns,
                usage,
                attempts: Vec::new(),
                active: None,
            }),
        }
    }

    /// Selects and activates an initial profile at startup, without a
    /// canary (the browser session is brought up around it).
    pub async fn activate_initial(&self) -> Result<PathBuf> {
        let mut inner = self.inner.lock().await;
        let candidate =
            select_candidate(&inner.profiles, &inner.cooldowns, &inner.usage, Utc::now())
                .ok_or(RotationError::NoCandidates)?;
        self.browser.swap_cookies(&candidate).await?;
        inner.active = Some(candidate.path.clone());
        info!(profile = %candidate.path.display(), "initial profile activated");
        Ok(candidate.path)
    }

    /// Rotates away from the current profile.
    ///
    /// Re-entrant-safe: a concurrent caller blocks on the operation lock
    /// and, on acquiring it, observes the quota flag already cleared by the
    /// finished rotation and returns without duplicating work. While the
    /// rotation runs, the pipeline gate is closed and new generations must
    /// not start.
    pub async fn rotate(&self, failure: QuotaFailure) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if !self.ctx.quota_exceeded() {
            // Another caller already rotated while we waited for the lock.
            return Ok(());
        }
        if self.ctx.is_emergency_locked() {
            return Err(RotationError::Exhausted);
        }

        self.ctx.close_rotation_gate();
        self.ctx.set_recovering(true);
        let result = self.rotate_locked(&mut inner, failure).await;
        self.ctx.set_recovering(false);

        match &result {
            Ok(path) => {
                self.ctx.clear_quota_exceeded();
                self.ctx.reset_tokens();
                self.ctx.mark_rotation_complete();
                self.ctx.open_rotation_gate();
                info!(profile = %path.display(), "rotation complete");
            }
            Err(e) => {
                // The gate stays closed: new admissions are rejected until
                // an operator intervenes or cooldowns expire.
                warn!(error = %e, "rotation failed; pipeline gate remains closed");
            }
        }
        result.map(|_| ())
    }

    async fn rotate_locked(
        &self,
        inner: &mut RotationInner,
        failure: QuotaFailure,
    ) -> Result<PathBuf> {
        let now = Instant::now();
        let window = self.config.window();
        inner.attempts.retain(|t| now.duration_since(*t) < window);

        let limit = self.config.attempt_limit(self.ctx.queued_requests());
        if inner.attempts.len() >= limit {
            self.ctx.engage_emergency_lock();
            self.soft_swap(inner).await;
            return Err(RotationError::Exhausted);
        }
        inner.attempts.push(now);

        // The outgoing profile earned its cooldown.
        if let Some(outgoing) = inner.active.clone() {
            let minutes = match failure {
                QuotaFailure::RateLimit => self.config.rate_limit_cooldown_mins,
                QuotaFailure::HardQuota => self.config.hard_quota_cooldown_mins,
            };
            inner
                .cooldowns
                .set_cooldown(&outgoing, chrono::Duration::minutes(minutes));
        }

        let mut last_err = RotationError::NoCandidates;
        for attempt in 0..=self.config.canary_retries {
            let Some(candidate) =
                select_candidate(&inner.profiles, &inner.cooldowns, &inner.usage, Utc::now())
            else {
                break;
            };

            if let Err(e) = self.browser.swap_cookies(&candidate).await {
                warn!(
                    profile = %candidate.path.display(),
                    attempt,
                    error = %e,
                    "cookie swap failed; cooling candidate"
                );
                inner.cooldowns.set_cooldown(
                    &candidate.path,
                    chrono::Duration::minutes(self.config.canary_cooldown_mins),
                );
                last_err = RotationError::Browser(e);
                continue;
            }

            match self.browser.canary_check().await {
                Ok(()) => {
                    inner.active = Some(candidate.path.clone());
                    inner.cooldowns.save()?;
                    inner.usage.save()?;
                    return Ok(candidate.path);
                }
                Err(e) => {
                    warn!(
                        profile = %candidate.path.display(),
                        attempt,
                        error = %e,
                        "canary failed; cooling candidate"
                    );
                    inner.cooldowns.set_cooldown(
                        &candidate.path,
                        chrono::Duration::minutes(self.config.canary_cooldown_mins),
                    );
                    last_err = RotationError::Browser(e);
                }
            }
        }

        let _ = inner.cooldowns.save();
        Err(last_err)
    }

    /// Last-resort unverified swap once the depletion guard has tripped:
    /// push cookies for the least-used profile, ignoring cooldowns and
    /// skipping the canary.
    async fn soft_swap(&self, inner: &mut RotationInner) {
        let mut pool: Vec<&AuthProfile> = inner.profiles.iter().collect();
        if pool.is_empty() {
            return;
        }
        pool.shuffle(&mut rand::thread_rng());
        pool.sort_by_key(|p| inner.usage.get(&p.path));
        let candidate = pool[0].clone();
        if self.browser.swap_cookies(&candidate).await.is_ok() {
            warn!(profile = %candidate.path.display(), "unverified soft swap applied");
            inner.active = Some(candidate.path);
        }
    }

    /// Records token usage against the active profile and raises the quota
    /// flag once the configured budget is crossed.
    pub async fn record_usage(&self, tokens: u64) {
        let since_rotation = self.ctx.add_tokens(tokens);

        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.active.clone() {
            inner.usage.add(&active, tokens);
            if let Err(e) = inner.usage.save() {
                warn!(error = %e, "failed to persist usage store");
            }
        }

        if since_rotation > self.config.token_budget && !self.ctx.quota_exceeded() {
            self.ctx.raise_quota_exceeded(crate::context::QuotaSignal {
                matched_text: format!("token budget exceeded: {since_rotation}"),
                model: String::new(),
            });
        }
    }

    /// Currently active profile path.
    pub async fn active_profile(&self) -> Option<PathBuf> {
        self.inner.lock().await.active.clone()
    }

    /// Snapshot for health reporting.
    pub async fn status(&self) -> RotationStatus {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let cooling = inner
            .profiles
            .iter()
            .filter(|p| inner.cooldowns.is_cooling(&p.path, now))
            .count();
        RotationStatus {
            active_profile: inner
                .active
                .as_ref()
                .map(|p| p.display().to_string()),
            pool_size: inner.profiles.len(),
            cooling,
            tokens_since_rotation: self.ctx.token_count(),
            emergency_locked: self.ctx.is_emergency_locked(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::MockBrowser;
    use std::sync::atomic::Ordering;

    fn profile(path: &str) -> AuthProfile {
        AuthProfile::new(path, ProfileTier::Standard)
    }

    fn stores() -> (CooldownStore, UsageStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (
            CooldownStore::empty(dir.path().join("cooldowns.json")),
            UsageStore::empty(dir.path().join("usage.json")),
            dir,
        )
    }

    fn controller(
        profiles: Vec<AuthProfile>,
        config: RotationConfig,
    ) -> (Arc<RotationController>, Arc<CoordinationContext>, Arc<MockBrowser>, tempfile::TempDir)
    {
        let ctx = Arc::new(CoordinationContext::new());
        let browser = Arc::new(MockBrowser::new());
        let (cooldowns, usage, dir) = stores();
        let controller = Arc::new(RotationController::new(
            ctx.clone(),
            browser.clone(),
            config,
            profiles,
            cooldowns,
            usage,
        ));
        (controller, ctx, browser, dir)
    }

    #[test]
    fn test_selection_excludes_cooling_profiles() {
        let profiles = vec![profile("/p/a"), profile("/p/b"), profile("/p/c")];
        let (mut cooldowns, usage, _dir) = stores();
        cooldowns.set_cooldown(Path::new("/p/a"), chrono::Duration::hours(1));
        cooldowns.set_cooldown(Path::new("/p/b"), chrono::Duration::hours(2));

        // The only eligible profile wins every time until expiry.
        for _ in 0..10 {
            let picked = select_candidate(&profiles, &cooldowns, &usage, Utc::now()).unwrap();
            assert_eq!(picked.path, PathBuf::from("/p/c"));
        }

        // Once the clock passes the first expiry, /p/a becomes eligible.
        let later = Utc::now() + chrono::Duration::minutes(90);
        let picked_paths: Vec<PathBuf> = (0..10)
            .map(|_| {
                select_candidate(&profiles, &cooldowns, &usage, later)
                    .unwrap()
                    .path
            })
            .collect();
        assert!(picked_paths.iter().all(|p| *p != PathBuf::from("/p/b")));
    }

    #[test]
    fn test_selection_ranks_by_usage() {
        let profiles = vec![profile("/p/a"), profile("/p/b")];
        let (cooldowns, mut usage, _dir) = stores();
        usage.add(Path::new("/p/a"), 1000);
        usage.add(Path::new("/p/b"), 10);

        let picked = select_candidate(&profiles, &cooldowns, &usage, Utc::now()).unwrap();
        assert_eq!(picked.path, PathBuf::from("/p/b"));
    }

    #[test]
    fn test_emergency_tier_only_when_standard_empty() {
        let profiles = vec![
            profile("/p/std"),
            AuthProfile::new("/p/emergency", ProfileTier::Emergency),
        ];
        let (mut cooldowns, usage, _dir) = stores();

        let picked = select_candidate(&profiles, &cooldowns, &usage, Utc::now()).unwrap();
        assert_eq!(picked.path, PathBuf::from("/p/std"));

        cooldowns.set_cooldown(Path::new("/p/std"), chrono::Duration::hours(1));
        let picked = select_candidate(&profiles, &cooldowns, &usage, Utc::now()).unwrap();
        assert_eq!(picked.path, PathBuf::from("/p/emergency"));
    }

    #[tokio::test]
    async fn test_rotation_clears_quota_and_opens_gate() {
        let (controller, ctx, browser, _dir) =
            controller(vec![profile("/p/a"), profile("/p/b")], RotationConfig::default());
        ctx.raise_quota_exceeded(Default::default());

        controller.rotate(QuotaFailure::RateLimit).await.unwrap();

        assert!(!ctx.quota_exceeded());
        assert!(!ctx.is_rotating());
        assert_eq!(ctx.token_count(), 0);
        assert!(ctx.since_last_rotation().is_some());
        assert_eq!(browser.swaps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_rotations_do_not_duplicate() {
        let (controller, ctx, browser, _dir) =
            controller(vec![profile("/p/a"), profile("/p/b")], RotationConfig::default());
        ctx.raise_quota_exceeded(Default::default());

        let c1 = controller.clone();
        let c2 = controller.clone();
        let (r1, r2) = tokio::join!(
            c1.rotate(QuotaFailure::RateLimit),
            c2.rotate(QuotaFailure::RateLimit)
        );
        r1.unwrap();
        r2.unwrap();

        // Exactly one rotation did the work.
        assert_eq!(browser.swaps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canary_failure_cools_candidate_and_retries() {
        let (controller, ctx, browser, _dir) =
            controller(vec![profile("/p/a"), profile("/p/b")], RotationConfig::default());
        ctx.raise_quota_exceeded(Default::default());
        browser.fail_canaries(1);

        controller.rotate(QuotaFailure::HardQuota).await.unwrap();

        // First candidate failed its canary, so two swaps happened.
        assert_eq!(browser.swaps.load(Ordering::SeqCst), 2);
        assert!(controller.active_profile().await.is_some());
    }

    #[tokio::test]
    async fn test_depletion_guard_engages_emergency_lock() {
        let config = RotationConfig {
            max_attempts_in_window: 1,
            relaxed_max_attempts: 1,
            ..RotationConfig::default()
        };
        let (controller, ctx, _browser, _dir) =
            controller(vec![profile("/p/a"), profile("/p/b")], config);

        ctx.raise_quota_exceeded(Default::default());
        controller.rotate(QuotaFailure::RateLimit).await.unwrap();

        ctx.raise_quota_exceeded(Default::default());
        let err = controller.rotate(QuotaFailure::RateLimit).await.unwrap_err();
        assert!(matches!(err, RotationError::Exhausted));
        assert!(ctx.is_emergency_locked());
        // The gate stays closed after a failed rotation.
        assert!(ctx.is_rotating());
    }

    #[tokio::test]
    async fn test_all_profiles_cooling_is_no_candidates() {
        let (controller, ctx, _browser, _dir) =
            controller(vec![profile("/p/only")], RotationConfig::default());
        ctx.raise_quota_exceeded(Default::default());

        // Rotating away from the active profile cools it; with a pool of
        // one there is nothing left to select.
        controller.activate_initial().await.unwrap();
        let err = controller.rotate(QuotaFailure::HardQuota).await.unwrap_err();
        assert!(matches!(err, RotationError::NoCandidates));
    }

    #[tokio::test]
    async fn test_record_usage_raises_quota_at_budget() {
        let config = RotationConfig {
            token_budget: 100,
            ..RotationConfig::default()
        };
        let (controller, ctx, _browser, _dir) =
            controller(vec![profile("/p/a")], config);
        controller.activate_initial().await.unwrap();

        controller.record_usage(60).await;
        assert!(!ctx.quota_exceeded());
        controller.record_usage(60).await;
        assert!(ctx.quota_exceeded());
    }
}
