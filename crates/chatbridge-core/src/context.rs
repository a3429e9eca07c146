//! Shared coordination state.
//!
//! All cross-task flags live in one [`CoordinationContext`] passed by `Arc`
//! to every component: the interception callback, the stream consumer, the
//! rotation controller and the request coordinator. Fields are typed
//! atomics with `Notify`-based wakeups — never plain shared booleans, and
//! never module-level globals.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Notify;

/// Details of a detected quota-exhaustion signal.
#[derive(Debug, Clone, Default)]
pub struct QuotaSignal {
    /// The offending substring found in telemetry traffic.
    pub matched_text: String,
    /// Model id active when the signal fired.
    pub model: String,
}

/// Pipeline-wide coordination flags and counters.
///
/// Safe to touch from both the interception-callback context and the main
/// serving loop.
pub struct CoordinationContext {
    /// A profile has exhausted its quota; rotation is required.
    quota_exceeded: AtomicBool,
    /// A rotation is currently running.
    rotating: AtomicBool,
    /// Rotation has begun recovering service (consumers should hold, not fail).
    recovering: AtomicBool,
    /// Global shutdown requested.
    shutdown: AtomicBool,
    /// Rotation gate permanently closed (profile pool depleted).
    emergency_locked: AtomicBool,
    /// Tokens consumed by the active profile since its last rotation.
    token_count: AtomicU64,
    /// Requests currently waiting for admission.
    queued_requests: AtomicUsize,
    /// Completion time of the most recent successful rotation.
    last_rotation: RwLock<Option<Instant>>,
    /// Request id currently owning the active-stream slot.
    active_request: RwLock<Option<String>>,
    /// Last quota signal details, for logging and Retry-After hints.
    quota_signal: RwLock<Option<QuotaSignal>>,
    /// Woken when the rotation gate opens.
    rotation_open: Notify,
    /// Woken on shutdown.
    shutdown_notify: Notify,
}

impl Default for CoordinationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinationContext {
    /// Creates a fresh context with all flags clear.
    pub fn new() -> Self {
        Self {
            quota_exceeded: AtomicBool::new(false),
            rotating: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            emergency_locked: AtomicBool::new(false),
            token_count: AtomicU64::new(0),
            queued_requests: AtomicUsize::new(0),
            last_rotation: RwLock::new(None),
            active_request: RwLock::new(None),
            quota_signal: RwLock::new(None),
            rotation_open: Notify::new(),
            shutdown_notify: Notify::new(),
        }
    }

    // --- quota ---

    /// Returns true if a quota-exhaustion signal is pending.
    #[inline]
    pub fn quota_exceeded(&self) -> bool {
        self.quota_exceeded.load(Ordering::SeqCst)
    }

    /// Raises the quota-exceeded flag with signal details.
    ///
    /// Called from the interception callback on telemetry match, or from
    /// token accounting when the active profile crosses its budget.
    pub fn raise_quota_exceeded(&self, signal: QuotaSignal) {
        tracing::warn!(
            matched = %signal.matched_text,
            model = %signal.model,
            "quota exhaustion signal raised"
        );
        *self.quota_signal.write() = Some(signal);
        self.quota_exceeded.store(true, Ordering::SeqCst);
    }

    /// Clears the quota flag after a successful rotation.
    pub fn clear_quota_exceeded(&self) {
        self.quota_exceeded.store(false, Ordering::SeqCst);
        *self.quota_signal.write() = None;
    }

    /// Returns the last quota signal, if any.
    pub fn quota_signal(&self) -> Option<QuotaSignal> {
        self.quota_signal.read().clone()
    }

    // --- rotation gate ---

    /// Returns true while a rotation holds the pipeline gate.
    #[inline]
    pub fn is_rotating(&self) -> bool {
        self.rotating.load(Ordering::SeqCst)
    }

    /// Closes the rotation gate. New generations must not start.
    pub fn close_rotation_gate(&self) {
        self.rotating.store(true, Ordering::SeqCst);
    }

    /// Opens the rotation gate and wakes all waiters.
    pub fn open_rotation_gate(&self) {
        self.rotating.store(false, Ordering::SeqCst);
        self.rotation_open.notify_waiters();
    }

    /// Waits until the rotation gate opens, up to `timeout`.
    ///
    /// Returns true if the gate is open on return. Callers are expected to
    /// re-check shutdown between waits; rotation is expected to restore
    /// service, so in-flight consumers extend their waits rather than abort.
    pub async fn wait_rotation_open(&self, timeout: Duration) -> bool {
        if !self.is_rotating() {
            return true;
        }
        let _ = tokio::time::timeout(timeout, self.rotation_open.notified()).await;
        !self.is_rotating()
    }

    /// Returns true if the pool-depletion emergency lock is engaged.
    #[inline]
    pub fn is_emergency_locked(&self) -> bool {
        self.emergency_locked.load(Ordering::SeqCst)
    }

    /// Engages the permanent emergency lock.
    pub fn engage_emergency_lock(&self) {
        tracing::error!("rotation pool depleted; emergency lock engaged");
        self.emergency_locked.store(true, Ordering::SeqCst);
    }

    /// Marks that rotation has started actively recovering service.
    pub fn set_recovering(&self, value: bool) {
        self.recovering.store(value, Ordering::SeqCst);
    }

    /// Returns true while rotation recovery is in progress.
    #[inline]
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Records a completed rotation.
    pub fn mark_rotation_complete(&self) {
        *self.last_rotation.write() = Some(Instant::now());
    }

    /// Time since the last successful rotation, if one has happened.
    pub fn since_last_rotation(&self) -> Option<Duration> {
        self.last_rotation.read().map(|at| at.elapsed())
    }

    // --- shutdown ---

    /// Returns true once shutdown has been requested.
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Requests global shutdown and wakes all waiters.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
        self.rotation_open.notify_waiters();
    }

    /// Waits for shutdown, up to `timeout`. Returns true if shutting down.
    pub async fn wait_shutdown(&self, timeout: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let _ = tokio::time::timeout(timeout, self.shutdown_notify.notified()).await;
        self.is_shutdown()
    }

    // --- token accounting ---

    /// Adds to the active profile's token count; returns the new total.
    pub fn add_tokens(&self, n: u64) -> u64 {
        self.token_count.fetch_add(n, Ordering::SeqCst) + n
    }

    /// Current token count for the active profile.
    pub fn token_count(&self) -> u64 {
        self.token_count.load(Ordering::SeqCst)
    }

    /// Resets the token counter after a rotation.
    pub fn reset_tokens(&self) {
        self.token_count.store(0, Ordering::SeqCst);
    }

    // --- admission bookkeeping ---

    /// Increments the queued-request counter.
    pub fn inc_queued(&self) {
        self.queued_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the queued-request counter.
    pub fn dec_queued(&self) {
        let prev = self.queued_requests.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "queued-request counter underflow");
    }

    /// Number of requests currently awaiting admission.
    pub fn queued_requests(&self) -> usize {
        self.queued_requests.load(Ordering::SeqCst)
    }

    // --- active-stream slot ---

    /// Claims the active-stream slot for a request id.
    pub fn claim_active(&self, req_id: &str) {
        *self.active_request.write() = Some(req_id.to_string());
    }

    /// Releases the slot if still owned by `req_id`.
    pub fn release_active(&self, req_id: &str) {
        let mut slot = self.active_request.write();
        if slot.as_deref() == Some(req_id) {
            *slot = None;
        }
    }

    /// Returns true if `req_id` currently owns the active-stream slot.
    pub fn owns_active(&self, req_id: &str) -> bool {
        self.active_request.read().as_deref() == Some(req_id)
    }
}

impl std::fmt::Debug for CoordinationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationContext")
            .field("quota_exceeded", &self.quota_exceeded())
            .field("rotating", &self.is_rotating())
            .field("recovering", &self.is_recovering())
            .field("shutdown", &self.is_shutdown())
            .field("emergency_locked", &self.is_emergency_locked())
            .field("token_count", &self.token_count())
            .field("queued_requests", &self.queued_requests())
            .finish()
    }
}
