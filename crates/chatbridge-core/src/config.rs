//! Tuning parameters for streaming and rotation.
//!
//! Timeouts are expressed in fixed polling ticks so the state machine is
//! deterministic under test (drive it with a short tick) and forgiving in
//! production (100 ms default). The zombie-done grace window and the
//! quota-hold interval are tuning values carried over from operational
//! experience, not contractual thresholds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Stream consumer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Polling tick in milliseconds.
    pub tick_ms: u64,
    /// Time-to-first-byte limit, in ticks (T).
    pub ttfb_ticks: u32,
    /// Silence threshold, in ticks (S).
    pub silence_ticks: u32,
    /// Minimum items received before the silence watchdog arms.
    pub watchdog_min_items: u32,
    /// Attempts when polling the DOM for late body text.
    pub late_body_attempts: u32,
    /// Interval between late-body attempts, in milliseconds.
    pub late_body_interval_ms: u64,
    /// Window after a rotation during which an empty first `done` event is
    /// treated as a stale zombie artifact, in seconds.
    pub zombie_grace_secs: u64,
    /// Hold interval while waiting out a quota-exceeded flag, in
    /// milliseconds.
    pub quota_hold_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            ttfb_ticks: 300,
            silence_ticks: 150,
            watchdog_min_items: 3,
            late_body_attempts: 20,
            late_body_interval_ms: 500,
            zombie_grace_secs: 15,
            quota_hold_ms: 500,
        }
    }
}

impl StreamConfig {
    /// One polling tick.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Silence limit in ticks: `max(S, T)`.
    pub fn silence_limit(&self) -> u32 {
        self.silence_ticks.max(self.ttfb_ticks)
    }

    /// Hard wall-clock ceiling in ticks: `3 × T`.
    pub fn hard_limit(&self) -> u32 {
        self.ttfb_ticks.saturating_mul(3)
    }

    /// Interval between late-body probe attempts.
    pub fn late_body_interval(&self) -> Duration {
        Duration::from_millis(self.late_body_interval_ms)
    }

    /// Quota-exceeded hold interval.
    pub fn quota_hold(&self) -> Duration {
        Duration::from_millis(self.quota_hold_ms)
    }

    /// Zombie-done grace window after a rotation.
    pub fn zombie_grace(&self) -> Duration {
        Duration::from_secs(self.zombie_grace_secs)
    }
}

/// Rotation controller parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Rotation attempts allowed within the sliding window.
    pub max_attempts_in_window: usize,
    /// Sliding window length in seconds.
    pub window_secs: u64,
    /// Queued-request count above which the attempt limit is relaxed.
    pub relaxed_queue_threshold: usize,
    /// Attempt limit used while the queue is above the threshold.
    pub relaxed_max_attempts: usize,
    /// Canary retries per rotation before giving up on the cycle.
    pub canary_retries: u32,
    /// Cooldown after a rate-limit style failure, in minutes.
    pub rate_limit_cooldown_mins: i64,
    /// Cooldown after a hard quota exhaustion, in minutes.
    pub hard_quota_cooldown_mins: i64,
    /// Cooldown applied to a candidate that fails its canary, in minutes.
    pub canary_cooldown_mins: i64,
    /// Token budget per profile before proactive rotation.
    pub token_budget: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_attempts_in_window: 5,
            window_secs: 600,
            relaxed_queue_threshold: 3,
            relaxed_max_attempts: 10,
            canary_retries: 3,
            rate_limit_cooldown_mins: 30,
            hard_quota_cooldown_mins: 24 * 60,
            canary_cooldown_mins: 60,
            token_budget: 900_000,
        }
    }
}

impl RotationConfig {
    /// Sliding attempt window.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Attempt limit given the current queued-request load.
    pub fn attempt_limit(&self, queued: usize) -> usize {
        if queued > self.relaxed_queue_threshold {
            self.relaxed_max_attempts
        } else {
            self.max_attempts_in_window
        }
    }
}
