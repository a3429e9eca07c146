//! Stream reconciliation state machine.
//!
//! Pulls raw events from the [`EventQueue`] for one session at a time and
//! turns them into an ordered, exactly-once-terminated sequence of
//! [`NormalizedEvent`]s. Timeouts are measured in polling ticks against a
//! monotonic clock: a TTFB limit before the first item, a silence limit
//! once streaming has started (softened by a live "still generating"
//! probe), and a hard ceiling that fires regardless of probe state.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::browser::BrowserPort;
use crate::config::StreamConfig;
use crate::context::CoordinationContext;
use crate::event::{GenerationEvent, NormalizedEvent, TerminalReason};
use crate::queue::EventQueue;
use crate::session::StreamSession;

/// Drives one [`StreamSession`] over an event queue.
pub struct StreamConsumer {
    ctx: Arc<CoordinationContext>,
    browser: Arc<dyn BrowserPort>,
    config: StreamConfig,
}

impl StreamConsumer {
    /// Creates a consumer bound to the shared context and browser handle.
    pub fn new(
        ctx: Arc<CoordinationContext>,
        browser: Arc<dyn BrowserPort>,
        config: StreamConfig,
    ) -> Self {
        Self {
            ctx,
            browser,
            config,
        }
    }

    /// Runs the session to its single terminal event.
    ///
    /// Emits normalized events on `out` as they are reconciled, always ends
    /// with exactly one `Terminal`, and drains any leftover queued items on
    /// the way out so stale data never leaks into the next session.
    pub async fn run(
        &self,
        queue: &EventQueue,
        mut session: StreamSession,
        out: &mpsc::UnboundedSender<NormalizedEvent>,
    ) -> TerminalReason {
        let reason = self.drive(queue, &mut session, out).await;
        let _ = out.send(NormalizedEvent::Terminal { reason });

        let dropped = queue.drain();
        if dropped > 0 {
            debug!(
                req_id = %session.req_id,
                dropped,
                "discarded leftover queue items on session exit"
            );
        }
        debug!(
            req_id = %session.req_id,
            items = session.items_received,
            reason = %reason,
            "session finished"
        );
        reason
    }

    async fn drive(
        &self,
        queue: &EventQueue,
        session: &mut StreamSession,
        out: &mpsc::UnboundedSender<NormalizedEvent>,
    ) -> TerminalReason {
        let silence_limit = self.config.silence_limit();
        let hard_limit = self.config.hard_limit();

        loop {
            // A superseded session must get out of the way immediately.
            if !self.ctx.owns_active(&session.req_id) {
                return TerminalReason::ZombieAborted;
            }
            if self.ctx.is_shutdown() {
                return TerminalReason::GlobalShutdown;
            }

            let ticks = self.elapsed_ticks(session.started_at);

            // While quota is exhausted and rotation has not begun recovery,
            // hold and retry rather than fail; the rotation controller is
            // about to restore service.
            if self.ctx.quota_exceeded() && !self.ctx.is_recovering() {
                if ticks >= hard_limit {
                    return TerminalReason::HardTimeout;
                }
                tokio::time::sleep(self.config.quota_hold()).await;
                continue;
            }

            if let Some(item) = queue.try_pull() {
                let Some(event) = GenerationEvent::from_queue_item(&item) else {
                    warn!(req_id = %session.req_id, "unparseable queue item skipped");
                    continue;
                };
                if session.is_stale(&event) {
                    debug!(
                        req_id = %session.req_id,
                        ts = ?event.timestamp,
                        "dropped stale event from before session start"
                    );
                    continue;
                }

                for normalized in session.absorb(&event) {
                    let _ = out.send(normalized);
                }

                if event.done {
                    if let Some(reason) = self.handle_done(session, &event, out).await {
                        return reason;
                    }
                }
                continue;
            }

            tokio::time::sleep(self.config.tick()).await;

            if session.items_received == 0 {
                if ticks > self.config.ttfb_ticks {
                    self.browser.reload().await;
                    return TerminalReason::TtfbTimeout;
                }
                continue;
            }

            let idle = self.elapsed_ticks(session.last_packet);

            // Independent silence watchdog: once enough items have arrived,
            // prolonged silence ends the session outright.
            if session.items_received >= self.config.watchdog_min_items
                && idle > self.config.silence_ticks
            {
                return TerminalReason::SilenceDetected;
            }

            if idle > silence_limit {
                if ticks >= hard_limit {
                    return TerminalReason::HardTimeout;
                }
                if self.browser.is_generating().await {
                    // Snooze: roll the idle clock back to half the silence
                    // budget and keep waiting, bounded by the hard ceiling.
                    self.snooze(session, silence_limit);
                } else {
                    return TerminalReason::SilenceDetected;
                }
            }
        }
    }

    /// Handles a `done` event. Returns the terminal reason, or `None` when
    /// the completion must be suppressed and the session keeps waiting.
    async fn handle_done(
        &self,
        session: &mut StreamSession,
        event: &GenerationEvent,
        out: &mpsc::UnboundedSender<NormalizedEvent>,
    ) -> Option<TerminalReason> {
        // A done that races an in-progress rotation is not ours to trust.
        if self.ctx.quota_exceeded() || self.ctx.is_recovering() {
            debug!(req_id = %session.req_id, "suppressed done during quota recovery");
            return None;
        }

        // An empty first item right after a rotation is a leftover artifact
        // from the superseded page state, not a real completion.
        if session.items_received == 1 && !event.has_content() {
            if let Some(since) = self.ctx.since_last_rotation() {
                if since < self.config.zombie_grace() {
                    debug!(req_id = %session.req_id, "suppressed stale zombie done artifact");
                    return None;
                }
            }
        }

        if session.reasoning_only() {
            if let Some(text) = self.poll_late_body().await {
                session.acc_body.push_str(&text);
                let _ = out.send(NormalizedEvent::BodyDelta(text));
            }
        }

        Some(TerminalReason::Done)
    }

    /// Bounded poll of the DOM-text probe for body content that finished
    /// rendering after the wire stream closed.
    async fn poll_late_body(&self) -> Option<String> {
        for attempt in 0..self.config.late_body_attempts {
            if self.ctx.is_shutdown() {
                return None;
            }
            if let Some(text) = self.browser.read_late_body().await {
                if !text.is_empty() {
                    debug!(attempt, "late body recovered from DOM");
                    return Some(text);
                }
            }
            tokio::time::sleep(self.config.late_body_interval()).await;
        }
        None
    }

    fn elapsed_ticks(&self, since: Instant) -> u32 {
        let tick_ms = self.config.tick_ms.max(1);
        (since.elapsed().as_millis() / u128::from(tick_ms)) as u32
    }

    fn snooze(&self, session: &mut StreamSession, silence_limit: u32) {
        let rollback = self.config.tick() * (silence_limit / 2).max(1);
        // checked_sub: a large rollback can underflow the monotonic clock
        // right after boot.
        session.last_packet = Instant::now()
            .checked_sub(rollback)
            .unwrap_or(session.started_at);
    }
}
