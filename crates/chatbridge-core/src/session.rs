//! Per-request stream session state.
//!
//! A [`StreamSession`] owns the event-queue consumption for exactly one
//! served generation: the text accumulators, the delta/cumulative
//! reconciler, and the reasoning/body boundary latch. The surrounding state
//! machine (timeouts, terminal handling) lives in [`crate::consumer`].

use std::time::Instant;

use crate::boundary::BoundaryDetector;
use crate::event::{GenerationEvent, NormalizedEvent};

/// Reconciles an incoming text field against an accumulator.
///
/// Upstream is inconsistent about sending deltas vs cumulative snapshots.
/// If the incoming text extends the accumulator (starts-with), it is taken
/// as cumulative and replaces it; otherwise it is appended as a delta.
/// Returns the newly added text.
///
/// Known ambiguity carried over from the source behavior: a true delta that
/// happens to prefix-match the accumulator is misread as cumulative. No
/// counterexample has been observed on the real wire.
fn reconcile(acc: &mut String, incoming: &str) -> Option<String> {
    if incoming.is_empty() {
        return None;
    }
    if incoming.len() >= acc.len() && incoming.starts_with(acc.as_str()) {
        let delta = incoming[acc.len()..].to_string();
        *acc = incoming.to_string();
        if delta.is_empty() {
            return None;
        }
        return Some(delta);
    }
    acc.push_str(incoming);
    Some(incoming.to_string())
}

/// Mutable state for one generation's stream.
pub struct StreamSession {
    /// Request id owning this session.
    pub req_id: String,
    /// Unix timestamp (seconds) when the request started; events stamped
    /// earlier are stale.
    pub start_ts: f64,
    /// Monotonic start instant for timing.
    pub started_at: Instant,
    /// Accumulated reasoning text.
    pub acc_reason: String,
    /// Accumulated body text.
    pub acc_body: String,
    /// Items absorbed so far.
    pub items_received: u32,
    /// Arrival time of the most recent item.
    pub last_packet: Instant,
    /// Boundary detector over the reasoning stream.
    boundary: BoundaryDetector,
    /// Frozen reasoning/body split index, once latched.
    pub boundary_split: Option<usize>,
    /// True once reasoning has been reclassified as body.
    pub latched: bool,
    /// How much of `acc_reason` has been emitted as reasoning.
    emitted_reason: usize,
}

impl StreamSession {
    /// Creates a session for a request starting now.
    pub fn new(req_id: impl Into<String>, start_ts: f64) -> Self {
        let now = Instant::now();
        Self {
            req_id: req_id.into(),
            start_ts,
            started_at: now,
            acc_reason: String::new(),
            acc_body: String::new(),
            items_received: 0,
            last_packet: now,
            boundary: BoundaryDetector::new(),
            boundary_split: None,
            latched: false,
            emitted_reason: 0,
        }
    }

    /// Stale-data filter: true for events stamped before the session began.
    pub fn is_stale(&self, event: &GenerationEvent) -> bool {
        matches!(event.timestamp, Some(ts) if ts < self.start_ts)
    }

    /// Returns true if any answer body has been produced, counting
    /// reasoning reclassified across the latch.
    pub fn has_body(&self) -> bool {
        if !self.acc_body.is_empty() {
            return true;
        }
        match self.boundary_split {
            Some(split) => self.acc_reason.len() > split,
            None => false,
        }
    }

    /// Returns true if the session produced reasoning but no body.
    pub fn reasoning_only(&self) -> bool {
        !self.acc_reason.is_empty() && !self.has_body()
    }

    /// Absorbs one raw event into the session, yielding ordered normalized
    /// events.
    ///
    /// Handles delta/cumulative reconciliation for both text channels, the
    /// boundary latch, and function calls. Terminal (`done`) handling stays
    /// with the caller.
    pub fn absorb(&mut self, event: &GenerationEvent) -> Vec<NormalizedEvent> {
        self.items_received += 1;
        self.last_packet = Instant::now();

        let mut out = Vec::new();

        if let Some(delta) = reconcile(&mut self.acc_body, &event.body) {
            out.push(NormalizedEvent::BodyDelta(delta));
        }

        if let Some(delta) = reconcile(&mut self.acc_reason, &event.reason) {
            if self.latched {
                // Post-latch reasoning is body, permanently.
                out.push(NormalizedEvent::BodyDelta(delta));
            } else if let Some(split) = self.boundary.feed(&delta) {
                self.latched = true;
                self.boundary_split = Some(split);
                if split > self.emitted_reason {
                    out.push(NormalizedEvent::ReasoningDelta(
                        self.acc_reason[self.emitted_reason..split].to_string(),
                    ));
                    self.emitted_reason = split;
                }
                // When split < emitted_reason (the match started inside
                // text already sent as reasoning, e.g. a code fence one
                // delta ahead of its tag), those bytes go out again as
                // body: a retroactive split cannot recall streamed deltas.
                let body_part = &self.acc_reason[split..];
                if !body_part.is_empty() {
                    out.push(NormalizedEvent::BodyDelta(body_part.to_string()));
                }
            } else {
                self.emitted_reason = self.acc_reason.len();
                out.push(NormalizedEvent::ReasoningDelta(delta));
            }
        }

        for call in &event.function {
            out.push(NormalizedEvent::FunctionCall(call.clone()));
        }

        out
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("req_id", &self.req_id)
            .field("items_received", &self.items_received)
            .field("reason_len", &self.acc_reason.len())
            .field("body_len", &self.acc_body.len())
            .field("latched", &self.latched)
            .finish()
    }
}
