//! Generation event model.
//!
//! Everything that crosses the interception → serving boundary is expressed
//! as a [`GenerationEvent`], optionally wrapped in a timestamp envelope.
//! Downstream, the stream consumer turns those raw events into
//! [`NormalizedEvent`]s that the SSE formatter can render directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A function/tool call extracted from the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name as announced by the model.
    pub name: String,
    /// Decoded arguments as plain JSON.
    #[serde(default)]
    pub params: Value,
}

/// One raw event decoded from intercepted traffic.
///
/// Text fields may be deltas or cumulative snapshots; the consumer
/// reconciles the two. All fields are optional on the wire, so
/// deserialization is tolerant and defaults to empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationEvent {
    /// "Thinking" text, before the reasoning/body boundary latches.
    #[serde(default)]
    pub reason: String,
    /// Answer text.
    #[serde(default)]
    pub body: String,
    /// Set once, on the final event of a generation.
    #[serde(default)]
    pub done: bool,
    /// Function calls carried by this event.
    #[serde(default)]
    pub function: Vec<FunctionCall>,
    /// Unix timestamp (seconds) assigned at interception time.
    ///
    /// Not part of the inner wire object; populated from the envelope.
    #[serde(skip)]
    pub timestamp: Option<f64>,
}

impl GenerationEvent {
    /// Creates a body-text event.
    pub fn body_text(text: impl Into<String>) -> Self {
        Self {
            body: text.into(),
            ..Self::default()
        }
    }

    /// Creates a reasoning-text event.
    pub fn reason_text(text: impl Into<String>) -> Self {
        Self {
            reason: text.into(),
            ..Self::default()
        }
    }

    /// Creates a terminal event.
    pub fn finished() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    /// Returns true if the event carries no text, no function calls and no
    /// completion flag.
    pub fn is_empty(&self) -> bool {
        self.reason.is_empty() && self.body.is_empty() && self.function.is_empty() && !self.done
    }

    /// Returns true if the event carries any text or function content.
    pub fn has_content(&self) -> bool {
        !self.reason.is_empty() || !self.body.is_empty() || !self.function.is_empty()
    }

    /// Parses a queue item into an event.
    ///
    /// Items may arrive bare (`{"reason": ..., "body": ...}`) or wrapped in
    /// a `{"ts": <float>, "data": {...}}` envelope added at interception
    /// time. Unknown shapes yield `None` rather than an error; the queue
    /// must never poison its consumer.
    pub fn from_queue_item(item: &Value) -> Option<Self> {
        let (ts, data) = match (item.get("ts"), item.get("data")) {
            (Some(ts), Some(data)) => (ts.as_f64(), data),
            _ => (None, item),
        };

        let mut event: GenerationEvent = serde_json::from_value(data.clone()).ok()?;
        event.timestamp = ts;
        Some(event)
    }

    /// Wraps the event in a timestamp envelope for the queue.
    pub fn into_queue_item(self, ts: f64) -> Value {
        serde_json::json!({
            "ts": ts,
            "data": self,
        })
    }
}

/// Why a session ended.
///
/// Every session yields exactly one terminal event, and callers use the
/// reason string to distinguish "produced nothing" from "produced something
/// then hung".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// The generation completed normally.
    Done,
    /// No data arrived before the time-to-first-byte limit.
    TtfbTimeout,
    /// Items stopped arriving mid-stream.
    SilenceDetected,
    /// The hard wall-clock ceiling was hit regardless of liveness probes.
    HardTimeout,
    /// A different request took over the active-stream slot.
    ZombieAborted,
    /// The credential pool was depleted and the emergency lock engaged.
    RotationExhausted,
    /// Global shutdown was requested.
    GlobalShutdown,
}

impl TerminalReason {
    /// Returns the stable wire string for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::TtfbTimeout => "ttfb_timeout",
            Self::SilenceDetected => "silence_detected",
            Self::HardTimeout => "hard_timeout",
            Self::ZombieAborted => "zombie_aborted",
            Self::RotationExhausted => "rotation_exhausted",
            Self::GlobalShutdown => "global_shutdown",
        }
    }

    /// Returns true if the session produced a normal completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An ordered, reconciled event produced by the stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    /// A reasoning-text delta (pre-boundary).
    ReasoningDelta(String),
    /// An answer-text delta.
    BodyDelta(String),
    /// A complete decoded function call.
    FunctionCall(FunctionCall),
    /// The single terminal event for the session.
    Terminal { reason: TerminalReason },
}

impl NormalizedEvent {
    /// Returns true for the terminal variant.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}
