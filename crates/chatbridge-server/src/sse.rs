//! Presentation-layer event formatting.
//!
//! [`SseFormatter`] turns normalized stream events into OpenAI
//! `chat.completion.chunk` payloads, re-applying the reasoning/body latch
//! at presentation time: once answer text has started, any further
//! reasoning is dropped here even if upstream reordering let it through.
//! After the single terminal chunk (finish reason, usage, `[DONE]`) the
//! formatter is finalized and late upstream items are logged and ignored.
//!
//! [`CompletionAggregator`] applies the same rules to build one
//! `chat.completion` body for non-streaming requests.

use chrono::Utc;
use tracing::{debug, warn};

use chatbridge_core::{NormalizedEvent, TerminalReason};

use crate::models::{
    estimate_tokens, ChatCompletionChunk, ChatCompletionResponse, ChunkDelta, CompletionChoice,
    CompletionMessage, ToolCall, Usage,
};

/// Body synthesized when a session ends with reasoning but no answer text.
pub const FILLER_BODY: &str = "(The model finished reasoning without producing an answer.)";

/// The literal sentinel closing every SSE stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Streaming formatter for one request.
pub struct SseFormatter {
    id: String,
    model: String,
    created: i64,
    prompt_tokens: u64,
    completion_chars: u64,
    body_started: bool,
    saw_reasoning: bool,
    role_sent: bool,
    tool_calls_seen: usize,
    finalized: bool,
}

impl SseFormatter {
    /// Creates a formatter for one completion stream.
    pub fn new(id: impl Into<String>, model: impl Into<String>, prompt_tokens: u64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created: Utc::now().timestamp(),
            prompt_tokens,
            completion_chars: 0,
            body_started: false,
            saw_reasoning: false,
            role_sent: false,
            tool_calls_seen: 0,
            finalized: false,
        }
    }

    /// Returns true once the terminal chunk has been emitted.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Renders one upstream event into zero or more SSE payload strings.
    ///
    /// Payloads are serialized chunk objects, except the final
    /// [`DONE_SENTINEL`]. The caller prepends the `data:` framing.
    pub fn render(&mut self, event: &NormalizedEvent) -> Vec<String> {
        if self.finalized {
            warn!(id = %self.id, ?event, "event after terminal chunk ignored");
            return Vec::new();
        }

        match event {
            NormalizedEvent::ReasoningDelta(text) => {
                if self.body_started {
                    debug!(id = %self.id, "reasoning after body start dropped");
                    return Vec::new();
                }
                self.saw_reasoning = true;
                let role = self.role();
                vec![self.chunk(ChunkDelta {
                    role,
                    reasoning_content: Some(text.clone()),
                    ..ChunkDelta::default()
                })]
            }
            NormalizedEvent::BodyDelta(text) => {
                self.body_started = true;
                self.completion_chars += text.chars().count() as u64;
                let role = self.role();
                vec![self.chunk(ChunkDelta {
                    role,
                    content: Some(text.clone()),
                    ..ChunkDelta::default()
                })]
            }
            NormalizedEvent::FunctionCall(call) => {
                let rendered = ToolCall::from_function(self.tool_calls_seen, call);
                self.tool_calls_seen += 1;
                let role = self.role();
                vec![self.chunk(ChunkDelta {
                    role,
                    tool_calls: Some(vec![rendered]),
                    ..ChunkDelta::default()
                })]
            }
            NormalizedEvent::Terminal { reason } => self.finish(*reason),
        }
    }

    fn finish(&mut self, reason: TerminalReason) -> Vec<String> {
        self.finalized = true;
        if !reason.is_success() {
            warn!(id = %self.id, %reason, "stream ended abnormally");
        }

        let mut payloads = Vec::new();
        if !self.body_started && self.saw_reasoning && self.tool_calls_seen == 0 {
            // Reasoning-only session: give clients a visible body.
            self.completion_chars += FILLER_BODY.chars().count() as u64;
            let role = self.role();
            payloads.push(self.chunk(ChunkDelta {
                role,
                content: Some(FILLER_BODY.to_string()),
                ..ChunkDelta::default()
            }));
        }

        let usage = Usage::new(self.prompt_tokens, self.completion_tokens());
        let terminal = ChatCompletionChunk::terminal(
            &self.id,
            &self.model,
            self.created,
            self.finish_reason(),
            usage,
        );
        payloads.push(serialize(&terminal));
        payloads.push(DONE_SENTINEL.to_string());
        payloads
    }

    fn chunk(&mut self, delta: ChunkDelta) -> String {
        serialize(&ChatCompletionChunk::delta(
            &self.id,
            &self.model,
            self.created,
            delta,
        ))
    }

    /// The assistant role rides on the first delta only.
    fn role(&mut self) -> Option<&'static str> {
        if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some("assistant")
        }
    }

    fn finish_reason(&self) -> &'static str {
        if self.tool_calls_seen > 0 {
            "tool_calls"
        } else {
            "stop"
        }
    }

    fn completion_tokens(&self) -> u64 {
        self.completion_chars.div_ceil(4)
    }
}

fn serialize<T: serde::Serialize>(value: &T) -> String {
    // Chunk types serialize infallibly.
    serde_json::to_string(value).unwrap_or_default()
}

/// Aggregates a full event stream into one non-streaming response.
#[derive(Default)]
pub struct CompletionAggregator {
    body: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    reason: Option<TerminalReason>,
}

impl CompletionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorbs one upstream event, applying the presentation latch.
    pub fn absorb(&mut self, event: &NormalizedEvent) {
        if self.reason.is_some() {
            warn!(?event, "event after terminal ignored in aggregation");
            return;
        }
        match event {
            NormalizedEvent::ReasoningDelta(text) => {
                if self.body.is_empty() {
                    self.reasoning.push_str(text);
                }
            }
            NormalizedEvent::BodyDelta(text) => self.body.push_str(text),
            NormalizedEvent::FunctionCall(call) => {
                let index = self.tool_calls.len();
                self.tool_calls.push(ToolCall::from_function(index, call));
            }
            NormalizedEvent::Terminal { reason } => self.reason = Some(*reason),
        }
    }

    /// Returns the terminal reason once seen.
    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        self.reason
    }

    /// Builds the final response body.
    pub fn into_response(
        mut self,
        id: impl Into<String>,
        model: impl Into<String>,
        prompt_tokens: u64,
    ) -> ChatCompletionResponse {
        if self.body.is_empty() && !self.reasoning.is_empty() && self.tool_calls.is_empty() {
            self.body = FILLER_BODY.to_string();
        }
        let finish_reason = if self.tool_calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };
        let completion_tokens = estimate_tokens(&self.body);

        ChatCompletionResponse {
            id: id.into(),
            object: "chat.completion",
            created: Utc::now().timestamp(),
            model: model.into(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant",
                    content: self.body,
                    reasoning_content: if self.reasoning.is_empty() {
                        None
                    } else {
                        Some(self.reasoning)
                    },
                    tool_calls: if self.tool_calls.is_empty() {
                        None
                    } else {
                        Some(self.tool_calls)
                    },
                },
                finish_reason,
            }],
            usage: Usage::new(prompt_tokens, completion_tokens),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatbridge_core::FunctionCall;
    use serde_json::{json, Value};

    fn parse(payload: &str) -> Value {
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn test_first_chunk_carries_role() {
        let mut f = SseFormatter::new("id", "m", 10);
        let frames = f.render(&NormalizedEvent::BodyDelta("hi".into()));
        let chunk = parse(&frames[0]);
        assert_eq!(chunk["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hi");

        let frames = f.render(&NormalizedEvent::BodyDelta(" there".into()));
        assert!(parse(&frames[0])["choices"][0]["delta"]
            .get("role")
            .is_none());
    }

    #[test]
    fn test_reasoning_rides_extension_field() {
        let mut f = SseFormatter::new("id", "m", 0);
        let frames = f.render(&NormalizedEvent::ReasoningDelta("thinking".into()));
        let delta = &parse(&frames[0])["choices"][0]["delta"];
        assert_eq!(delta["reasoning_content"], "thinking");
        assert!(delta.get("content").is_none());
    }

    #[test]
    fn test_reasoning_dropped_after_body_starts() {
        let mut f = SseFormatter::new("id", "m", 0);
        f.render(&NormalizedEvent::BodyDelta("answer".into()));
        let frames = f.render(&NormalizedEvent::ReasoningDelta("late thought".into()));
        assert!(frames.is_empty());
    }

    #[test]
    fn test_terminal_emits_usage_and_done() {
        let mut f = SseFormatter::new("id", "m", 8);
        f.render(&NormalizedEvent::BodyDelta("12345678".into()));
        let frames = f.render(&NormalizedEvent::Terminal {
            reason: TerminalReason::Done,
        });

        assert_eq!(frames.len(), 2);
        let terminal = parse(&frames[0]);
        assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
        assert_eq!(terminal["usage"]["prompt_tokens"], 8);
        assert_eq!(terminal["usage"]["completion_tokens"], 2);
        assert_eq!(frames[1], DONE_SENTINEL);
    }

    #[test]
    fn test_reasoning_only_session_gets_filler_body() {
        let mut f = SseFormatter::new("id", "m", 0);
        f.render(&NormalizedEvent::ReasoningDelta("hmm".into()));
        let frames = f.render(&NormalizedEvent::Terminal {
            reason: TerminalReason::SilenceDetected,
        });

        assert_eq!(frames.len(), 3);
        let filler = parse(&frames[0]);
        assert_eq!(filler["choices"][0]["delta"]["content"], FILLER_BODY);
        assert_eq!(frames[2], DONE_SENTINEL);
    }

    #[test]
    fn test_events_after_terminal_are_ignored() {
        let mut f = SseFormatter::new("id", "m", 0);
        f.render(&NormalizedEvent::BodyDelta("x".into()));
        f.render(&NormalizedEvent::Terminal {
            reason: TerminalReason::Done,
        });
        assert!(f.is_finalized());
        assert!(f.render(&NormalizedEvent::BodyDelta("late".into())).is_empty());
        assert!(f
            .render(&NormalizedEvent::Terminal {
                reason: TerminalReason::Done
            })
            .is_empty());
    }

    #[test]
    fn test_tool_call_sets_finish_reason() {
        let mut f = SseFormatter::new("id", "m", 0);
        let frames = f.render(&NormalizedEvent::FunctionCall(FunctionCall {
            name: "lookup".into(),
            params: json!({"k": 1}),
        }));
        let delta = &parse(&frames[0])["choices"][0]["delta"];
        assert_eq!(delta["tool_calls"][0]["function"]["name"], "lookup");

        let frames = f.render(&NormalizedEvent::Terminal {
            reason: TerminalReason::Done,
        });
        assert_eq!(
            parse(&frames[0])["choices"][0]["finish_reason"],
            "tool_calls"
        );
    }

    #[test]
    fn test_aggregator_builds_single_response() {
        let mut agg = CompletionAggregator::new();
        agg.absorb(&NormalizedEvent::ReasoningDelta("think ".into()));
        agg.absorb(&NormalizedEvent::BodyDelta("hello".into()));
        agg.absorb(&NormalizedEvent::BodyDelta(" world".into()));
        agg.absorb(&NormalizedEvent::Terminal {
            reason: TerminalReason::Done,
        });

        let response = agg.into_response("id", "m", 4);
        assert_eq!(response.choices[0].message.content, "hello world");
        assert_eq!(
            response.choices[0].message.reasoning_content.as_deref(),
            Some("think ")
        );
        assert_eq!(response.usage.completion_tokens, 3);
    }

    #[test]
    fn test_aggregator_filler_for_reasoning_only() {
        let mut agg = CompletionAggregator::new();
        agg.absorb(&NormalizedEvent::ReasoningDelta("only thoughts".into()));
        agg.absorb(&NormalizedEvent::Terminal {
            reason: TerminalReason::Done,
        });
        let response = agg.into_response("id", "m", 0);
        assert_eq!(response.choices[0].message.content, FILLER_BODY);
    }
}
