//! OpenAI-compatible request and response models.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chatbridge_core::FunctionCall;

/// Request body for POST /v1/chat/completions.
///
/// Unknown fields (temperature, top_p, tools, ...) are accepted and
/// ignored: the upstream chat UI controls its own sampling.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    /// Requested model id; informational only.
    #[serde(default)]
    pub model: Option<String>,
    /// Conversation messages, oldest first.
    pub messages: Vec<ChatMessage>,
    /// True for SSE streaming, false for a single JSON body.
    #[serde(default)]
    pub stream: bool,
}

/// One conversation message.
#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Either a plain string or an array of content parts.
    #[serde(default)]
    pub content: Value,
}

impl ChatMessage {
    /// Flattens string or multi-part content into plain text.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

impl ChatCompletionRequest {
    /// Renders the conversation into the single prompt submitted to the
    /// chat page. Later turns carry role prefixes so the model sees the
    /// history; a lone user message goes through verbatim.
    pub fn render_prompt(&self) -> String {
        if self.messages.len() == 1 {
            return self.messages[0].text();
        }
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.text()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Estimated prompt token count.
    pub fn prompt_tokens(&self) -> u64 {
        estimate_tokens(&self.render_prompt())
    }
}

/// Rough token estimate: four characters per token, minimum one for
/// non-empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as u64).div_ceil(4)
}

/// Token accounting reported on the final chunk and on JSON responses.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A tool call rendered in OpenAI shape.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub index: usize,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    /// Arguments as a JSON-encoded string, per the OpenAI wire shape.
    pub arguments: String,
}

impl ToolCall {
    /// Converts a decoded function call.
    pub fn from_function(index: usize, call: &FunctionCall) -> Self {
        Self {
            index,
            id: format!("call_{index}"),
            kind: "function",
            function: ToolFunction {
                name: call.name.clone(),
                arguments: call.params.to_string(),
            },
        }
    }
}

/// Delta payload inside a streaming chunk.
///
/// Reasoning text travels in `reasoning_content`, the de-facto extension
/// field used by reasoning-capable OpenAI-compatible servers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// One `chat.completion.chunk` streaming object.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<&'static str>,
}

impl ChatCompletionChunk {
    /// Creates a chunk with one choice and no finish reason.
    pub fn delta(id: &str, model: &str, created: i64, delta: ChunkDelta) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// Creates the terminal chunk carrying the finish reason and usage.
    pub fn terminal(
        id: &str,
        model: &str,
        created: i64,
        finish_reason: &'static str,
        usage: Usage,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(finish_reason),
            }],
            usage: Some(usage),
        }
    }
}

/// Non-streaming `chat.completion` response body.
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CompletionMessage {
    pub role: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Response body for GET /v1/models.
#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

impl ModelList {
    /// Builds the static model list from configured ids.
    pub fn from_ids(ids: &[String]) -> Self {
        let created = Utc::now().timestamp();
        Self {
            object: "list",
            data: ids
                .iter()
                .map(|id| ModelInfo {
                    id: id.clone(),
                    object: "model",
                    created,
                    owned_by: "chatbridge",
                })
                .collect(),
        }
    }
}
