//! HTTP request handlers.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use chatbridge_core::{DisconnectProbe, NormalizedEvent, TerminalReason};

use crate::coordinator::{client_pair, ClientGuard};
use crate::error::{ApiError, Result};
use crate::models::{ChatCompletionRequest, ModelList};
use crate::sse::{CompletionAggregator, SseFormatter};
use crate::state::AppState;

/// POST /v1/chat/completions.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response> {
    if request.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".into()));
    }
    if state.ctx.is_shutdown() {
        return Err(ApiError::ShuttingDown);
    }
    if state.ctx.is_emergency_locked() {
        return Err(ApiError::RotationExhausted);
    }
    if state.ctx.quota_exceeded() && !state.ctx.is_recovering() {
        return Err(ApiError::QuotaExhausted);
    }

    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.default_model().to_string());
    let prompt = request.render_prompt();
    let prompt_tokens = request.prompt_tokens();

    let (guard, probe) = client_pair();
    let probe: Arc<dyn DisconnectProbe> = probe;
    let (id, rx) = state
        .coordinator
        .submit(prompt, prompt_tokens, probe)
        .await;
    debug!(id = %id, stream = request.stream, "completion accepted");

    if request.stream {
        Ok(stream_response(id, model, prompt_tokens, rx, guard))
    } else {
        json_response(id, model, prompt_tokens, rx, guard).await
    }
}

struct StreamState {
    rx: mpsc::UnboundedReceiver<NormalizedEvent>,
    formatter: SseFormatter,
    pending: VecDeque<String>,
    closed: bool,
    /// Keeps the client-liveness flag up while the stream is alive.
    _guard: ClientGuard,
}

fn stream_response(
    id: String,
    model: String,
    prompt_tokens: u64,
    rx: mpsc::UnboundedReceiver<NormalizedEvent>,
    guard: ClientGuard,
) -> Response {
    let state = StreamState {
        rx,
        formatter: SseFormatter::new(id, model, prompt_tokens),
        pending: VecDeque::new(),
        closed: false,
        _guard: guard,
    };

    let stream = futures::stream::unfold(state, |mut s| async move {
        loop {
            if let Some(payload) = s.pending.pop_front() {
                return Some((Ok::<Event, Infallible>(Event::default().data(payload)), s));
            }
            if s.closed {
                return None;
            }
            match s.rx.recv().await {
                Some(event) => {
                    s.pending.extend(s.formatter.render(&event));
                    if s.formatter.is_finalized() {
                        s.closed = true;
                    }
                }
                None => {
                    // Cancelled before processing; nobody is listening
                    // anyway, close without a terminal chunk.
                    return None;
                }
            }
        }
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn json_response(
    id: String,
    model: String,
    prompt_tokens: u64,
    mut rx: mpsc::UnboundedReceiver<NormalizedEvent>,
    guard: ClientGuard,
) -> Result<Response> {
    let mut aggregator = CompletionAggregator::new();
    while let Some(event) = rx.recv().await {
        aggregator.absorb(&event);
        if aggregator.terminal_reason().is_some() {
            break;
        }
    }
    drop(guard);

    match aggregator.terminal_reason() {
        None => {
            warn!(id = %id, "completion channel closed without a terminal event");
            Err(ApiError::Internal("generation was cancelled".into()))
        }
        Some(TerminalReason::RotationExhausted) => Err(ApiError::RotationExhausted),
        Some(_) => Ok(Json(aggregator.into_response(id, model, prompt_tokens)).into_response()),
    }
}

/// GET /v1/models.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(ModelList::from_ids(&state.models))
}

/// GET /health.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let rotation = state.rotation.status().await;
    Json(json!({
        "status": if state.ctx.is_emergency_locked() { "degraded" } else { "ok" },
        "quota_exceeded": state.ctx.quota_exceeded(),
        "rotating": state.ctx.is_rotating(),
        "recovering": state.ctx.is_recovering(),
        "queued_requests": state.ctx.queued_requests(),
        "rotation": rotation,
    }))
}
