//! Chatbridge Server - OpenAI-compatible HTTP API.
//!
//! This crate exposes the browser-backed generation pipeline as an OpenAI
//! chat-completions API.
//!
//! ## Endpoints
//!
//! - `POST /v1/chat/completions` - Chat completion; SSE when `stream: true`
//! - `GET /v1/models` - Configured model list
//! - `GET /health` - Liveness plus rotation/quota state snapshot
//!
//! ## Example
//!
//! ```no_run
//! use chatbridge_server::{Server, ServerConfig, AppState};
//!
//! async fn serve(state: AppState) {
//!     let server = Server::new(ServerConfig::default(), state).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod coordinator;
pub mod error;
mod handlers;
pub mod models;
pub mod sse;
pub mod state;

use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use coordinator::RequestCoordinator;
pub use error::{ApiError, Result};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = 8045;

/// Default server host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Maximum accepted request body size.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 8045).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the API router over shared state.
pub fn build_router(state: AppState) -> Router {
    // Permissive CORS: the API fronts local tooling and browser clients.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server over the given state.
    pub fn new(config: ServerConfig, state: AppState) -> std::result::Result<Self, ServerError> {
        let router = build_router(state);
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self { router, addr })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until the listener is torn down.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        info!("Starting Chatbridge API server on {}", self.addr);

        // SO_REUSEADDR so restarts bind through lingering sockets.
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        axum::serve(listener, self.router)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use chatbridge_core::browser::mock::MockBrowser;
    use chatbridge_core::{
        CoordinationContext, EventQueue, GenerationEvent, QuotaSignal, RotationConfig,
        RotationController, StreamConfig,
    };
    use chatbridge_store::{CooldownStore, UsageStore};

    struct Fixture {
        app: Router,
        ctx: Arc<CoordinationContext>,
        browser: Arc<MockBrowser>,
        sink: chatbridge_core::EventSink,
    }

    fn fixture() -> Fixture {
        let ctx = Arc::new(CoordinationContext::new());
        let browser = Arc::new(MockBrowser::new());
        let rotation = Arc::new(RotationController::new(
            ctx.clone(),
            browser.clone(),
            RotationConfig::default(),
            Vec::new(),
            CooldownStore::empty("/tmp/unused-cooldowns.json"),
            UsageStore::empty("/tmp/unused-usage.json"),
        ));
        let (sink, queue) = EventQueue::channel();
        let coordinator = Arc::new(RequestCoordinator::new(
            ctx.clone(),
            browser.clone(),
            rotation.clone(),
            queue,
            StreamConfig {
                tick_ms: 5,
                ttfb_ticks: 100,
                silence_ticks: 50,
                ..StreamConfig::default()
            },
        ));
        let state = AppState::new(ctx.clone(), coordinator.clone(), rotation, Vec::new());

        let loop_coordinator = coordinator.clone();
        tokio::spawn(async move { loop_coordinator.run().await });

        Fixture {
            app: build_router(state),
            ctx,
            browser,
            sink,
        }
    }

    /// Feeds a scripted generation once the prompt reaches the browser.
    fn feed_generation(fixture: &Fixture, deltas: Vec<&'static str>) {
        let sink = fixture.sink.clone();
        let browser = fixture.browser.clone();
        tokio::spawn(async move {
            while browser.prompts.read().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let now = || {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0)
            };
            for delta in deltas {
                sink.push(GenerationEvent::body_text(delta).into_queue_item(now()));
            }
            sink.push(GenerationEvent::finished().into_queue_item(now()));
        });
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_models_endpoint() {
        let f = fixture();
        let request = Request::builder()
            .method("GET")
            .uri("/v1/models")
            .body(Body::empty())
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["id"], crate::state::DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn test_health_reports_flags() {
        let f = fixture();
        f.ctx.raise_quota_exceeded(QuotaSignal::default());

        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["quota_exceeded"], true);
        assert!(json["rotation"]["pool_size"].is_number());
    }

    #[tokio::test]
    async fn test_empty_messages_is_bad_request() {
        let f = fixture();
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(json!({"messages": []}).to_string()))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_maps_to_503_with_retry_after() {
        let f = fixture();
        f.ctx.raise_quota_exceeded(QuotaSignal::default());

        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"messages": [{"role": "user", "content": "x"}]}).to_string(),
            ))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get("retry-after").is_some());
    }

    #[tokio::test]
    async fn test_emergency_lock_maps_to_503() {
        let f = fixture();
        f.ctx.engage_emergency_lock();

        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"messages": [{"role": "user", "content": "x"}]}).to_string(),
            ))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_string(response).await;
        assert!(body.contains("rotation_exhausted"));
    }

    #[tokio::test]
    async fn test_non_streaming_completion() {
        let f = fixture();
        feed_generation(&f, vec!["Hello", " world"]);

        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "model": "chatbridge-web",
                    "messages": [{"role": "user", "content": "greet me"}]
                })
                .to_string(),
            ))
            .unwrap();

        let response = f.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["choices"][0]["message"]["content"], "Hello world");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert!(json["usage"]["total_tokens"].as_u64().unwrap() > 0);
        assert_eq!(f.browser.prompts.read()[0], "greet me");
    }

    #[tokio::test]
    async fn test_streaming_completion_ends_with_done() {
        let f = fixture();
        feed_generation(&f, vec!["streamed answer"]);

        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "messages": [{"role": "user", "content": "stream it"}],
                    "stream": true
                })
                .to_string(),
            ))
            .unwrap();

        let response = f.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = body_string(response).await;
        assert!(body.contains("chat.completion.chunk"));
        assert!(body.contains("streamed answer"));
        assert!(body.trim_end().ends_with("data: [DONE]"));
    }
}
