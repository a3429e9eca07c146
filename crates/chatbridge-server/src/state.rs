//! Shared application state.

use std::sync::Arc;

use chatbridge_core::{CoordinationContext, RotationController};

use crate::coordinator::RequestCoordinator;

/// Fallback model id when a request names none.
pub const DEFAULT_MODEL: &str = "chatbridge-web";

/// State shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<CoordinationContext>,
    pub coordinator: Arc<RequestCoordinator>,
    pub rotation: Arc<RotationController>,
    /// Model ids advertised on /v1/models.
    pub models: Arc<Vec<String>>,
}

impl AppState {
    /// Creates the shared state.
    pub fn new(
        ctx: Arc<CoordinationContext>,
        coordinator: Arc<RequestCoordinator>,
        rotation: Arc<RotationController>,
        models: Vec<String>,
    ) -> Self {
        let models = if models.is_empty() {
            vec![DEFAULT_MODEL.to_string()]
        } else {
            models
        };
        Self {
            ctx,
            coordinator,
            rotation,
            models: Arc::new(models),
        }
    }

    /// The model id used when a request does not name one.
    pub fn default_model(&self) -> &str {
        &self.models[0]
    }
}
