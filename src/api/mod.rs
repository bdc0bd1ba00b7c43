/// HTTP API Layer
///
/// REST endpoints over the flow service:
/// - Flow publishing, listing, validation and deletion
/// - Inbound transport events and explicit flow starts
/// - Execution status, cancel, restart and step traces
/// - Project fallback-flow registration

// Flow management endpoints
pub mod flows;

// Transport inbound events
pub mod events;

// Execution control and inspection
pub mod executions;

// Project settings
pub mod projects;

use crate::error::EngineError;
use crate::runtime::FlowService;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Router,
};
use serde_json::json;
use std::sync::Arc;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FlowService>,
}

/// Error body `{ "error": "..." }` with a status derived from the engine error
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        tracing::error!("❌ Request failed: {}", e);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::AlreadyRunning { .. } | EngineError::ConcurrencyConflict(_) | EngineError::InvalidState(_) => {
                StatusCode::CONFLICT
            }
            EngineError::FlowNotFound(_) | EngineError::ContextNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::GraphConfiguration { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::ResourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::HandlerRuntime { .. } | EngineError::LoopDetected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("❌ Request failed: {}", e);
        }
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Every API route, bound to `state`
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .merge(flows::create_flow_routes())
        .merge(events::create_event_routes())
        .merge(executions::create_execution_routes())
        .merge(projects::create_project_routes())
        .with_state(state)
}
