/// Execution control and inspection endpoints

use crate::api::{ApiResult, AppState};
use crate::runtime::{ExecutionStatusView, StartedRun, StepTrace};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Body of `POST /api/executions/{id}/restart`
#[derive(Debug, Deserialize)]
pub struct RestartRequest {
    pub node_id: String,
    #[serde(default)]
    pub reset_variables: bool,
}

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/restart", post(restart_execution))
        .route("/api/executions/{id}/trace", get(get_trace))
}

/// GET /api/executions/{id}
async fn get_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<ExecutionStatusView>> {
    Ok(Json(state.service.get_execution_status(&id).await?))
}

/// POST /api/executions/{id}/cancel
async fn cancel_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let cancelled = state.service.cancel_execution(&id).await?;
    Ok(Json(json!({ "context_id": id, "cancelled": cancelled })))
}

/// POST /api/executions/{id}/restart
/// Body: { "node_id": "ask-phone", "reset_variables": false }
async fn restart_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RestartRequest>,
) -> ApiResult<Json<StartedRun>> {
    let run = state
        .service
        .restart_from_node(&id, &request.node_id, request.reset_variables)
        .await?;
    Ok(Json(run))
}

/// GET /api/executions/{id}/trace
async fn get_trace(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Vec<StepTrace>>> {
    Ok(Json(state.service.trace(&id).await?))
}
