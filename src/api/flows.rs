/// Flow management REST API endpoints
///
/// Publishing stores a new immutable version and hot-loads it; contexts already
/// running stay pinned to the version they started on.

use crate::api::{ApiError, ApiResult, AppState};
use crate::runtime::{InboundEvent, StartedRun, Subject};
use crate::workflow::{validate, Connection, FlowGraph, Node, PublishOutcome, ValidationReport};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Body of `POST /api/flows/validate`
#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// Body of `POST /api/flows/{id}/start`
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub user_id: String,
    pub chat_id: String,
    /// Optional text treated as the triggering message
    #[serde(default)]
    pub text: Option<String>,
}

pub fn create_flow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/flows", post(publish_flow).get(list_flows))
        .route("/api/flows/validate", post(validate_flow))
        .route("/api/flows/{id}", get(get_flow).delete(delete_flow))
        .route("/api/flows/{id}/start", post(start_flow))
}

/// Publish a flow as a new version
///
/// POST /api/flows
/// Body: { "id": "...", "name": "...", "nodes": [...], "connections": [...] }
/// 422 with the validation report when the graph is rejected
async fn publish_flow(
    State(state): State<AppState>,
    Json(flow): Json<FlowGraph>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let outcome = state.service.registry().publish(&flow).await.map_err(ApiError::internal)?;
    match outcome {
        PublishOutcome::Published { version, warnings } => Ok((
            StatusCode::OK,
            Json(json!({ "id": flow.id, "version": version, "warnings": warnings })),
        )),
        PublishOutcome::Rejected(report) => Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(json!(report)))),
    }
}

/// GET /api/flows
async fn list_flows(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let flows = state.service.registry().storage().list_flows().await.map_err(ApiError::internal)?;
    Ok(Json(json!({ "flows": flows })))
}

/// Latest stored version of a flow
///
/// GET /api/flows/{id}
async fn get_flow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<FlowGraph>> {
    match state.service.registry().storage().get_latest_flow(&id).await {
        Ok(Some(flow)) => Ok(Json(flow)),
        Ok(None) => Err(ApiError::new(StatusCode::NOT_FOUND, format!("flow not found: {}", id))),
        Err(e) => Err(ApiError::internal(e)),
    }
}

/// Delete every version of a flow
///
/// DELETE /api/flows/{id}
/// Paused contexts keep their pinned compiled version until they finish.
async fn delete_flow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let registry = state.service.registry();
    registry.remove_flow(&id);
    match registry.storage().delete_flow(&id).await {
        Ok(true) => {
            tracing::info!("🗑️ Deleted flow: {}", id);
            Ok(Json(json!({ "message": format!("Flow '{}' deleted", id) })))
        }
        Ok(false) => Err(ApiError::new(StatusCode::NOT_FOUND, format!("flow not found: {}", id))),
        Err(e) => Err(ApiError::internal(e)),
    }
}

/// Structural validation without storing anything
///
/// POST /api/flows/validate
async fn validate_flow(Json(request): Json<ValidateRequest>) -> Json<ValidationReport> {
    Json(validate(&request.nodes, &request.connections))
}

/// Start a flow for a subject outside of trigger matching
///
/// POST /api/flows/{id}/start
/// Body: { "user_id": "...", "chat_id": "...", "text": "/start" }
async fn start_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Json<StartedRun>> {
    let subject = Subject::new(request.user_id.clone(), request.chat_id.clone());
    let event = request
        .text
        .as_deref()
        .map(|text| InboundEvent::message(&request.user_id, &request.chat_id, text));
    let run = state.service.start_flow(&id, &subject, event.as_ref()).await?;
    Ok(Json(run))
}
