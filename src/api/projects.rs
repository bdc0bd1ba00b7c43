/// Project settings endpoints

use crate::api::{ApiError, ApiResult, AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::put,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Body of `PUT /api/projects/{id}/fallback`; `null` clears the registration
#[derive(Debug, Deserialize)]
pub struct FallbackRequest {
    pub flow_id: Option<String>,
}

pub fn create_project_routes() -> Router<AppState> {
    Router::new().route("/api/projects/{id}/fallback", put(set_fallback))
}

/// PUT /api/projects/{id}/fallback
async fn set_fallback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FallbackRequest>,
) -> ApiResult<Json<Value>> {
    if let Some(flow_id) = request.flow_id.as_deref() {
        if state.service.registry().get_active(flow_id).is_none() {
            return Err(ApiError::new(StatusCode::NOT_FOUND, format!("flow not found: {}", flow_id)));
        }
    }
    state
        .service
        .projects()
        .set_fallback_flow(&id, request.flow_id.as_deref())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "project_id": id, "fallback_flow_id": request.flow_id })))
}
