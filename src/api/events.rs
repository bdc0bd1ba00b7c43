/// Transport inbound events
///
/// The transport adapter posts every decoded chat event here. The engine resumes a
/// waiting context or fires matching triggers; an event nobody wants is `ignored`.

use crate::api::{ApiResult, AppState};
use crate::runtime::{InboundEvent, InboundOutcome};
use axum::{extract::State, response::Json, routing::post, Router};

pub fn create_event_routes() -> Router<AppState> {
    Router::new().route("/api/events", post(receive_event))
}

/// POST /api/events
/// Body: { "chat_id": "...", "user_id": "...", "kind": "message", "text": "/start" }
async fn receive_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> ApiResult<Json<InboundOutcome>> {
    tracing::debug!("📥 Inbound {:?} event for chat {}", event.kind(), event.chat_id);
    let outcome = state.service.handle_inbound(&event).await?;
    Ok(Json(outcome))
}
