//! Room inspection endpoints.

use super::AppState;
use crate::api::error::ApiResult;
use crate::room::RoomStatus;
use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use serde_json::Value;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rooms))
        .route("/:room_id", get(router_rtp_capabilities))
        .route("/:room_id/status", get(room_status))
}

/// GET /rooms - Status of every open room.
async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomStatus>> {
    Json(state.registry.rooms().iter().map(|room| room.status()).collect())
}

/// GET /rooms/:roomId - The room router's RTP capabilities.
async fn router_rtp_capabilities(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let room = state.registry.get(&room_id)?;
    Ok(Json(room.router().rtp_capabilities()))
}

/// GET /rooms/:roomId/status - Participants, capture phase and throttle flag.
async fn room_status(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> ApiResult<Json<RoomStatus>> {
    let room = state.registry.get(&room_id)?;
    Ok(Json(room.status()))
}
