//! WebSocket upgrade for signaling peers: `?roomId=&peerId=[&consumerReplicas=]`.

use super::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::signaling::ws::serve_peer;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingQuery {
    pub room_id: Option<String>,
    pub peer_id: Option<String>,
    pub consumer_replicas: Option<u32>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(root))
}

/// Upgrades signaling connections; a plain GET gets the service info.
async fn root(
    State(state): State<AppState>,
    Query(query): Query<SignalingQuery>,
    ws: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    let Some(ws) = ws else {
        return Ok(Json(json!({
            "service": "carecall",
            "version": env!("CARGO_PKG_VERSION"),
            "status": "running",
            "rooms": state.registry.rooms().len(),
        }))
        .into_response());
    };

    let (Some(room_id), Some(peer_id)) = (query.room_id, query.peer_id) else {
        return Err(ApiError::bad_request(
            "connection request without roomId and/or peerId",
        ));
    };

    info!(
        "signaling connection request [roomId:{}, peerId:{}]",
        room_id, peer_id
    );
    let room = state
        .registry
        .get_or_create(&room_id, query.consumer_replicas)
        .await?;

    Ok(ws.on_upgrade(move |socket| serve_peer(socket, room, peer_id)))
}
