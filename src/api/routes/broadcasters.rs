//! Broadcaster endpoints, nested under `/rooms`.

use super::{parse_body, AppState};
use crate::api::error::ApiResult;
use crate::engine::MediaKind;
use crate::room::{
    CreateBroadcasterDataProducerRequest, CreateBroadcasterRequest,
    CreateBroadcasterTransportRequest,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:room_id/broadcasters", post(create_broadcaster))
        .route(
            "/:room_id/broadcasters/:broadcaster_id",
            delete(delete_broadcaster),
        )
        .route(
            "/:room_id/broadcasters/:broadcaster_id/transports",
            post(create_transport),
        )
        .route(
            "/:room_id/broadcasters/:broadcaster_id/transports/:transport_id/connect",
            post(connect_transport),
        )
        .route(
            "/:room_id/broadcasters/:broadcaster_id/transports/:transport_id/producers",
            post(create_producer),
        )
        .route(
            "/:room_id/broadcasters/:broadcaster_id/transports/:transport_id/consume",
            post(create_consumer),
        )
        .route(
            "/:room_id/broadcasters/:broadcaster_id/transports/:transport_id/consume/data",
            post(create_data_consumer),
        )
        .route(
            "/:room_id/broadcasters/:broadcaster_id/transports/:transport_id/produce/data",
            post(create_data_producer),
        )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectBody {
    dtls_parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerBody {
    kind: MediaKind,
    rtp_parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeQuery {
    producer_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeDataQuery {
    data_producer_id: String,
}

/// POST /rooms/:roomId/broadcasters
async fn create_broadcaster(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let request: CreateBroadcasterRequest = parse_body(body)?;
    let room = state.registry.get(&room_id)?;
    Ok(Json(room.create_broadcaster(request).await?))
}

/// DELETE /rooms/:roomId/broadcasters/:broadcasterId
async fn delete_broadcaster(
    State(state): State<AppState>,
    Path((room_id, broadcaster_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let room = state.registry.get(&room_id)?;
    room.delete_broadcaster(&broadcaster_id).await?;
    Ok(StatusCode::OK)
}

/// POST /rooms/:roomId/broadcasters/:broadcasterId/transports
///
/// `type` is `webrtc` or `plain`; plain transports accept `rtcpMux` and
/// `comedia`.
async fn create_transport(
    State(state): State<AppState>,
    Path((room_id, broadcaster_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let request: CreateBroadcasterTransportRequest = parse_body(body)?;
    let room = state.registry.get(&room_id)?;
    Ok(Json(
        room.create_broadcaster_transport(&broadcaster_id, request)
            .await?,
    ))
}

async fn connect_transport(
    State(state): State<AppState>,
    Path((room_id, broadcaster_id, transport_id)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let body: ConnectBody = parse_body(body)?;
    let room = state.registry.get(&room_id)?;
    room.connect_broadcaster_transport(&broadcaster_id, &transport_id, body.dtls_parameters)
        .await?;
    Ok(Json(json!({})))
}

async fn create_producer(
    State(state): State<AppState>,
    Path((room_id, broadcaster_id, transport_id)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let body: ProducerBody = parse_body(body)?;
    let room = state.registry.get(&room_id)?;
    Ok(Json(
        room.create_broadcaster_producer(
            &broadcaster_id,
            &transport_id,
            body.kind,
            body.rtp_parameters,
        )
        .await?,
    ))
}

/// POST …/transports/:transportId/consume?producerId=
async fn create_consumer(
    State(state): State<AppState>,
    Path((room_id, broadcaster_id, transport_id)): Path<(String, String, String)>,
    Query(query): Query<ConsumeQuery>,
) -> ApiResult<Json<Value>> {
    let room = state.registry.get(&room_id)?;
    Ok(Json(
        room.create_broadcaster_consumer(&broadcaster_id, &transport_id, &query.producer_id)
            .await?,
    ))
}

/// POST …/transports/:transportId/consume/data?dataProducerId=
async fn create_data_consumer(
    State(state): State<AppState>,
    Path((room_id, broadcaster_id, transport_id)): Path<(String, String, String)>,
    Query(query): Query<ConsumeDataQuery>,
) -> ApiResult<Json<Value>> {
    let room = state.registry.get(&room_id)?;
    Ok(Json(
        room.create_broadcaster_data_consumer(
            &broadcaster_id,
            &transport_id,
            &query.data_producer_id,
        )
        .await?,
    ))
}

async fn create_data_producer(
    State(state): State<AppState>,
    Path((room_id, broadcaster_id, transport_id)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let request: CreateBroadcasterDataProducerRequest = parse_body(body)?;
    let room = state.registry.get(&room_id)?;
    Ok(Json(
        room.create_broadcaster_data_producer(&broadcaster_id, &transport_id, request)
            .await?,
    ))
}
