//! API route modules.

pub mod broadcasters;
pub mod rooms;
pub mod signaling;

use crate::api::error::{ApiError, ApiResult};
use crate::room::RoomRegistry;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
}

/// Deserializes a JSON body, turning shape errors into a 400.
pub(crate) fn parse_body<T: DeserializeOwned>(body: Value) -> ApiResult<T> {
    serde_json::from_value(body)
        .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))
}
