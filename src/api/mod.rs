//! HTTP API and signaling server.
//!
//! Provides:
//! - WebSocket signaling for peers (`/?roomId=&peerId=`)
//! - Broadcaster management under `/rooms/:roomId/broadcasters`
//! - Room inspection

pub mod error;
pub mod routes;

use crate::config::ServerConfig;
use crate::room::RoomRegistry;
use anyhow::{Context, Result};
use axum::{response::Json, routing::get, Router};
use routes::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ApiServer {
    listen_ip: String,
    port: u16,
    state: AppState,
}

impl ApiServer {
    pub fn new(registry: Arc<RoomRegistry>, config: &ServerConfig) -> Self {
        Self {
            listen_ip: config.listen_ip.clone(),
            port: config.http_port,
            state: AppState { registry },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/version", get(version))
            .merge(routes::signaling::router())
            .nest(
                "/rooms",
                routes::rooms::router().merge(routes::broadcasters::router()),
            )
            .layer(ServiceBuilder::new())
            .with_state(self.state.clone())
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let app = self.router();
        let address = format!("{}:{}", self.listen_ip, self.port);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;

        info!("API server listening on http://{}", address);
        info!("Endpoints:");
        info!("  GET    /?roomId=&peerId=  - Signaling WebSocket");
        info!("  GET    /version           - Get version info");
        info!("  GET    /rooms             - List open rooms");
        info!("  GET    /rooms/:roomId     - Router RTP capabilities");
        info!("  GET    /rooms/:roomId/status - Room status");
        info!("  POST   /rooms/:roomId/broadcasters - Create broadcaster");
        info!("  DELETE /rooms/:roomId/broadcasters/:broadcasterId - Delete broadcaster");
        info!("  POST   /rooms/:roomId/broadcasters/:broadcasterId/transports - Create transport");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": "carecall"
    }))
}
