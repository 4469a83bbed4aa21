//! Real-time voice server: a single axum router exposing the dialogue
//! core's WebSocket endpoint at `dialogue.websocket_path` (§A.6 External
//! Interfaces).

pub mod realtime_voice;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;

/// Shared server state: every handler reaches the dialogue core's
/// configuration through this.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route(&state.config.dialogue.websocket_path.clone(), get(realtime_voice::ws_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `dialogue.server_host:dialogue.server_port` and serve until the
/// process is killed.
pub async fn start(config: Arc<Config>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.dialogue.server_host, config.dialogue.server_port)
        .parse()
        .context("invalid server_host/server_port")?;
    let path = config.dialogue.websocket_path.clone();
    let state = ServerState { config };
    let app = router(state);

    info!(%addr, path = %path, "starting real-time voice server");
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind server address")?;
    axum::serve(listener, app.into_make_service()).await.context("server error")?;
    Ok(())
}
