//! `plaza-api`: signaling gateway
//!
//! HTTP surface of the plaza media server: the WebSocket signaling endpoint
//! that binds connections to rooms and peers, plus a health route. All
//! session logic lives in `plaza-sfu`; this crate only translates between
//! the wire protocol and Room/Peer operations.

pub mod protocol;
pub mod websocket;

use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use plaza_sfu::engine::MediaEngine;
use plaza_sfu::registry::RoomRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub engine: Arc<dyn MediaEngine>,
}

/// Create the HTTP router with the signaling and health routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
