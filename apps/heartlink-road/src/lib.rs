//! HeartLink Road: pairs two endpoints per room and relays their
//! offer/answer/ICE envelopes. The relay never sits in the media path.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod pairing;
pub mod websocket;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use websocket::RelayState;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/sessions", get(handlers::list_sessions))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on an already-bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, config: &Config) -> std::io::Result<()> {
    let state = RelayState::new();
    let monitor = state.spawn_heartbeat_monitor(config.heartbeat_sweep, config.heartbeat_timeout);
    let result = axum::serve(listener, router(state)).await;
    monitor.abort();
    result
}
