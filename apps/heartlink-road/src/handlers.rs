use axum::{extract::State, response::Json};
use serde::Serialize;
use serde_json::{json, Value};

use crate::pairing::{PairingStats, SessionSnapshot};
use crate::websocket::RelayState;

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub connections: usize,
    pub stats: PairingStats,
    pub sessions: Vec<SessionSnapshot>,
}

pub async fn list_sessions(State(state): State<RelayState>) -> Json<SessionsResponse> {
    let (sessions, stats) = state.sessions();
    Json(SessionsResponse {
        connections: state.connection_count(),
        stats,
        sessions,
    })
}
