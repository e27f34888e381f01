use axum::{
    extract::{State, WebSocketUpgrade},
    response::{Json, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use termrelay_terminal::SessionRegistry;

use crate::web::connection;

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Keep sessions alive when their transport closes
    pub persistent: bool,
    pub shutdown: CancellationToken,
    /// Live WebSocket connections, awaited during shutdown
    pub connections: TaskTracker,
}

/// Create router with all routes
pub fn create_router(state: AppState, terminal_path: &str) -> Router {
    Router::new()
        // WebSocket endpoint
        .route(terminal_path, get(terminal_handler))
        // Read-only introspection
        .route("/api/sessions", get(list_sessions))
        .route("/health", get(health))
        .with_state(state)
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.len().await,
    }))
}

/// GET /api/sessions - List all live sessions
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.registry.list().await;
    Json(serde_json::json!({ "sessions": sessions }))
}

/// GET <terminal path> - WebSocket upgrade
async fn terminal_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let connections = state.connections.clone();
    ws.on_upgrade(move |socket| connections.track_future(connection::handle_socket(socket, state)))
}
