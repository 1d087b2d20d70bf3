//! Interactive terminal handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, ws::WebSocketUpgrade, Query, State},
    response::Response,
    Json,
};
use futures::StreamExt;
use tracing::debug;

use crate::api::ApiError;
use crate::container::TerminalSize;
use crate::models::{SessionsResponse, TerminalQuery};
use crate::AppState;

/// Upgrade to a WebSocket and bridge it to a shell in the target container
pub async fn terminal_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    query: Result<Query<TerminalQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;

    let container = query
        .container
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| state.config.container.name.clone());

    let size = match (query.cols, query.rows) {
        (Some(cols), Some(rows)) if cols > 0 && rows > 0 => TerminalSize { cols, rows },
        _ => state.default_terminal_size(),
    };

    debug!(container = %container, cols = size.cols, rows = size.rows, "Terminal upgrade requested");

    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        state.terminal.run(container, Some(size), sink, stream).await;
    }))
}

/// Live terminal sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionsResponse> {
    let sessions = state.registry.list().await;
    Json(SessionsResponse {
        total: sessions.len(),
        sessions,
    })
}
