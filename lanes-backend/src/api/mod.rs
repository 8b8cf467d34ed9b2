use axum::{
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use serde::Serialize;

mod board;
mod events;

use crate::state::AppState;

/// Axum REST API routes.
///
///   GET  /boards                         -> list board ids in the data directory
///   GET  /boards/{boardId}/snapshot      -> current snapshot (+ ETag, If-None-Match)
///   POST /boards/{boardId}/reorder       -> submit a proposed layout
///   POST /boards/{boardId}/refresh       -> drop the cached snapshot
///   GET  /events                         -> SSE stream of audit events
///   GET  /status                         -> health check
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/boards", get(board::list_boards))
        .route("/boards/{board_id}/snapshot", get(board::get_snapshot))
        .route("/boards/{board_id}/reorder", post(board::reorder))
        .route("/boards/{board_id}/refresh", post(board::refresh))
        .route("/events", get(events::sse_events))
        .route("/status", get(events::status))
}

// ── Shared types and helpers used across sub-modules ────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    /// Machine-readable failure class, e.g. `stale` or `busy`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: None,
            detail: None,
        }
    }
}

fn insert_header_safe(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match value.parse() {
        Ok(parsed) => {
            headers.insert(name, parsed);
        }
        Err(e) => {
            log::warn!(target: "lanes.api", "Failed to set header {}={} ({})", name, value, e);
        }
    }
}

fn log_api_issue(status: StatusCode, target: &'static str, message: impl AsRef<str>) {
    let message = message.as_ref();
    if status.is_server_error() {
        log::error!(target: target, "{}", message);
    } else {
        log::warn!(target: target, "{}", message);
    }
}
