use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use lanes_core::coordinator::LockPolicy;
use lanes_core::error::ReconcileError;
use lanes_core::storage::local::JsonFileStore;
use lanes_core::storage::StoreError;
use lanes_core::types::BoardSnapshot;
use serde::Deserialize;

use super::{insert_header_safe, log_api_issue, ErrorResponse};
use crate::state::AppState;

/// Seconds a client should wait before retrying a busy board.
const BUSY_RETRY_AFTER_SECS: &str = "1";

type ApiError = (StatusCode, HeaderMap, Json<ErrorResponse>);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderBody {
    /// Proposed layout; its `fingerprint` is that of the snapshot it was edited from.
    snapshot: BoardSnapshot,
    actor: String,
    /// Overrides the configured lock wait for this request.
    #[serde(default)]
    wait_ms: Option<u64>,
}

/// Strong validator derived from the layout, stable across session restarts.
fn etag_for(snapshot: &BoardSnapshot) -> String {
    format!("\"{}\"", snapshot.fingerprint)
}

fn not_found(board_id: &str, target: &'static str) -> ApiError {
    let status = StatusCode::NOT_FOUND;
    let error = format!("Board not found: {}", board_id);
    log_api_issue(status, target, &error);
    (status, HeaderMap::new(), Json(ErrorResponse::new(error)))
}

pub(crate) fn error_status(error: &ReconcileError) -> StatusCode {
    match error {
        ReconcileError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ReconcileError::Busy { .. } => StatusCode::LOCKED,
        ReconcileError::Stale { .. } => StatusCode::CONFLICT,
        ReconcileError::TransientStorage { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ReconcileError::PermanentStorage {
            source: StoreError::BoardNotFound(_),
            ..
        } => StatusCode::NOT_FOUND,
        ReconcileError::PermanentStorage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reconcile_error_response(
    error: ReconcileError,
    target: &'static str,
    context: &str,
) -> ApiError {
    let status = error_status(&error);
    log_api_issue(status, target, format!("{}: {}", context, error));

    let mut headers = HeaderMap::new();
    if matches!(error, ReconcileError::Busy { .. }) {
        insert_header_safe(&mut headers, "retry-after", BUSY_RETRY_AFTER_SECS);
    }
    let detail = match &error {
        ReconcileError::Stale { reason, .. } => serde_json::to_value(reason).ok(),
        _ => None,
    };
    (
        status,
        headers,
        Json(ErrorResponse {
            error: error.to_string(),
            kind: Some(error.kind()),
            detail,
        }),
    )
}

pub async fn list_boards(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let boards = state.store.list_boards().await.map_err(|e| {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        log_api_issue(status, "lanes.api.list_boards", format!("Failed to list boards: {}", e));
        (status, HeaderMap::new(), Json(ErrorResponse::new(e.to_string())))
    })?;
    Ok(Json(serde_json::json!({ "boards": boards })))
}

pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(board_id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, HeaderMap, Json<serde_json::Value>), ApiError> {
    if !JsonFileStore::is_valid_board_id(&board_id) {
        return Err(not_found(&board_id, "lanes.api.get_snapshot"));
    }
    let snapshot = state.engine.get_snapshot(&board_id).await.map_err(|e| {
        reconcile_error_response(
            e,
            "lanes.api.get_snapshot",
            &format!("Failed to load board {}", board_id),
        )
    })?;

    let etag = etag_for(&snapshot);
    let mut resp_headers = HeaderMap::new();
    insert_header_safe(&mut resp_headers, "etag", &etag);

    // Check If-None-Match for conditional response
    if let Some(if_none_match) = headers.get("if-none-match") {
        if let Ok(value) = if_none_match.to_str() {
            if value == etag {
                return Ok((
                    StatusCode::NOT_MODIFIED,
                    resp_headers,
                    Json(serde_json::json!({})),
                ));
            }
        }
    }

    Ok((
        StatusCode::OK,
        resp_headers,
        Json(serde_json::json!({
            "snapshot": &*snapshot,
            "status": state.engine.session_state(&board_id),
        })),
    ))
}

/// POST /boards/{board_id}/reorder -- reconcile a proposed layout with the board.
pub async fn reorder(
    State(state): State<AppState>,
    Path(board_id): Path<String>,
    Json(body): Json<ReorderBody>,
) -> Result<(StatusCode, HeaderMap, Json<serde_json::Value>), ApiError> {
    if !JsonFileStore::is_valid_board_id(&board_id) {
        return Err(not_found(&board_id, "lanes.api.reorder"));
    }
    if body.actor.trim().is_empty() {
        let status = StatusCode::BAD_REQUEST;
        log_api_issue(
            status,
            "lanes.api.reorder",
            format!("Missing actor for reorder on board {}", board_id),
        );
        return Err((
            status,
            HeaderMap::new(),
            Json(ErrorResponse::new("Missing or empty actor")),
        ));
    }

    let policy = body
        .wait_ms
        .map(LockPolicy::from_millis)
        .unwrap_or_else(|| state.engine.config().lock_policy());
    let applied = state
        .engine
        .submit_reorder_with(&board_id, &body.snapshot, body.actor.trim(), policy)
        .await
        .map_err(|e| {
            reconcile_error_response(
                e,
                "lanes.api.reorder",
                &format!("Reorder by {} on board {} failed", body.actor, board_id),
            )
        })?;

    let mut resp_headers = HeaderMap::new();
    insert_header_safe(&mut resp_headers, "etag", &etag_for(&applied.snapshot));

    Ok((
        StatusCode::OK,
        resp_headers,
        Json(serde_json::json!({
            "applied": !applied.is_noop(),
            "version": applied.snapshot.version,
            "fingerprint": applied.snapshot.fingerprint,
            "mutations": applied.mutations,
            "warnings": applied.warnings,
            "auditEvents": applied.audit_events,
            "snapshot": &*applied.snapshot,
        })),
    ))
}

/// POST /boards/{board_id}/refresh -- the store changed outside the engine.
pub async fn refresh(
    State(state): State<AppState>,
    Path(board_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !JsonFileStore::is_valid_board_id(&board_id) {
        return Err(not_found(&board_id, "lanes.api.refresh"));
    }
    state.engine.invalidate(&board_id);
    log::info!(target: "lanes.api.refresh", "Board {} marked for refetch", board_id);
    Ok(Json(serde_json::json!({ "success": true })))
}
