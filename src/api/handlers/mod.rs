use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

use super::AppState;
use crate::models::*;
use crate::persistence::PersistenceError;

// ============================================================
// Error Handling
// ============================================================

/// Log an internal error and return a sanitized response to the client.
fn internal_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    tracing::error!("Internal error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

/// Bad names and malformed updates are the client's fault and are reported
/// as-is; anything else is internal.
fn persistence_error(e: PersistenceError) -> (StatusCode, String) {
    match e {
        PersistenceError::InvalidTreeName(_) | PersistenceError::InvalidUpdate { .. } => {
            tracing::warn!("Rejected request: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        other => internal_error(other),
    }
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Builds
// ============================================================

pub async fn trigger_build(State(state): State<AppState>) -> impl IntoResponse {
    state.builds.request();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    )
}

pub async fn build_status(
    State(state): State<AppState>,
) -> Result<Json<BuildStatusResponse>, (StatusCode, String)> {
    let last_build = state.db.get_last_build_record().map_err(internal_error)?;
    Ok(Json(BuildStatusResponse {
        status: state.builds.status(),
        last_build,
    }))
}

// ============================================================
// Trees
// ============================================================

pub async fn list_trees(
    State(state): State<AppState>,
) -> Result<Json<Vec<Tree>>, (StatusCode, String)> {
    state.db.list_trees().map(Json).map_err(internal_error)
}

pub async fn load_tree(
    State(state): State<AppState>,
    Path(tree): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let content = state.persistence.on_load(&tree).map_err(persistence_error)?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], content))
}

pub async fn store_tree(
    State(state): State<AppState>,
    Path(tree): Path<String>,
    body: Bytes,
) -> Result<Json<StoreReceipt>, (StatusCode, String)> {
    state
        .persistence
        .on_store(&tree, &body)
        .map(|revision| Json(StoreReceipt { revision }))
        .map_err(persistence_error)
}
