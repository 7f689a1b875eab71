//! Operational endpoints for the sync machinery.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::error;

use crate::bootstrap::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/sync/bulk", post(start_bulk))
        .route("/api/v1/sync/bulk/{id}", get(bulk_progress))
        .route("/api/v1/sync/bulk/{id}/cancel", post(cancel_bulk))
        .route("/api/v1/sync/queue/drain", post(drain_queue))
        .route("/api/v1/sync/queue/stats", get(queue_stats))
        .with_state(state)
}

async fn start_bulk(State(state): State<AppState>) -> Response {
    match state.bulk.start().await {
        Ok(sync_id) => {
            (StatusCode::ACCEPTED, Json(json!({"sync_id": sync_id}))).into_response()
        }
        Err(err) => internal_error("bulk sync start failed", err),
    }
}

async fn bulk_progress(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.bulk.progress(&id) {
        Some(progress) => Json(progress).into_response(),
        None => {
            (StatusCode::NOT_FOUND, Json(json!({"error": format!("unknown sync id `{id}`")})))
                .into_response()
        }
    }
}

async fn cancel_bulk(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.bulk.cancel(&id) {
        Json(json!({"sync_id": id, "cancelled": true})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no running sync with id `{id}`")})),
        )
            .into_response()
    }
}

async fn drain_queue(State(state): State<AppState>) -> Response {
    match state.queue.drain().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => internal_error("queue drain failed", err),
    }
}

async fn queue_stats(State(state): State<AppState>) -> Response {
    match state.queue.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => internal_error("queue stats failed", err),
    }
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    error!(error = %err, "{context}");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": format!("{context}: {err}")})))
        .into_response()
}
