//! API route definitions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::state::AppState;
use crate::identity::{Handle, RequestId};
use crate::model::{ModelError, ModelParams};
use crate::telemetry::TelemetryEvent;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/model", get(get_model).put(put_model))
        .route("/events", post(ingest_events))
        .route("/requests/{id}", get(get_request))
        .route("/handles/{handle}", get(get_handle))
        .route("/outliers", get(list_outliers))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn not_found(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "data": null, "meta": { "message": message } })),
    )
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": { "status": "ok", "version": env!("CARGO_PKG_VERSION") },
        "meta": meta()
    }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.engine.stats(), "meta": meta() }))
}

async fn get_model(State(state): State<AppState>) -> Json<Value> {
    let model = state.engine.model();
    Json(json!({
        "data": model.snapshot(),
        "meta": { "loaded": model.is_centroids_loaded(), "clusters": model.clusters() }
    }))
}

async fn put_model(
    State(state): State<AppState>,
    Json(params): Json<ModelParams>,
) -> (StatusCode, Json<Value>) {
    match state.engine.model().install(&params) {
        Ok(()) => {
            info!(clusters = params.baselines.len(), "model installed via API");
            (
                StatusCode::OK,
                Json(json!({ "data": { "loaded": state.engine.model().is_centroids_loaded() }, "meta": meta() })),
            )
        }
        Err(e) => {
            warn!(error = %e, "rejected model install");
            let status = match e {
                ModelError::AlreadyLoaded => StatusCode::CONFLICT,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (
                status,
                Json(json!({ "data": null, "meta": { "message": e.to_string() } })),
            )
        }
    }
}

async fn ingest_events(
    State(state): State<AppState>,
    Json(events): Json<Vec<TelemetryEvent>>,
) -> Json<Value> {
    for event in &events {
        state.engine.apply(event);
    }
    Json(json!({ "data": { "applied": events.len() }, "meta": meta() }))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> (StatusCode, Json<Value>) {
    match state.engine.request(id) {
        Some(view) => (StatusCode::OK, Json(json!({ "data": view, "meta": meta() }))),
        None => not_found(format!("no request {id}")),
    }
}

async fn get_handle(
    State(state): State<AppState>,
    Path(handle): Path<Handle>,
) -> (StatusCode, Json<Value>) {
    match state.engine.request_for_handle(handle) {
        Some(view) => (StatusCode::OK, Json(json!({ "data": view, "meta": meta() }))),
        None => not_found(format!("no request associated with handle {handle}")),
    }
}

/// Scans the whole score arena, so it runs off the async workers.
async fn list_outliers(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || engine.outliers()).await {
        Ok(outliers) => (
            StatusCode::OK,
            Json(json!({ "data": outliers, "meta": { "total": outliers.len() } })),
        ),
        Err(e) => {
            warn!(error = %e, "outlier scan failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "data": null, "meta": { "message": e.to_string() } })),
            )
        }
    }
}
