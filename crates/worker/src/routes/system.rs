//! Health and Prometheus endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub workflows: Vec<String>,
}

/// GET /health: liveness plus the workflows this worker can resume.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let workflows = state
        .registry
        .workflow_ids()
        .await
        .into_iter()
        .map(|id| id.as_str().to_string())
        .collect();

    Json(HealthResponse {
        status: "ok",
        workflows,
    })
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}
