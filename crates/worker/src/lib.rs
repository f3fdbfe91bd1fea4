//! Workflow worker host.
//!
//! Runs the resume worker that continues parked and interrupted
//! transactions, and serves HTTP endpoints for starting runs, delivering
//! step signals and inspecting transactions, with structured logging
//! (tracing) and Prometheus metrics.

pub mod checkout;
pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use orchestrator::{EngineConfig, TransactionOrchestrator, WorkflowRegistry};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use transaction_store::{ResumeQueue, TransactionStore};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub registry: Arc<WorkflowRegistry>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    use routes::{system, transactions};

    let metrics_router = Router::new()
        .route("/metrics", get(system::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(system::health))
        .route("/workflows/{workflow_id}/transactions", post(transactions::run))
        .route(
            "/workflows/{workflow_id}/transactions/{transaction_id}",
            get(transactions::get),
        )
        .route(
            "/workflows/{workflow_id}/transactions/{transaction_id}/cancel",
            post(transactions::cancel),
        )
        .route(
            "/workflows/{workflow_id}/transactions/{transaction_id}/steps/{step_id}/success",
            post(transactions::step_success),
        )
        .route(
            "/workflows/{workflow_id}/transactions/{transaction_id}/steps/{step_id}/failure",
            post(transactions::step_failure),
        )
        .route(
            "/workflows/{workflow_id}/transactions/{transaction_id}/steps/{step_id}/retry",
            post(transactions::retry_step),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the orchestrator and a sealed registry holding every hosted workflow.
pub async fn create_registry(
    store: Arc<dyn TransactionStore>,
    queue: Option<Arc<dyn ResumeQueue>>,
    engine: EngineConfig,
) -> orchestrator::Result<Arc<WorkflowRegistry>> {
    let mut orchestrator = TransactionOrchestrator::new(store).with_config(engine);
    if let Some(queue) = queue {
        orchestrator = orchestrator.with_queue(queue);
    }

    let registry = WorkflowRegistry::new(Arc::new(orchestrator));
    checkout::register(&registry).await?;
    registry.seal();
    Ok(Arc::new(registry))
}

/// Deletes terminal transactions past their retention every `interval`
/// until `shutdown` flips to true.
pub async fn run_purge_loop(
    registry: Arc<WorkflowRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match registry.orchestrator().purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!(purged, "expired transactions purged"),
                    Err(e) => tracing::error!(kind = "infrastructure", error = %e, "purge failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
