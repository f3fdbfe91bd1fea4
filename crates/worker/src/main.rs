//! Worker entry point.

use std::sync::Arc;

use orchestrator::{EngineConfig, ResumeWorker, recover_incomplete};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use transaction_store::{
    InMemoryResumeQueue, InMemoryTransactionStore, PostgresResumeQueue, PostgresTransactionStore,
    ResumeQueue, TransactionStore,
};
use worker::AppState;
use worker::config::WorkerConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

async fn open_backends(
    config: &WorkerConfig,
) -> Result<(Arc<dyn TransactionStore>, Arc<dyn ResumeQueue>), BoxError> {
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?;
            let store = PostgresTransactionStore::new(pool.clone());
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL transaction store");
            Ok((Arc::new(store), Arc::new(PostgresResumeQueue::new(pool))))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, transactions will not survive a restart");
            Ok((
                Arc::new(InMemoryTransactionStore::new()),
                Arc::new(InMemoryResumeQueue::new()),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = WorkerConfig::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Open backends and register workflows
    let (store, queue) = open_backends(&config).await?;
    let registry =
        worker::create_registry(store.clone(), Some(queue.clone()), EngineConfig::from_env())
            .await?;

    // 4. Schedule whatever a previous process left unfinished
    recover_incomplete(store.as_ref(), queue.as_ref()).await?;

    // 5. Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let resume_worker = ResumeWorker::new(
        registry.clone(),
        queue,
        config.resume_worker(),
        format!("worker-{}", std::process::id()),
    );
    let worker_task = tokio::spawn(resume_worker.run(shutdown_rx.clone()));
    let purge_task = tokio::spawn(worker::run_purge_loop(
        registry.clone(),
        config.purge_interval,
        shutdown_rx,
    ));

    // 6. Serve until a shutdown signal arrives
    let app = worker::create_app(Arc::new(AppState { registry }), metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting worker");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 7. Let the resume worker finish its current message
    shutdown_tx.send_replace(true);
    if let Err(e) = worker_task.await {
        tracing::error!(error = %e, "resume worker task failed");
    }
    if let Err(e) = purge_task.await {
        tracing::error!(error = %e, "purge task failed");
    }

    tracing::info!("worker shut down gracefully");
    Ok(())
}
