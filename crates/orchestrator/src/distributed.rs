//! Distributed execution: resume messages consumed by background workers.
//!
//! When the orchestrator is configured with a [`ResumeQueue`], external step
//! signals enqueue a resume message instead of continuing the walk in the
//! caller. A [`ResumeWorker`] (one or more per process) claims messages,
//! resolves the workflow from the registry and continues the transaction.
//!
//! # Lifecycle
//!
//! 1. Poll for an available message at `poll_interval`
//! 2. Claim it (atomic lock with expiry)
//! 3. Look up the workflow by id
//! 4. Resume (or cancel) the transaction
//! 5. Ack, or release with a delay when the resume failed
//! 6. Repeat until the shutdown signal

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use transaction_store::{
    ResumeMessage, ResumeQueue, ResumeReason, TransactionQuery, TransactionStore,
};

use crate::error::{Result, WorkflowError};
use crate::workflow::WorkflowRegistry;

/// Resume worker settings.
#[derive(Debug, Clone)]
pub struct ResumeWorkerConfig {
    pub poll_interval: Duration,
    /// How long a claimed message stays invisible to other workers.
    pub lock_duration: Duration,
    /// Delay before a failed resume is attempted again.
    pub retry_delay: Duration,
    /// Deliveries after which a message is dropped.
    pub max_deliveries: u32,
}

impl Default for ResumeWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lock_duration: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            max_deliveries: 10,
        }
    }
}

/// Consumes resume messages until shut down.
pub struct ResumeWorker {
    registry: Arc<WorkflowRegistry>,
    queue: Arc<dyn ResumeQueue>,
    config: ResumeWorkerConfig,
    worker_id: String,
}

impl ResumeWorker {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        queue: Arc<dyn ResumeQueue>,
        config: ResumeWorkerConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            queue,
            config,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs the poll loop until `shutdown` flips to true.
    ///
    /// A message being processed when the signal arrives is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.config.poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "resume worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    // Drain everything available before waiting for the next tick
                    loop {
                        match self.process_one().await {
                            Ok(true) => continue,
                            Ok(false) => break,
                            Err(e) => {
                                error!(kind = "infrastructure", error = %e, "resume queue error");
                                break;
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "resume worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Claims and handles one message; returns false if the queue was empty.
    pub async fn process_one(&self) -> Result<bool> {
        let Some(message) = self
            .queue
            .claim(&self.worker_id, self.config.lock_duration)
            .await?
        else {
            return Ok(false);
        };

        debug!(
            message_id = %message.id,
            workflow_id = %message.workflow_id,
            transaction_id = %message.transaction_id,
            reason = message.reason.as_str(),
            delivery = message.attempts,
            "processing resume message"
        );

        if message.attempts > self.config.max_deliveries {
            warn!(
                message_id = %message.id,
                transaction_id = %message.transaction_id,
                deliveries = message.attempts,
                "resume message exceeded max deliveries, dropping"
            );
            self.queue.ack(message.id).await?;
            return Ok(true);
        }

        match self.handle(&message).await {
            Ok(()) => {
                self.queue.ack(message.id).await?;
            }
            Err(WorkflowError::WorkflowNotFound(workflow_id)) => {
                warn!(message_id = %message.id, %workflow_id, "resume message for unknown workflow, dropping");
                self.queue.ack(message.id).await?;
            }
            Err(WorkflowError::TransactionNotFound { transaction_id, .. }) => {
                warn!(message_id = %message.id, %transaction_id, "resume message for missing transaction, dropping");
                self.queue.ack(message.id).await?;
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "resume failed, releasing message");
                self.queue.release(message.id, self.config.retry_delay).await?;
            }
        }
        Ok(true)
    }

    async fn handle(&self, message: &ResumeMessage) -> Result<()> {
        let handle = self.registry.get_workflow(&message.workflow_id).await?;
        let outcome = handle.resume(message.transaction_id.clone()).await?;
        debug!(
            transaction_id = %message.transaction_id,
            reason = message.reason.as_str(),
            status = %outcome.status(),
            "transaction resumed"
        );
        Ok(())
    }
}

/// Enqueues a recovery resume for every transaction that is not terminal.
///
/// Run once at startup so that walks interrupted by a restart continue.
pub async fn recover_incomplete(
    store: &dyn TransactionStore,
    queue: &dyn ResumeQueue,
) -> Result<usize> {
    let headers = store
        .list_transactions(TransactionQuery::incomplete())
        .await?;

    for header in &headers {
        queue
            .enqueue(ResumeMessage::new(
                header.workflow_id.clone(),
                header.transaction_id.clone(),
                ResumeReason::Recovery,
            ))
            .await?;
    }

    if !headers.is_empty() {
        info!(count = headers.len(), "incomplete transactions scheduled for recovery");
    }
    Ok(headers.len())
}
