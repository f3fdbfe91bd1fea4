//! Resume queue: re-entrant execution requests for parked or interrupted
//! transactions.
//!
//! # Locking Protocol
//!
//! 1. `claim` atomically selects an available message and locks it for
//!    `lock_duration`
//! 2. The consumer resumes the transaction
//! 3. `ack` deletes the message, `release` makes it available again after a delay
//! 4. If a consumer dies, the lock expires and another consumer can claim it

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, TransactionId, TransactionStoreError, WorkflowId};

pub use memory::InMemoryResumeQueue;
pub use postgres::PostgresResumeQueue;

/// Why a transaction should be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeReason {
    /// A parked step received its external success or failure signal.
    StepSignal,
    /// Startup recovery found the transaction incomplete.
    Recovery,
}

impl ResumeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResumeReason::StepSignal => "step_signal",
            ResumeReason::Recovery => "recovery",
        }
    }
}

impl std::str::FromStr for ResumeReason {
    type Err = TransactionStoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "step_signal" => Ok(ResumeReason::StepSignal),
            "recovery" => Ok(ResumeReason::Recovery),
            other => Err(TransactionStoreError::Corrupt(format!(
                "unknown resume reason '{other}'"
            ))),
        }
    }
}

/// A request to continue the walk of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeMessage {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub transaction_id: TransactionId,
    pub reason: ResumeReason,
    pub enqueued_at: DateTime<Utc>,
    /// Number of times the message has been claimed (including the current claim).
    pub attempts: u32,
}

impl ResumeMessage {
    pub fn new(
        workflow_id: WorkflowId,
        transaction_id: TransactionId,
        reason: ResumeReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            transaction_id,
            reason,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Scheduling backend for re-entrant execution.
#[async_trait]
pub trait ResumeQueue: Send + Sync {
    /// Adds a message to the queue; it is immediately available.
    async fn enqueue(&self, message: ResumeMessage) -> Result<()>;

    /// Claims the oldest available message, locking it for `lock_duration`.
    ///
    /// Returns `None` if nothing is available.
    async fn claim(&self, worker_id: &str, lock_duration: Duration)
    -> Result<Option<ResumeMessage>>;

    /// Removes a processed message.
    async fn ack(&self, id: Uuid) -> Result<()>;

    /// Unlocks a message so it becomes available again after `delay`.
    async fn release(&self, id: Uuid, delay: Duration) -> Result<()>;
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
