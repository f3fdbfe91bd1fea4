//! Workflow lifecycle events and the sinks that receive them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use transaction_store::{ErrorKind, TransactionId, WorkflowId};

/// Events emitted while a transaction runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkflowEvent {
    /// A new transaction was created and its forward walk began.
    TransactionStarted,

    /// A step attempt started.
    StepStarted(StepData),

    /// A step completed successfully.
    StepCompleted(StepData),

    /// A step failed and will not be retried.
    StepFailed(StepFailedData),

    /// A step attempt failed and a retry is scheduled.
    StepRetryScheduled(StepRetryData),

    /// A step was skipped (branch not taken or missing input).
    StepSkipped(StepData),

    /// A step returned the pending marker; the transaction is parked.
    StepParked(StepData),

    /// The reverse walk started.
    CompensationStarted,

    /// A compensating action completed.
    CompensationStepCompleted(StepData),

    /// A completed step had no compensating action.
    CompensationStepSkipped(StepData),

    /// A compensating action failed (recorded, compensation continues).
    CompensationStepFailed(StepFailedData),

    /// Every step settled and the result is available.
    TransactionCompleted,

    /// Compensation finished without errors.
    TransactionReverted,

    /// Compensation finished with at least one failed compensating action.
    TransactionFailed,
}

impl WorkflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::TransactionStarted => "TransactionStarted",
            WorkflowEvent::StepStarted(_) => "StepStarted",
            WorkflowEvent::StepCompleted(_) => "StepCompleted",
            WorkflowEvent::StepFailed(_) => "StepFailed",
            WorkflowEvent::StepRetryScheduled(_) => "StepRetryScheduled",
            WorkflowEvent::StepSkipped(_) => "StepSkipped",
            WorkflowEvent::StepParked(_) => "StepParked",
            WorkflowEvent::CompensationStarted => "CompensationStarted",
            WorkflowEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            WorkflowEvent::CompensationStepSkipped(_) => "CompensationStepSkipped",
            WorkflowEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            WorkflowEvent::TransactionCompleted => "TransactionCompleted",
            WorkflowEvent::TransactionReverted => "TransactionReverted",
            WorkflowEvent::TransactionFailed => "TransactionFailed",
        }
    }

    /// Returns the step the event refers to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::StepStarted(d)
            | WorkflowEvent::StepCompleted(d)
            | WorkflowEvent::StepSkipped(d)
            | WorkflowEvent::StepParked(d)
            | WorkflowEvent::CompensationStepCompleted(d)
            | WorkflowEvent::CompensationStepSkipped(d) => Some(&d.step_id),
            WorkflowEvent::StepFailed(d) | WorkflowEvent::CompensationStepFailed(d) => {
                Some(&d.step_id)
            }
            WorkflowEvent::StepRetryScheduled(d) => Some(&d.step_id),
            WorkflowEvent::TransactionStarted
            | WorkflowEvent::CompensationStarted
            | WorkflowEvent::TransactionCompleted
            | WorkflowEvent::TransactionReverted
            | WorkflowEvent::TransactionFailed => None,
        }
    }
}

/// Data for step lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub step_id: String,
    pub attempt: u32,
}

/// Data for failure events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_id: String,
    pub attempt: u32,
    pub kind: ErrorKind,
    pub error: String,
}

/// Data for StepRetryScheduled events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRetryData {
    pub step_id: String,
    /// The attempt that just failed.
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub error: String,
}

// Convenience constructors
impl WorkflowEvent {
    pub fn step_started(step_id: impl Into<String>, attempt: u32) -> Self {
        WorkflowEvent::StepStarted(StepData {
            step_id: step_id.into(),
            attempt,
        })
    }

    pub fn step_completed(step_id: impl Into<String>, attempt: u32) -> Self {
        WorkflowEvent::StepCompleted(StepData {
            step_id: step_id.into(),
            attempt,
        })
    }

    pub fn step_failed(
        step_id: impl Into<String>,
        attempt: u32,
        kind: ErrorKind,
        error: impl Into<String>,
    ) -> Self {
        WorkflowEvent::StepFailed(StepFailedData {
            step_id: step_id.into(),
            attempt,
            kind,
            error: error.into(),
        })
    }

    pub fn step_retry_scheduled(
        step_id: impl Into<String>,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        WorkflowEvent::StepRetryScheduled(StepRetryData {
            step_id: step_id.into(),
            attempt,
            next_attempt_at,
            error: error.into(),
        })
    }

    pub fn step_skipped(step_id: impl Into<String>) -> Self {
        WorkflowEvent::StepSkipped(StepData {
            step_id: step_id.into(),
            attempt: 0,
        })
    }

    pub fn step_parked(step_id: impl Into<String>, attempt: u32) -> Self {
        WorkflowEvent::StepParked(StepData {
            step_id: step_id.into(),
            attempt,
        })
    }

    pub fn compensation_step_completed(step_id: impl Into<String>) -> Self {
        WorkflowEvent::CompensationStepCompleted(StepData {
            step_id: step_id.into(),
            attempt: 1,
        })
    }

    pub fn compensation_step_skipped(step_id: impl Into<String>) -> Self {
        WorkflowEvent::CompensationStepSkipped(StepData {
            step_id: step_id.into(),
            attempt: 0,
        })
    }

    pub fn compensation_step_failed(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        WorkflowEvent::CompensationStepFailed(StepFailedData {
            step_id: step_id.into(),
            attempt: 1,
            kind: ErrorKind::Compensation,
            error: error.into(),
        })
    }
}

/// An event together with the transaction it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub workflow_id: WorkflowId,
    pub transaction_id: TransactionId,
    pub event_group_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub event: WorkflowEvent,
}

/// Receives lifecycle notifications.
///
/// Emission is fire-and-forget: a sink must not fail the transaction.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: LifecycleEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(
            workflow_id = %event.workflow_id,
            transaction_id = %event.transaction_id,
            event_type = event.event.event_type(),
            step = event.event.step_id(),
            "workflow event"
        );
    }
}

/// Fans events out to any number of in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}
