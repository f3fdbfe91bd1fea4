//! Persisted transaction headers and step execution records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{ActionType, StepStatus, TransactionStatus};
use crate::{TransactionId, WorkflowId};

/// Classification of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Error returned by a step's own logic.
    Domain,
    /// Error the step marked as not worth retrying.
    Permanent,
    /// The attempt exceeded its configured timeout.
    Timeout,
    /// The step failed on every attempt its retry policy allowed.
    RetryExhausted,
    /// The engine itself failed (e.g. a store write).
    Infrastructure,
    /// A compensating action failed.
    Compensation,
}

impl ErrorKind {
    /// Returns the persisted name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Domain => "domain",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Compensation => "compensation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The last error observed by a step action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Addresses one step record: `(workflow, transaction, step, action)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub workflow_id: WorkflowId,
    pub transaction_id: TransactionId,
    pub step_id: String,
    pub action: ActionType,
}

impl StepKey {
    pub fn new(
        workflow_id: WorkflowId,
        transaction_id: TransactionId,
        step_id: impl Into<String>,
        action: ActionType,
    ) -> Self {
        Self {
            workflow_id,
            transaction_id,
            step_id: step_id.into(),
            action,
        }
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.workflow_id, self.transaction_id, self.step_id, self.action
        )
    }
}

/// Execution state of one step action within one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepRecord {
    pub status: StepStatus,

    /// Number of attempts started so far (1-based once invoked).
    pub attempts: u32,

    pub last_error: Option<ErrorRecord>,

    /// Value handed to downstream steps.
    pub response: Option<Value>,

    /// Value handed to the compensating action, captured at completion.
    pub compensation_input: Option<Value>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Earliest time the next retry may start.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Position of this completion in the transaction's actual completion order.
    pub completion_seq: Option<i64>,
}

impl StepRecord {
    /// Creates a record in `NotStarted` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of attempt `attempt`.
    pub fn mark_invoking(&mut self, attempt: u32) {
        self.status = StepStatus::Invoking;
        self.attempts = attempt;
        self.next_attempt_at = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Records a successful completion.
    pub fn mark_done(&mut self, response: Value, compensation_input: Option<Value>, seq: i64) {
        self.status = StepStatus::Done;
        self.response = Some(response);
        self.compensation_input = compensation_input;
        self.completed_at = Some(Utc::now());
        self.completion_seq = Some(seq);
        self.next_attempt_at = None;
    }

    /// Records a failed attempt that will be retried at `next_attempt_at`.
    pub fn mark_waiting_for_retry(&mut self, error: ErrorRecord, next_attempt_at: DateTime<Utc>) {
        self.status = StepStatus::WaitingForRetry;
        self.last_error = Some(error);
        self.next_attempt_at = Some(next_attempt_at);
    }

    /// Records a permanent failure.
    pub fn mark_failed(&mut self, error: ErrorRecord) {
        self.status = StepStatus::Failed;
        self.last_error = Some(error);
        self.completed_at = Some(Utc::now());
        self.next_attempt_at = None;
    }

    /// Parks the step until an external signal arrives.
    pub fn mark_pending(&mut self) {
        self.status = StepStatus::Pending;
    }

    pub fn mark_skipped(&mut self) {
        self.status = StepStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }

    /// Records a finished compensating action.
    pub fn mark_reverted(&mut self) {
        self.status = StepStatus::Reverted;
        self.completed_at = Some(Utc::now());
    }
}

/// All step records of one transaction, addressed by step id and action.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepTable {
    records: BTreeMap<String, BTreeMap<ActionType, StepRecord>>,
}

impl StepTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, step_id: &str, action: ActionType) -> Option<&StepRecord> {
        self.records.get(step_id).and_then(|r| r.get(&action))
    }

    /// Inserts or replaces the record for `(step_id, action)`.
    pub fn insert(&mut self, step_id: impl Into<String>, action: ActionType, record: StepRecord) {
        self.records
            .entry(step_id.into())
            .or_default()
            .insert(action, record);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ActionType, &StepRecord)> {
        self.records.iter().flat_map(|(step_id, actions)| {
            actions
                .iter()
                .map(move |(action, record)| (step_id.as_str(), *action, record))
        })
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest completion sequence assigned so far.
    pub fn max_completion_seq(&self) -> i64 {
        self.iter()
            .filter_map(|(_, _, r)| r.completion_seq)
            .max()
            .unwrap_or(0)
    }
}

/// An error surfaced to the caller of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionError {
    pub step_id: String,
    pub action: ActionType,
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
}

/// Transaction-level state, stored separately from the step records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionHeader {
    pub workflow_id: WorkflowId,
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub input: Value,
    pub result: Option<Value>,
    pub errors: Vec<TransactionError>,
    pub event_group_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionHeader {
    /// Creates a header for a transaction that has not started yet.
    pub fn new(workflow_id: WorkflowId, transaction_id: TransactionId, input: Value) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            transaction_id,
            status: TransactionStatus::NotStarted,
            input,
            result: None,
            errors: Vec::new(),
            event_group_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the event group id.
    pub fn with_event_group(mut self, event_group_id: Option<String>) -> Self {
        self.event_group_id = event_group_id;
        self
    }

    /// Moves the transaction to `status` and bumps `updated_at`.
    pub fn transition(&mut self, status: TransactionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// A full, point-in-time view of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub header: TransactionHeader,
    pub steps: StepTable,
}

impl TransactionSnapshot {
    pub fn status(&self) -> TransactionStatus {
        self.header.status
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.header.transaction_id
    }

    pub fn result(&self) -> Option<&Value> {
        self.header.result.as_ref()
    }

    pub fn errors(&self) -> &[TransactionError] {
        &self.header.errors
    }

    /// Returns the invoke record of a step.
    pub fn invoke(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.get(step_id, ActionType::Invoke)
    }

    /// Returns the compensate record of a step.
    pub fn compensation(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.get(step_id, ActionType::Compensate)
    }
}
