//! Transaction and step state machines.

use serde::{Deserialize, Serialize};

use crate::TransactionStoreError;

/// The overall status of a transaction.
///
/// State transitions:
/// ```text
/// NotStarted ──► Invoking ──┬──► Done
///                           └──► WaitingToCompensate ──► Compensating ──┬──► Reverted
///                                                                       └──► Failed
/// ```
///
/// A `Done` transaction can still be cancelled, which moves it into
/// `WaitingToCompensate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Transaction has been created but no step has run.
    #[default]
    NotStarted,

    /// Steps are being invoked (or the transaction is parked on a pending step).
    Invoking,

    /// A step failed permanently or the transaction was cancelled.
    WaitingToCompensate,

    /// Compensating actions are running.
    Compensating,

    /// All steps completed (terminal state).
    Done,

    /// Compensation finished without errors (terminal state).
    Reverted,

    /// Compensation finished but at least one compensation failed (terminal state).
    Failed,
}

impl TransactionStatus {
    /// Returns true if the forward walk may still make progress.
    pub fn can_invoke(&self) -> bool {
        matches!(self, TransactionStatus::NotStarted | TransactionStatus::Invoking)
    }

    /// Returns true if the transaction may enter compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(
            self,
            TransactionStatus::NotStarted
                | TransactionStatus::Invoking
                | TransactionStatus::WaitingToCompensate
                | TransactionStatus::Compensating
                | TransactionStatus::Done
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Done | TransactionStatus::Reverted | TransactionStatus::Failed
        )
    }

    /// Returns true if the transaction is in its reverse walk.
    pub fn is_compensating(&self) -> bool {
        matches!(
            self,
            TransactionStatus::WaitingToCompensate | TransactionStatus::Compensating
        )
    }

    /// Returns the persisted name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::NotStarted => "not_started",
            TransactionStatus::Invoking => "invoking",
            TransactionStatus::WaitingToCompensate => "waiting_to_compensate",
            TransactionStatus::Compensating => "compensating",
            TransactionStatus::Done => "done",
            TransactionStatus::Reverted => "reverted",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = TransactionStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(TransactionStatus::NotStarted),
            "invoking" => Ok(TransactionStatus::Invoking),
            "waiting_to_compensate" => Ok(TransactionStatus::WaitingToCompensate),
            "compensating" => Ok(TransactionStatus::Compensating),
            "done" => Ok(TransactionStatus::Done),
            "reverted" => Ok(TransactionStatus::Reverted),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(TransactionStoreError::Corrupt(format!(
                "unknown transaction status '{other}'"
            ))),
        }
    }
}

/// Which side of a step a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// The forward action.
    Invoke,
    /// The undo action.
    Compensate,
}

impl ActionType {
    /// Returns the persisted name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Invoke => "invoke",
            ActionType::Compensate => "compensate",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = TransactionStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoke" => Ok(ActionType::Invoke),
            "compensate" => Ok(ActionType::Compensate),
            other => Err(TransactionStoreError::Corrupt(format!(
                "unknown action type '{other}'"
            ))),
        }
    }
}

/// The status of a single step action within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    Invoking,
    /// Parked until an external success/failure signal arrives.
    Pending,
    WaitingForRetry,
    Done,
    Failed,
    Skipped,
    /// Compensation of a completed step finished.
    Reverted,
}

impl StepStatus {
    /// Returns true if the action will not change again without an explicit request.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            StepStatus::Done | StepStatus::Failed | StepStatus::Skipped | StepStatus::Reverted
        )
    }

    /// Returns true if successors may treat this action as satisfied.
    pub fn unblocks_successors(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Skipped)
    }

    /// Returns the persisted name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::NotStarted => "not_started",
            StepStatus::Invoking => "invoking",
            StepStatus::Pending => "pending",
            StepStatus::WaitingForRetry => "waiting_for_retry",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Reverted => "reverted",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = TransactionStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(StepStatus::NotStarted),
            "invoking" => Ok(StepStatus::Invoking),
            "pending" => Ok(StepStatus::Pending),
            "waiting_for_retry" => Ok(StepStatus::WaitingForRetry),
            "done" => Ok(StepStatus::Done),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            "reverted" => Ok(StepStatus::Reverted),
            other => Err(TransactionStoreError::Corrupt(format!(
                "unknown step status '{other}'"
            ))),
        }
    }
}
