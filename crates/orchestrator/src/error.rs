//! Workflow engine error types.

use thiserror::Error;
use transaction_store::{TransactionId, TransactionStatus, TransactionStoreError, WorkflowId};

/// Errors that can occur while defining or executing workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A step with the same id was already registered in this flow.
    #[error("Step '{step_id}' is already registered in workflow '{workflow_id}'")]
    DuplicateStep {
        workflow_id: WorkflowId,
        step_id: String,
    },

    /// No step with this id exists in the flow.
    #[error("Unknown step '{step_id}' in workflow '{workflow_id}'")]
    UnknownStep {
        workflow_id: WorkflowId,
        step_id: String,
    },

    /// A step's invoke action failed.
    #[error("Step '{step_id}' failed on attempt {attempt}: {message}")]
    StepInvoke {
        step_id: String,
        attempt: u32,
        message: String,
    },

    /// A step's compensating action failed.
    #[error("Compensation of step '{step_id}' failed: {message}")]
    StepCompensate { step_id: String, message: String },

    /// A step failed on every attempt its retry policy allowed.
    #[error("Step '{step_id}' exhausted {attempts} attempts: {message}")]
    RetryExhausted {
        step_id: String,
        attempts: u32,
        message: String,
    },

    /// No transaction exists for the given id.
    #[error("Transaction not found: {workflow_id}/{transaction_id}")]
    TransactionNotFound {
        workflow_id: WorkflowId,
        transaction_id: TransactionId,
    },

    /// No workflow is registered under this id.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    /// The registry no longer accepts registrations.
    #[error("Workflow registry is sealed, cannot register '{0}'")]
    RegistrySealed(WorkflowId),

    /// The flow definition is malformed.
    #[error("Invalid flow definition for '{workflow_id}': {reason}")]
    InvalidFlow {
        workflow_id: WorkflowId,
        reason: String,
    },

    /// The transaction or step is in the wrong state for the operation.
    #[error("Invalid state for {transaction_id}: {reason} (status: {status})")]
    InvalidState {
        transaction_id: TransactionId,
        status: TransactionStatus,
        reason: String,
    },

    /// Transaction store error.
    #[error("Transaction store error: {0}")]
    Store(#[from] TransactionStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    pub(crate) fn invalid_flow(workflow_id: &WorkflowId, reason: impl Into<String>) -> Self {
        WorkflowError::InvalidFlow {
            workflow_id: workflow_id.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn from_store(err: TransactionStoreError) -> Self {
        match err {
            TransactionStoreError::NotFound {
                workflow_id,
                transaction_id,
            } => WorkflowError::TransactionNotFound {
                workflow_id,
                transaction_id,
            },
            other => WorkflowError::Store(other),
        }
    }
}

/// Convenience type alias for workflow results.
pub type Result<T> = std::result::Result<T, WorkflowError>;
