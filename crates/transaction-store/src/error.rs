use thiserror::Error;

use crate::{TransactionId, WorkflowId};

/// Errors that can occur when interacting with the transaction store.
#[derive(Debug, Error)]
pub enum TransactionStoreError {
    /// No transaction exists for the given workflow and transaction id.
    #[error("Transaction not found: {workflow_id}/{transaction_id}")]
    NotFound {
        workflow_id: WorkflowId,
        transaction_id: TransactionId,
    },

    /// A transaction with the same key was created concurrently.
    #[error("Transaction already exists: {workflow_id}/{transaction_id}")]
    AlreadyExists {
        workflow_id: WorkflowId,
        transaction_id: TransactionId,
    },

    /// The backend rejected the operation (e.g. connection lost).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for transaction store operations.
pub type Result<T> = std::result::Result<T, TransactionStoreError>;
