use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Result, StepKey, StepRecord, StepTable, TransactionHeader, TransactionId, TransactionQuery,
    TransactionSnapshot, TransactionStoreError, WorkflowId,
};

/// Core trait for transaction state store implementations.
///
/// The store is a pure key-value ledger: it never interprets step semantics.
/// Step records are addressed by `(workflow, transaction, step, action)` and
/// every write to a key replaces the previous value (last write wins).
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts a new transaction header.
    ///
    /// Fails with `AlreadyExists` if a transaction with the same key exists.
    async fn create_transaction(&self, header: &TransactionHeader) -> Result<()>;

    /// Inserts or replaces a transaction header.
    async fn save_transaction(&self, header: &TransactionHeader) -> Result<()>;

    /// Loads the header and every step record of a transaction.
    ///
    /// Fails with `NotFound` if the transaction does not exist.
    async fn get_transaction(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<TransactionSnapshot>;

    /// Inserts or replaces the record stored under `key`.
    async fn save_step(&self, key: &StepKey, record: &StepRecord) -> Result<()>;

    /// Loads every step record of a transaction.
    ///
    /// Returns an empty table if the transaction has no records.
    async fn load_all(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<StepTable>;

    /// Lists transaction headers matching a query, oldest update first.
    async fn list_transactions(&self, query: TransactionQuery) -> Result<Vec<TransactionHeader>>;

    /// Deletes a transaction and all of its step records.
    ///
    /// Returns false if nothing was stored under that key.
    async fn delete_transaction(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<bool>;
}

/// Extension trait providing convenience methods for transaction stores.
#[async_trait]
pub trait TransactionStoreExt: TransactionStore {
    /// Loads a transaction, returning None instead of `NotFound`.
    async fn find_transaction(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<Option<TransactionSnapshot>> {
        match self.get_transaction(workflow_id, transaction_id).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(TransactionStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deletes every terminal transaction last updated before `cutoff`.
    ///
    /// Returns the number of deleted transactions.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let expired = self
            .list_transactions(TransactionQuery::terminal().updated_before(cutoff))
            .await?;

        let mut purged = 0;
        for header in expired {
            if self
                .delete_transaction(&header.workflow_id, &header.transaction_id)
                .await?
            {
                purged += 1;
            }
        }

        if purged > 0 {
            metrics::counter!("workflow_transactions_purged").increment(purged);
            tracing::info!(purged, %cutoff, "purged expired transactions");
        }
        Ok(purged)
    }
}

// Blanket implementation for all TransactionStore implementations
impl<T: TransactionStore + ?Sized> TransactionStoreExt for T {}
