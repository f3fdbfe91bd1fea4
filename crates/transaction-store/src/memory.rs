use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    Result, StepKey, StepRecord, StepTable, TransactionHeader, TransactionId, TransactionQuery,
    TransactionSnapshot, TransactionStoreError, WorkflowId, store::TransactionStore,
};

type TransactionKey = (WorkflowId, TransactionId);

/// In-process transaction store.
///
/// State lives in memory and is lost when the process exits. This is the
/// default backend for short-lived, synchronous workflows and for tests.
#[derive(Clone, Default)]
pub struct InMemoryTransactionStore {
    headers: Arc<RwLock<HashMap<TransactionKey, TransactionHeader>>>,
    steps: Arc<RwLock<HashMap<TransactionKey, StepTable>>>,
    fail_step_writes: Arc<AtomicBool>,
}

impl InMemoryTransactionStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored transactions.
    pub async fn transaction_count(&self) -> usize {
        self.headers.read().await.len()
    }

    /// Clears all transactions and step records.
    pub async fn clear(&self) {
        self.headers.write().await.clear();
        self.steps.write().await.clear();
    }

    /// Makes subsequent `save_step` calls fail, simulating a backend outage.
    pub fn set_fail_step_writes(&self, fail: bool) {
        self.fail_step_writes.store(fail, Ordering::SeqCst);
    }

    fn key(workflow_id: &WorkflowId, transaction_id: &TransactionId) -> TransactionKey {
        (workflow_id.clone(), transaction_id.clone())
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn create_transaction(&self, header: &TransactionHeader) -> Result<()> {
        let key = Self::key(&header.workflow_id, &header.transaction_id);
        let mut headers = self.headers.write().await;

        if headers.contains_key(&key) {
            return Err(TransactionStoreError::AlreadyExists {
                workflow_id: header.workflow_id.clone(),
                transaction_id: header.transaction_id.clone(),
            });
        }

        headers.insert(key, header.clone());
        Ok(())
    }

    async fn save_transaction(&self, header: &TransactionHeader) -> Result<()> {
        let key = Self::key(&header.workflow_id, &header.transaction_id);
        self.headers.write().await.insert(key, header.clone());
        Ok(())
    }

    async fn get_transaction(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<TransactionSnapshot> {
        let key = Self::key(workflow_id, transaction_id);
        let header = self.headers.read().await.get(&key).cloned().ok_or_else(|| {
            TransactionStoreError::NotFound {
                workflow_id: workflow_id.clone(),
                transaction_id: transaction_id.clone(),
            }
        })?;
        let steps = self
            .steps
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_default();

        Ok(TransactionSnapshot { header, steps })
    }

    async fn save_step(&self, key: &StepKey, record: &StepRecord) -> Result<()> {
        if self.fail_step_writes.load(Ordering::SeqCst) {
            return Err(TransactionStoreError::Unavailable(format!(
                "write rejected for {key}"
            )));
        }

        let mut steps = self.steps.write().await;
        steps
            .entry(Self::key(&key.workflow_id, &key.transaction_id))
            .or_default()
            .insert(key.step_id.clone(), key.action, record.clone());
        Ok(())
    }

    async fn load_all(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<StepTable> {
        let steps = self.steps.read().await;
        Ok(steps
            .get(&Self::key(workflow_id, transaction_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_transactions(&self, query: TransactionQuery) -> Result<Vec<TransactionHeader>> {
        let headers = self.headers.read().await;
        let mut matching: Vec<_> = headers
            .values()
            .filter(|h| query.matches(h))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then(a.transaction_id.cmp(&b.transaction_id))
        });

        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn delete_transaction(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<bool> {
        let key = Self::key(workflow_id, transaction_id);
        let removed = self.headers.write().await.remove(&key).is_some();
        self.steps.write().await.remove(&key);
        Ok(removed)
    }
}
