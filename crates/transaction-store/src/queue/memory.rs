use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ResumeMessage, ResumeQueue, to_chrono};
use crate::Result;

#[derive(Debug)]
struct QueuedMessage {
    message: ResumeMessage,
    available_at: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
    locked_by: Option<String>,
}

impl QueuedMessage {
    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now && self.locked_until.is_none_or(|until| until < now)
    }
}

/// In-process resume queue.
///
/// Follows the same claim/ack/release protocol as the PostgreSQL queue so
/// the resume worker can be exercised without a database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryResumeQueue {
    messages: Arc<Mutex<Vec<QueuedMessage>>>,
}

impl InMemoryResumeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued messages, locked or not.
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns the worker currently holding the lock on a message.
    pub async fn locked_by(&self, id: Uuid) -> Option<String> {
        self.messages
            .lock()
            .await
            .iter()
            .find(|m| m.message.id == id)
            .and_then(|m| m.locked_by.clone())
    }
}

#[async_trait]
impl ResumeQueue for InMemoryResumeQueue {
    async fn enqueue(&self, message: ResumeMessage) -> Result<()> {
        let available_at = message.enqueued_at;
        self.messages.lock().await.push(QueuedMessage {
            message,
            available_at,
            locked_until: None,
            locked_by: None,
        });
        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ResumeMessage>> {
        let now = Utc::now();
        let mut messages = self.messages.lock().await;

        let next = messages
            .iter_mut()
            .filter(|m| m.is_claimable(now))
            .min_by_key(|m| m.available_at);

        Ok(next.map(|queued| {
            queued.locked_until = Some(now + to_chrono(lock_duration));
            queued.locked_by = Some(worker_id.to_string());
            queued.message.attempts += 1;
            queued.message.clone()
        }))
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        self.messages.lock().await.retain(|m| m.message.id != id);
        Ok(())
    }

    async fn release(&self, id: Uuid, delay: Duration) -> Result<()> {
        let mut messages = self.messages.lock().await;
        if let Some(queued) = messages.iter_mut().find(|m| m.message.id == id) {
            queued.locked_until = None;
            queued.locked_by = None;
            queued.available_at = Utc::now() + to_chrono(delay);
        }
        Ok(())
    }
}
