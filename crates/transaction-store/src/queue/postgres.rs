use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{ResumeMessage, ResumeQueue, to_chrono};
use crate::{Result, TransactionId, TransactionStoreError, WorkflowId};

/// PostgreSQL-backed resume queue.
///
/// Multiple worker processes can poll the same table; `FOR UPDATE SKIP LOCKED`
/// guarantees each message is handed to a single worker at a time.
#[derive(Clone)]
pub struct PostgresResumeQueue {
    pool: PgPool,
}

impl PostgresResumeQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_message(row: &PgRow) -> Result<ResumeMessage> {
        let reason: String = row.try_get("reason")?;
        let attempts: i32 = row.try_get("attempts")?;

        Ok(ResumeMessage {
            id: row.try_get("id")?,
            workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
            transaction_id: TransactionId::new(row.try_get::<String, _>("transaction_id")?),
            reason: reason.parse()?,
            enqueued_at: row.try_get("enqueued_at")?,
            attempts: u32::try_from(attempts).map_err(|_| {
                TransactionStoreError::Corrupt(format!("negative claim count {attempts}"))
            })?,
        })
    }
}

#[async_trait]
impl ResumeQueue for PostgresResumeQueue {
    #[tracing::instrument(skip(self, message), fields(transaction_id = %message.transaction_id))]
    async fn enqueue(&self, message: ResumeMessage) -> Result<()> {
        let attempts = claim_count(message.attempts)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_resume_queue
                (id, workflow_id, transaction_id, reason, enqueued_at, available_at, attempts)
            VALUES ($1, $2, $3, $4, $5, $5, $6)
            "#,
        )
        .bind(message.id)
        .bind(message.workflow_id.as_str())
        .bind(message.transaction_id.as_str())
        .bind(message.reason.as_str())
        .bind(message.enqueued_at)
        .bind(attempts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ResumeMessage>> {
        let now = Utc::now();
        let locked_until = now + to_chrono(lock_duration);

        let row: Option<PgRow> = sqlx::query(
            r#"
            UPDATE workflow_resume_queue
            SET locked_until = $1, locked_by = $2, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM workflow_resume_queue
                WHERE available_at <= $3
                  AND (locked_until IS NULL OR locked_until < $3)
                ORDER BY available_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, workflow_id, transaction_id, reason, enqueued_at, attempts
            "#,
        )
        .bind(locked_until)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM workflow_resume_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, id: Uuid, delay: Duration) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_resume_queue
            SET locked_until = NULL, locked_by = NULL, available_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Utc::now() + to_chrono(delay))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn claim_count(attempts: u32) -> Result<i32> {
    i32::try_from(attempts)
        .map_err(|_| TransactionStoreError::Corrupt(format!("claim count {attempts} overflows")))
}
