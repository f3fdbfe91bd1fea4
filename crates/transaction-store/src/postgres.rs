use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    ActionType, ErrorRecord, Result, StepKey, StepRecord, StepTable, TransactionError,
    TransactionHeader, TransactionId, TransactionQuery, TransactionSnapshot, TransactionStoreError,
    WorkflowId, store::TransactionStore,
};

/// PostgreSQL-backed transaction store.
///
/// Durable backend for asynchronous and long-running workflows that must
/// survive process restarts.
#[derive(Clone)]
pub struct PostgresTransactionStore {
    pool: PgPool,
}

impl PostgresTransactionStore {
    /// Creates a new PostgreSQL transaction store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_header(row: &PgRow) -> Result<TransactionHeader> {
        let status: String = row.try_get("status")?;
        let errors: serde_json::Value = row.try_get("errors")?;
        let errors: Vec<TransactionError> = serde_json::from_value(errors)?;

        Ok(TransactionHeader {
            workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
            transaction_id: TransactionId::new(row.try_get::<String, _>("transaction_id")?),
            status: status.parse()?,
            input: row.try_get("input")?,
            result: row.try_get("result")?,
            errors,
            event_group_id: row.try_get("event_group_id")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn row_to_step(row: &PgRow) -> Result<(String, ActionType, StepRecord)> {
        let action: String = row.try_get("action")?;
        let status: String = row.try_get("status")?;
        let attempts: i32 = row.try_get("attempts")?;
        let last_error: Option<serde_json::Value> = row.try_get("last_error")?;
        let last_error: Option<ErrorRecord> = last_error.map(serde_json::from_value).transpose()?;

        let record = StepRecord {
            status: status.parse()?,
            attempts: u32::try_from(attempts).map_err(|_| {
                TransactionStoreError::Corrupt(format!("negative attempt count {attempts}"))
            })?,
            last_error,
            response: row.try_get("response")?,
            compensation_input: row.try_get("compensation_input")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            completion_seq: row.try_get("completion_seq")?,
        };

        Ok((row.try_get("step_id")?, action.parse()?, record))
    }

    async fn upsert_header(&self, header: &TransactionHeader) -> Result<()> {
        let errors = serde_json::to_value(&header.errors)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_transactions
                (workflow_id, transaction_id, status, input, result, errors, event_group_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (workflow_id, transaction_id) DO UPDATE SET
                status = EXCLUDED.status,
                input = EXCLUDED.input,
                result = EXCLUDED.result,
                errors = EXCLUDED.errors,
                event_group_id = EXCLUDED.event_group_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(header.workflow_id.as_str())
        .bind(header.transaction_id.as_str())
        .bind(header.status.as_str())
        .bind(&header.input)
        .bind(&header.result)
        .bind(errors)
        .bind(&header.event_group_id)
        .bind(header.created_at)
        .bind(header.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TransactionStore for PostgresTransactionStore {
    async fn create_transaction(&self, header: &TransactionHeader) -> Result<()> {
        let errors = serde_json::to_value(&header.errors)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_transactions
                (workflow_id, transaction_id, status, input, result, errors, event_group_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (workflow_id, transaction_id) DO NOTHING
            "#,
        )
        .bind(header.workflow_id.as_str())
        .bind(header.transaction_id.as_str())
        .bind(header.status.as_str())
        .bind(&header.input)
        .bind(&header.result)
        .bind(errors)
        .bind(&header.event_group_id)
        .bind(header.created_at)
        .bind(header.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(TransactionStoreError::AlreadyExists {
                workflow_id: header.workflow_id.clone(),
                transaction_id: header.transaction_id.clone(),
            });
        }
        Ok(())
    }

    async fn save_transaction(&self, header: &TransactionHeader) -> Result<()> {
        self.upsert_header(header).await
    }

    async fn get_transaction(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<TransactionSnapshot> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT workflow_id, transaction_id, status, input, result, errors, event_group_id, created_at, updated_at
            FROM workflow_transactions
            WHERE workflow_id = $1 AND transaction_id = $2
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(transaction_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(TransactionStoreError::NotFound {
                workflow_id: workflow_id.clone(),
                transaction_id: transaction_id.clone(),
            });
        };

        let header = Self::row_to_header(&row)?;
        let steps = self.load_all(workflow_id, transaction_id).await?;
        Ok(TransactionSnapshot { header, steps })
    }

    async fn save_step(&self, key: &StepKey, record: &StepRecord) -> Result<()> {
        let last_error = record
            .last_error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let attempts = i32::try_from(record.attempts).map_err(|_| {
            TransactionStoreError::Corrupt(format!("attempt count {} overflows", record.attempts))
        })?;

        sqlx::query(
            r#"
            INSERT INTO workflow_step_records
                (workflow_id, transaction_id, step_id, action, status, attempts, last_error,
                 response, compensation_input, started_at, completed_at, next_attempt_at, completion_seq)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (workflow_id, transaction_id, step_id, action) DO UPDATE SET
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                last_error = EXCLUDED.last_error,
                response = EXCLUDED.response,
                compensation_input = EXCLUDED.compensation_input,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                next_attempt_at = EXCLUDED.next_attempt_at,
                completion_seq = EXCLUDED.completion_seq
            "#,
        )
        .bind(key.workflow_id.as_str())
        .bind(key.transaction_id.as_str())
        .bind(&key.step_id)
        .bind(key.action.as_str())
        .bind(record.status.as_str())
        .bind(attempts)
        .bind(last_error)
        .bind(&record.response)
        .bind(&record.compensation_input)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.next_attempt_at)
        .bind(record.completion_seq)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_all(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<StepTable> {
        let rows = sqlx::query(
            r#"
            SELECT step_id, action, status, attempts, last_error, response, compensation_input,
                   started_at, completed_at, next_attempt_at, completion_seq
            FROM workflow_step_records
            WHERE workflow_id = $1 AND transaction_id = $2
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(transaction_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut table = StepTable::new();
        for row in &rows {
            let (step_id, action, record) = Self::row_to_step(row)?;
            table.insert(step_id, action, record);
        }
        Ok(table)
    }

    async fn list_transactions(&self, query: TransactionQuery) -> Result<Vec<TransactionHeader>> {
        let mut sql = String::from(
            "SELECT workflow_id, transaction_id, status, input, result, errors, event_group_id, created_at, updated_at FROM workflow_transactions WHERE 1=1",
        );
        let mut param_count = 0;

        // Build dynamic query
        if query.workflow_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND workflow_id = ${param_count}"));
        }
        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.updated_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND updated_at < ${param_count}"));
        }

        sql.push_str(" ORDER BY updated_at ASC, transaction_id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let status_names = query.status_names();
        let mut sqlx_query = sqlx::query(&sql);

        if let Some(ref workflow_id) = query.workflow_id {
            sqlx_query = sqlx_query.bind(workflow_id.as_str());
        }
        if let Some(statuses) = status_names {
            sqlx_query = sqlx_query.bind(statuses);
        }
        if let Some(cutoff) = query.updated_before {
            sqlx_query = sqlx_query.bind(cutoff);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_header).collect()
    }

    async fn delete_transaction(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM workflow_step_records WHERE workflow_id = $1 AND transaction_id = $2",
        )
        .bind(workflow_id.as_str())
        .bind(transaction_id.as_str())
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(
            "DELETE FROM workflow_transactions WHERE workflow_id = $1 AND transaction_id = $2",
        )
        .bind(workflow_id.as_str())
        .bind(transaction_id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }
}
