use chrono::{DateTime, Utc};

use crate::{TransactionStatus, WorkflowId};

/// Builder for listing transaction headers.
///
/// Used by restart recovery (find transactions that are not terminal) and
/// by retention (find terminal transactions older than a cutoff).
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    /// Filter by workflow id.
    pub workflow_id: Option<WorkflowId>,

    /// Filter by status (any of these).
    pub statuses: Option<Vec<TransactionStatus>>,

    /// Only transactions last updated strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,

    /// Maximum number of headers to return.
    pub limit: Option<usize>,
}

impl TransactionQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query matching every transaction that is not terminal.
    pub fn incomplete() -> Self {
        Self {
            statuses: Some(vec![
                TransactionStatus::NotStarted,
                TransactionStatus::Invoking,
                TransactionStatus::WaitingToCompensate,
                TransactionStatus::Compensating,
            ]),
            ..Default::default()
        }
    }

    /// Creates a query matching every terminal transaction.
    pub fn terminal() -> Self {
        Self {
            statuses: Some(vec![
                TransactionStatus::Done,
                TransactionStatus::Reverted,
                TransactionStatus::Failed,
            ]),
            ..Default::default()
        }
    }

    /// Filters by workflow id.
    pub fn workflow_id(mut self, workflow_id: impl Into<WorkflowId>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Filters by a single status.
    pub fn status(mut self, status: TransactionStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    /// Filters by last update time.
    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }

    /// Limits the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns status names for SQL binding.
    pub(crate) fn status_names(&self) -> Option<Vec<String>> {
        self.statuses
            .as_ref()
            .map(|s| s.iter().map(|s| s.as_str().to_string()).collect())
    }

    /// Returns true if `header` satisfies every filter (ignores `limit`).
    pub fn matches(&self, header: &crate::TransactionHeader) -> bool {
        if let Some(ref id) = self.workflow_id
            && &header.workflow_id != id
        {
            return false;
        }
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&header.status)
        {
            return false;
        }
        if let Some(cutoff) = self.updated_before
            && header.updated_at >= cutoff
        {
            return false;
        }
        true
    }
}
