//! Persistence for workflow transactions.
//!
//! A transaction is stored as a header (status, input, result, errors) plus
//! one record per `(step, action)` pair. Two backends are provided: an
//! in-process store for short-lived workflows and a PostgreSQL store for
//! workflows that must survive restarts. The [`queue`] module holds the
//! resume queue used to continue parked transactions on any worker.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod queue;
pub mod record;
pub mod state;
pub mod store;

pub use common::{TransactionId, WorkflowId};
pub use error::{Result, TransactionStoreError};
pub use memory::InMemoryTransactionStore;
pub use postgres::PostgresTransactionStore;
pub use query::TransactionQuery;
pub use queue::{
    InMemoryResumeQueue, PostgresResumeQueue, ResumeMessage, ResumeQueue, ResumeReason,
};
pub use record::{
    ErrorKind, ErrorRecord, StepKey, StepRecord, StepTable, TransactionError, TransactionHeader,
    TransactionSnapshot,
};
pub use state::{ActionType, StepStatus, TransactionStatus};
pub use store::{TransactionStore, TransactionStoreExt};
