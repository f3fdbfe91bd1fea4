//! Identifier types shared across the workflow engine crates.

pub mod types;

pub use types::{TransactionId, WorkflowId};
