//! Saga-style workflow orchestration.
//!
//! A workflow is a graph of steps, each with an invoke action and an
//! optional compensating action. Running a workflow creates a transaction
//! whose progress is persisted step by step in a [`TransactionStore`]:
//!
//! 1. Steps run as soon as every step they depend on has completed;
//!    siblings of a parallel group run concurrently
//! 2. Failed attempts are retried with bounded exponential backoff
//! 3. If a step fails for good, completed steps are compensated in
//!    reverse completion order
//! 4. Steps may park the transaction until an external signal arrives
//!
//! Because every transition is persisted, an interrupted transaction
//! resumes exactly where it stopped.
//!
//! [`TransactionStore`]: transaction_store::TransactionStore

pub mod config;
pub mod container;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod registry;
pub mod retry;
pub mod step;
pub mod workflow;

pub use config::EngineConfig;
pub use container::Container;
pub use distributed::{ResumeWorker, ResumeWorkerConfig, recover_incomplete};
pub use engine::{RunOutcome, RunRequest, StepSignal, TransactionOrchestrator};
pub use error::{Result, WorkflowError};
pub use events::{
    BroadcastEventSink, EventSink, LifecycleEvent, TracingEventSink, WorkflowEvent,
};
pub use flow::{FlowBuilder, FlowDefinition, FlowNode, FlowRef, NodeId, StepInput};
pub use registry::StepRegistry;
pub use retry::RetryPolicy;
pub use step::{
    StepContext, StepDefinition, StepError, StepOptions, StepResponse, StepResult,
};
pub use transaction_store::{
    ActionType, StepStatus, TransactionId, TransactionSnapshot, TransactionStatus, WorkflowId,
};
pub use workflow::{WorkflowHandle, WorkflowRegistry};
