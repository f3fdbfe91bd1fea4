//! Workflow registry and per-workflow handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::RwLock;
use transaction_store::{TransactionId, TransactionSnapshot, WorkflowId};

use crate::container::Container;
use crate::engine::{RunOutcome, RunRequest, StepSignal, TransactionOrchestrator};
use crate::error::{Result, WorkflowError};
use crate::flow::{FlowBuilder, FlowDefinition};
use crate::step::StepError;

/// Holds every workflow of an application.
///
/// Workflows are registered during initialization; [`seal`](Self::seal)
/// ends that phase. The registry is shared explicitly (usually behind an
/// `Arc`) with whoever needs to run or resume workflows.
pub struct WorkflowRegistry {
    orchestrator: Arc<TransactionOrchestrator>,
    container: Container,
    workflows: RwLock<HashMap<WorkflowId, Arc<FlowDefinition>>>,
    sealed: AtomicBool,
}

impl WorkflowRegistry {
    pub fn new(orchestrator: Arc<TransactionOrchestrator>) -> Self {
        Self {
            orchestrator,
            container: Container::new(),
            workflows: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Sets the container handed to steps when a run does not supply one.
    pub fn with_container(mut self, container: Container) -> Self {
        self.container = container;
        self
    }

    pub fn orchestrator(&self) -> &Arc<TransactionOrchestrator> {
        &self.orchestrator
    }

    /// Defines a workflow by running `compose` against a fresh builder.
    ///
    /// Returns `false` without calling `compose` if the id is already
    /// registered.
    pub async fn register_workflow<F>(
        &self,
        workflow_id: impl Into<WorkflowId>,
        compose: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut FlowBuilder) -> Result<()>,
    {
        let workflow_id = workflow_id.into();
        if self.sealed.load(Ordering::Acquire) {
            return Err(WorkflowError::RegistrySealed(workflow_id));
        }

        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow_id) {
            tracing::debug!(%workflow_id, "workflow already registered");
            return Ok(false);
        }

        let flow = FlowDefinition::build(workflow_id.clone(), compose)?;
        tracing::info!(%workflow_id, steps = flow.steps().len(), "workflow registered");
        workflows.insert(workflow_id, Arc::new(flow));
        Ok(true)
    }

    /// Ends the initialization phase; later registrations fail.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub async fn contains(&self, workflow_id: &WorkflowId) -> bool {
        self.workflows.read().await.contains_key(workflow_id)
    }

    pub async fn workflow_ids(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<WorkflowId> = self.workflows.read().await.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub async fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<WorkflowHandle> {
        let flow = self
            .workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.clone()))?;

        Ok(WorkflowHandle {
            flow,
            orchestrator: self.orchestrator.clone(),
            container: self.container.clone(),
        })
    }
}

/// Runs and controls the transactions of one workflow.
#[derive(Clone)]
pub struct WorkflowHandle {
    flow: Arc<FlowDefinition>,
    orchestrator: Arc<TransactionOrchestrator>,
    container: Container,
}

impl WorkflowHandle {
    pub fn workflow_id(&self) -> &WorkflowId {
        self.flow.workflow_id()
    }

    pub fn flow(&self) -> &Arc<FlowDefinition> {
        &self.flow
    }

    /// Starts a transaction with a generated id.
    pub async fn run(&self, input: Value) -> Result<RunOutcome> {
        self.run_with(RunRequest::new(input)).await
    }

    pub async fn run_with(&self, mut request: RunRequest) -> Result<RunOutcome> {
        if request.container.is_none() {
            request.container = Some(self.container.clone());
        }
        self.orchestrator.run(&self.flow, request).await
    }

    pub async fn cancel(&self, transaction_id: impl Into<TransactionId>) -> Result<RunOutcome> {
        self.orchestrator
            .cancel(&self.flow, &transaction_id.into(), &self.container)
            .await
    }

    pub async fn resume(&self, transaction_id: impl Into<TransactionId>) -> Result<RunOutcome> {
        self.orchestrator
            .resume(&self.flow, &transaction_id.into(), &self.container)
            .await
    }

    /// Completes the parked invoke of `step_id`.
    pub async fn register_step_success(
        &self,
        transaction_id: impl Into<TransactionId>,
        step_id: &str,
        response: Value,
    ) -> Result<RunOutcome> {
        let signal = StepSignal::invoke(self.workflow_id().clone(), transaction_id, step_id);
        self.set_step_success(signal, response).await
    }

    /// Fails the parked invoke of `step_id`.
    pub async fn register_step_failure(
        &self,
        transaction_id: impl Into<TransactionId>,
        step_id: &str,
        error: StepError,
    ) -> Result<RunOutcome> {
        let signal = StepSignal::invoke(self.workflow_id().clone(), transaction_id, step_id);
        self.set_step_failure(signal, error).await
    }

    pub async fn set_step_success(&self, signal: StepSignal, response: Value) -> Result<RunOutcome> {
        self.check_signal(&signal)?;
        self.orchestrator
            .set_step_success(&self.flow, signal, response, &self.container)
            .await
    }

    pub async fn set_step_failure(&self, signal: StepSignal, error: StepError) -> Result<RunOutcome> {
        self.check_signal(&signal)?;
        self.orchestrator
            .set_step_failure(&self.flow, signal, error, &self.container)
            .await
    }

    pub async fn retry_step(
        &self,
        transaction_id: impl Into<TransactionId>,
        step_id: &str,
    ) -> Result<RunOutcome> {
        self.orchestrator
            .retry_step(&self.flow, &transaction_id.into(), step_id, &self.container)
            .await
    }

    pub async fn get_transaction(
        &self,
        transaction_id: impl Into<TransactionId>,
    ) -> Result<TransactionSnapshot> {
        self.orchestrator
            .get_transaction(self.workflow_id(), &transaction_id.into())
            .await
    }

    fn check_signal(&self, signal: &StepSignal) -> Result<()> {
        if &signal.workflow_id != self.workflow_id() {
            return Err(WorkflowError::WorkflowNotFound(signal.workflow_id.clone()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("workflow_id", self.workflow_id())
            .finish_non_exhaustive()
    }
}
