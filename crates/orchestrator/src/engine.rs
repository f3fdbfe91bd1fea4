//! Transaction orchestrator.
//!
//! Interprets a [`FlowDefinition`] against one transaction: creates or loads
//! the transaction, invokes every ready step (siblings concurrently),
//! persists each outcome, and on an unrecoverable failure walks back through
//! the completed steps in reverse completion order running their
//! compensating actions.
//!
//! All state lives in the [`TransactionStore`]; the in-memory plan is
//! recomputed from the step records after every step settles, so a walk can
//! resume from any persisted state.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};
use transaction_store::{
    ActionType, ErrorKind, ErrorRecord, ResumeMessage, ResumeQueue, ResumeReason, StepKey,
    StepRecord, StepStatus, StepTable, TransactionError, TransactionHeader, TransactionId,
    TransactionSnapshot, TransactionStatus, TransactionStore, TransactionStoreError,
    TransactionStoreExt, WorkflowId,
};

use crate::config::EngineConfig;
use crate::container::Container;
use crate::error::{Result, WorkflowError};
use crate::events::{EventSink, LifecycleEvent, TracingEventSink, WorkflowEvent};
use crate::flow::{FlowDefinition, NodeId};
use crate::retry::RetryPolicy;
use crate::step::{StepContext, StepDefinition, StepError, StepResponse, StepResult};

type TransactionKey = (WorkflowId, TransactionId);

/// Arguments of a workflow run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub input: Value,
    /// Reuse an id to replay or resume; a fresh id is generated when absent.
    pub transaction_id: Option<TransactionId>,
    pub event_group_id: Option<String>,
    /// Overrides the handle's default container for this run.
    pub container: Option<Container>,
}

impl RunRequest {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<TransactionId>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_event_group(mut self, event_group_id: impl Into<String>) -> Self {
        self.event_group_id = Some(event_group_id.into());
        self
    }

    pub fn with_container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }
}

/// Result of a run, resume, cancel or signal.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The designated output; set only once the transaction is `done`.
    pub result: Option<Value>,
    pub transaction: TransactionSnapshot,
    pub errors: Vec<TransactionError>,
}

impl RunOutcome {
    fn new(header: TransactionHeader, steps: StepTable) -> Self {
        Self::from_snapshot(TransactionSnapshot { header, steps })
    }

    fn from_snapshot(transaction: TransactionSnapshot) -> Self {
        let result = match transaction.status() {
            TransactionStatus::Done => transaction.header.result.clone(),
            _ => None,
        };
        Self {
            result,
            errors: transaction.header.errors.clone(),
            transaction,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.transaction.status()
    }

    pub fn transaction_id(&self) -> &TransactionId {
        self.transaction.transaction_id()
    }

    pub fn is_done(&self) -> bool {
        self.status() == TransactionStatus::Done
    }

    /// True when the walk stopped on a step waiting for an external signal.
    pub fn is_parked(&self) -> bool {
        self.status() == TransactionStatus::Invoking
            && self
                .transaction
                .steps
                .iter()
                .any(|(_, action, r)| action == ActionType::Invoke && r.status == StepStatus::Pending)
    }

    /// Converts the outcome into the flow result or the error that prevented it.
    pub fn into_result(self) -> Result<Value> {
        if self.is_done() {
            return Ok(self.result.unwrap_or(Value::Null));
        }

        let status = self.status();
        match self.errors.into_iter().next() {
            Some(e) => Err(match e.kind {
                ErrorKind::RetryExhausted => WorkflowError::RetryExhausted {
                    step_id: e.step_id,
                    attempts: e.attempt,
                    message: e.message,
                },
                ErrorKind::Compensation => WorkflowError::StepCompensate {
                    step_id: e.step_id,
                    message: e.message,
                },
                _ => WorkflowError::StepInvoke {
                    step_id: e.step_id,
                    attempt: e.attempt,
                    message: e.message,
                },
            }),
            None => Err(WorkflowError::InvalidState {
                transaction_id: self.transaction.header.transaction_id,
                status,
                reason: "transaction did not complete".to_string(),
            }),
        }
    }
}

/// Addresses a parked step action for an external success/failure signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSignal {
    pub workflow_id: WorkflowId,
    pub transaction_id: TransactionId,
    pub step_id: String,
    pub action: ActionType,
}

impl StepSignal {
    /// Signal for the invoke action of `step_id`.
    pub fn invoke(
        workflow_id: impl Into<WorkflowId>,
        transaction_id: impl Into<TransactionId>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            transaction_id: transaction_id.into(),
            step_id: step_id.into(),
            action: ActionType::Invoke,
        }
    }
}

/// Per-transaction serialization point and cancellation flag.
struct TransactionSlot {
    lock: Mutex<()>,
    cancel: watch::Sender<bool>,
}

impl TransactionSlot {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            lock: Mutex::new(()),
            cancel,
        }
    }
}

/// Sends lifecycle events tagged with one transaction's identity.
#[derive(Clone)]
struct Emitter {
    sink: Arc<dyn EventSink>,
    workflow_id: WorkflowId,
    transaction_id: TransactionId,
    event_group_id: Option<String>,
}

impl Emitter {
    fn new(sink: Arc<dyn EventSink>, header: &TransactionHeader) -> Self {
        Self {
            sink,
            workflow_id: header.workflow_id.clone(),
            transaction_id: header.transaction_id.clone(),
            event_group_id: header.event_group_id.clone(),
        }
    }

    async fn emit(&self, event: WorkflowEvent) {
        self.sink
            .emit(LifecycleEvent {
                workflow_id: self.workflow_id.clone(),
                transaction_id: self.transaction_id.clone(),
                event_group_id: self.event_group_id.clone(),
                occurred_at: Utc::now(),
                event,
            })
            .await;
    }

    fn context(&self, step_id: &str, attempt: u32, container: Container, cancel: watch::Receiver<bool>) -> StepContext {
        StepContext::new(
            self.workflow_id.clone(),
            self.transaction_id.clone(),
            self.event_group_id.clone(),
            step_id,
            attempt,
            container,
            cancel,
        )
    }
}

/// Drives flows against transactions.
///
/// One orchestrator is shared by every workflow of a registry. Different
/// transactions run fully concurrently; calls that touch the same
/// transaction are serialized.
pub struct TransactionOrchestrator {
    store: Arc<dyn TransactionStore>,
    events: Arc<dyn EventSink>,
    queue: Option<Arc<dyn ResumeQueue>>,
    config: EngineConfig,
    slots: Mutex<HashMap<TransactionKey, Arc<TransactionSlot>>>,
}

impl TransactionOrchestrator {
    /// Creates an orchestrator that resumes parked transactions inline.
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self {
            store,
            events: Arc::new(TracingEventSink),
            queue: None,
            config: EngineConfig::default(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Routes resumes after external signals through `queue` instead of
    /// continuing the walk in the caller.
    pub fn with_queue(mut self, queue: Arc<dyn ResumeQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    pub fn queue(&self) -> Option<&Arc<dyn ResumeQueue>> {
        self.queue.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs a new transaction, or continues an existing one with the same id.
    ///
    /// A transaction that already reached a terminal state is returned as
    /// stored without invoking any step.
    #[tracing::instrument(
        skip(self, flow, request),
        fields(workflow_id = %flow.workflow_id(), transaction_id = tracing::field::Empty)
    )]
    pub async fn run(&self, flow: &Arc<FlowDefinition>, request: RunRequest) -> Result<RunOutcome> {
        let transaction_id = request
            .transaction_id
            .clone()
            .unwrap_or_else(TransactionId::generate);
        tracing::Span::current().record("transaction_id", tracing::field::display(&transaction_id));

        let key = (flow.workflow_id().clone(), transaction_id);
        let slot = self.slot(&key).await;
        let outcome = {
            let _guard = slot.lock.lock().await;
            self.run_locked(flow, &key, request, &slot).await
        };
        self.release_slot(&key, slot).await;
        outcome
    }

    async fn run_locked(
        &self,
        flow: &Arc<FlowDefinition>,
        key: &TransactionKey,
        request: RunRequest,
        slot: &TransactionSlot,
    ) -> Result<RunOutcome> {
        let container = request.container.unwrap_or_default();

        match self.store.find_transaction(&key.0, &key.1).await? {
            Some(snapshot) if snapshot.status().is_terminal() => {
                debug!(status = %snapshot.status(), "transaction already finished, returning stored outcome");
                Ok(RunOutcome::from_snapshot(snapshot))
            }
            Some(snapshot) => {
                info!(status = %snapshot.status(), "resuming existing transaction");
                self.drive(flow, snapshot.header, snapshot.steps, slot, &container)
                    .await
            }
            None => {
                let header = TransactionHeader::new(key.0.clone(), key.1.clone(), request.input)
                    .with_event_group(request.event_group_id);
                self.store.create_transaction(&header).await?;
                metrics::counter!("workflow_transactions_total", "workflow" => key.0.to_string())
                    .increment(1);
                self.drive(flow, header, StepTable::new(), slot, &container)
                    .await
            }
        }
    }

    /// Continues the walk of a stored transaction.
    #[tracing::instrument(skip(self, flow, container), fields(workflow_id = %flow.workflow_id()))]
    pub async fn resume(
        &self,
        flow: &Arc<FlowDefinition>,
        transaction_id: &TransactionId,
        container: &Container,
    ) -> Result<RunOutcome> {
        let key = (flow.workflow_id().clone(), transaction_id.clone());
        let slot = self.slot(&key).await;
        let outcome = {
            let _guard = slot.lock.lock().await;
            self.resume_locked(flow, &key, &slot, container).await
        };
        self.release_slot(&key, slot).await;
        outcome
    }

    async fn resume_locked(
        &self,
        flow: &Arc<FlowDefinition>,
        key: &TransactionKey,
        slot: &TransactionSlot,
        container: &Container,
    ) -> Result<RunOutcome> {
        let snapshot = self.load(key).await?;
        if snapshot.status().is_terminal() {
            return Ok(RunOutcome::from_snapshot(snapshot));
        }
        self.drive(flow, snapshot.header, snapshot.steps, slot, container)
            .await
    }

    /// Moves a transaction into compensation regardless of step status.
    ///
    /// In-flight steps are not aborted; compensation starts once they settle.
    /// A `done` transaction has all of its steps compensated; a transaction
    /// that is already `reverted` or `failed` is returned unchanged.
    #[tracing::instrument(skip(self, flow, container), fields(workflow_id = %flow.workflow_id()))]
    pub async fn cancel(
        &self,
        flow: &Arc<FlowDefinition>,
        transaction_id: &TransactionId,
        container: &Container,
    ) -> Result<RunOutcome> {
        let key = (flow.workflow_id().clone(), transaction_id.clone());
        let slot = self.slot(&key).await;
        slot.cancel.send_replace(true);

        let outcome = {
            let _guard = slot.lock.lock().await;
            let outcome = self.cancel_locked(flow, &key, &slot, container).await;
            slot.cancel.send_replace(false);
            outcome
        };
        self.release_slot(&key, slot).await;
        outcome
    }

    async fn cancel_locked(
        &self,
        flow: &Arc<FlowDefinition>,
        key: &TransactionKey,
        slot: &TransactionSlot,
        container: &Container,
    ) -> Result<RunOutcome> {
        let snapshot = self.load(key).await?;

        match snapshot.status() {
            TransactionStatus::Reverted | TransactionStatus::Failed => {
                Ok(RunOutcome::from_snapshot(snapshot))
            }
            status => {
                info!(%status, "cancelling transaction");
                let TransactionSnapshot {
                    mut header,
                    mut steps,
                } = snapshot;
                self.compensate(flow, &mut header, &mut steps, slot, container)
                    .await?;
                Ok(RunOutcome::new(header, steps))
            }
        }
    }

    /// Completes a parked step with `response` and continues the walk.
    #[tracing::instrument(skip(self, flow, response, container), fields(step = %signal.step_id))]
    pub async fn set_step_success(
        &self,
        flow: &Arc<FlowDefinition>,
        signal: StepSignal,
        response: Value,
        container: &Container,
    ) -> Result<RunOutcome> {
        self.apply_signal(flow, signal, Ok(response), container).await
    }

    /// Fails a parked step with `error` and continues the walk.
    #[tracing::instrument(skip(self, flow, error, container), fields(step = %signal.step_id))]
    pub async fn set_step_failure(
        &self,
        flow: &Arc<FlowDefinition>,
        signal: StepSignal,
        error: StepError,
        container: &Container,
    ) -> Result<RunOutcome> {
        self.apply_signal(flow, signal, Err(error), container).await
    }

    async fn apply_signal(
        &self,
        flow: &Arc<FlowDefinition>,
        signal: StepSignal,
        outcome: std::result::Result<Value, StepError>,
        container: &Container,
    ) -> Result<RunOutcome> {
        flow.steps().resolve(&signal.step_id)?;

        let key = (flow.workflow_id().clone(), signal.transaction_id.clone());
        let slot = self.slot(&key).await;
        let result = {
            let _guard = slot.lock.lock().await;
            self.apply_signal_locked(flow, &key, &signal, outcome, &slot, container)
                .await
        };
        self.release_slot(&key, slot).await;
        result
    }

    async fn apply_signal_locked(
        &self,
        flow: &Arc<FlowDefinition>,
        key: &TransactionKey,
        signal: &StepSignal,
        outcome: std::result::Result<Value, StepError>,
        slot: &TransactionSlot,
        container: &Container,
    ) -> Result<RunOutcome> {
        let snapshot = self.load(key).await?;
        let status = snapshot.status();
        let invalid = |reason: &str| WorkflowError::InvalidState {
            transaction_id: key.1.clone(),
            status,
            reason: reason.to_string(),
        };

        if signal.action == ActionType::Compensate {
            return Err(invalid("compensating actions cannot be signalled"));
        }
        if !status.can_invoke() {
            return Err(invalid("transaction is no longer invoking"));
        }
        let mut record = match snapshot.invoke(&signal.step_id) {
            Some(record) if record.status == StepStatus::Pending => record.clone(),
            _ => return Err(invalid("step is not pending")),
        };

        let TransactionSnapshot {
            mut header,
            mut steps,
        } = snapshot;
        let step_key = step_key(&header, &signal.step_id, ActionType::Invoke);
        let emitter = Emitter::new(self.events.clone(), &header);

        match outcome {
            Ok(response) => {
                let seq = steps.max_completion_seq() + 1;
                record.mark_done(response.clone(), Some(response), seq);
                self.store.save_step(&step_key, &record).await?;
                emitter
                    .emit(WorkflowEvent::step_completed(&signal.step_id, record.attempts))
                    .await;
            }
            Err(step_error) => {
                let kind = if step_error.is_permanent() {
                    ErrorKind::Permanent
                } else {
                    ErrorKind::Domain
                };
                record.mark_failed(ErrorRecord::new(kind, step_error.message()));
                self.store.save_step(&step_key, &record).await?;
                header.errors.push(TransactionError {
                    step_id: signal.step_id.clone(),
                    action: ActionType::Invoke,
                    kind,
                    message: step_error.message().to_string(),
                    attempt: record.attempts,
                });
                header.transition(header.status);
                self.store.save_transaction(&header).await?;
                emitter
                    .emit(WorkflowEvent::step_failed(
                        &signal.step_id,
                        record.attempts,
                        kind,
                        step_error.message(),
                    ))
                    .await;
            }
        }
        steps.insert(signal.step_id.clone(), ActionType::Invoke, record);

        match &self.queue {
            Some(queue) => {
                queue
                    .enqueue(ResumeMessage::new(
                        header.workflow_id.clone(),
                        header.transaction_id.clone(),
                        ResumeReason::StepSignal,
                    ))
                    .await?;
                debug!("resume scheduled");
                Ok(RunOutcome::new(header, steps))
            }
            None => self.drive(flow, header, steps, slot, container).await,
        }
    }

    /// Moves a failed invoke record back to `not_started` and continues the walk.
    ///
    /// Steps that were skipped because of the failure are re-evaluated.
    #[tracing::instrument(skip(self, flow, container), fields(workflow_id = %flow.workflow_id()))]
    pub async fn retry_step(
        &self,
        flow: &Arc<FlowDefinition>,
        transaction_id: &TransactionId,
        step_id: &str,
        container: &Container,
    ) -> Result<RunOutcome> {
        flow.steps().resolve(step_id)?;

        let key = (flow.workflow_id().clone(), transaction_id.clone());
        let slot = self.slot(&key).await;
        let outcome = {
            let _guard = slot.lock.lock().await;
            self.retry_step_locked(flow, &key, step_id, &slot, container)
                .await
        };
        self.release_slot(&key, slot).await;
        outcome
    }

    async fn retry_step_locked(
        &self,
        flow: &Arc<FlowDefinition>,
        key: &TransactionKey,
        step_id: &str,
        slot: &TransactionSlot,
        container: &Container,
    ) -> Result<RunOutcome> {
        let snapshot = self.load(key).await?;
        let status = snapshot.status();
        let invalid = |reason: &str| WorkflowError::InvalidState {
            transaction_id: key.1.clone(),
            status,
            reason: reason.to_string(),
        };
        if !(status.can_invoke() || status == TransactionStatus::Done) {
            return Err(invalid("transaction has entered compensation"));
        }
        if snapshot.invoke(step_id).map(|r| r.status) != Some(StepStatus::Failed) {
            return Err(invalid("step has not failed"));
        }

        let TransactionSnapshot {
            mut header,
            mut steps,
        } = snapshot;
        let reset: Vec<String> = steps
            .iter()
            .filter(|(id, action, r)| {
                *action == ActionType::Invoke && (*id == step_id || r.status == StepStatus::Skipped)
            })
            .map(|(id, _, _)| id.to_string())
            .collect();

        for id in reset {
            let record = StepRecord::new();
            self.store
                .save_step(&step_key(&header, &id, ActionType::Invoke), &record)
                .await?;
            steps.insert(id, ActionType::Invoke, record);
        }

        header
            .errors
            .retain(|e| !(e.step_id == step_id && e.action == ActionType::Invoke));
        header.result = None;
        header.transition(TransactionStatus::Invoking);
        self.store.save_transaction(&header).await?;
        info!(step = step_id, "step retry requested");

        self.drive(flow, header, steps, slot, container).await
    }

    /// Loads the current snapshot of a transaction.
    pub async fn get_transaction(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> Result<TransactionSnapshot> {
        self.store
            .get_transaction(workflow_id, transaction_id)
            .await
            .map_err(WorkflowError::from_store)
    }

    /// Deletes terminal transactions older than the configured retention.
    ///
    /// Returns 0 when no retention is configured.
    pub async fn purge_expired(&self) -> Result<u64> {
        let Some(retention) = self.config.retention else {
            return Ok(0);
        };
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r));
        match cutoff {
            Some(cutoff) => Ok(self.store.purge_terminal_before(cutoff).await?),
            None => Ok(0),
        }
    }

    async fn load(&self, key: &TransactionKey) -> Result<TransactionSnapshot> {
        self.get_transaction(&key.0, &key.1).await
    }

    async fn slot(&self, key: &TransactionKey) -> Arc<TransactionSlot> {
        self.slots
            .lock()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(TransactionSlot::new()))
            .clone()
    }

    async fn release_slot(&self, key: &TransactionKey, slot: Arc<TransactionSlot>) {
        let mut slots = self.slots.lock().await;
        // The map entry plus our own handle
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key);
        }
    }

    /// Runs the forward walk and, if required, the reverse walk.
    async fn drive(
        &self,
        flow: &Arc<FlowDefinition>,
        mut header: TransactionHeader,
        mut steps: StepTable,
        slot: &TransactionSlot,
        container: &Container,
    ) -> Result<RunOutcome> {
        let emitter = Emitter::new(self.events.clone(), &header);

        if header.status.is_compensating() {
            self.compensate(flow, &mut header, &mut steps, slot, container)
                .await?;
            return Ok(RunOutcome::new(header, steps));
        }

        if header.status == TransactionStatus::NotStarted {
            header.transition(TransactionStatus::Invoking);
            self.store.save_transaction(&header).await?;
            emitter.emit(WorkflowEvent::TransactionStarted).await;
        }

        match self
            .walk_forward(flow, &mut header, &mut steps, slot, container, &emitter)
            .await?
        {
            Forward::Completed => {
                header.result = Some(flow.result(&header.input, &steps));
                header.transition(TransactionStatus::Done);
                self.store.save_transaction(&header).await?;
                emitter.emit(WorkflowEvent::TransactionCompleted).await;

                let workflow = header.workflow_id.to_string();
                metrics::counter!("workflow_transactions_completed", "workflow" => workflow.clone())
                    .increment(1);
                metrics::histogram!("workflow_transaction_duration_seconds", "workflow" => workflow)
                    .record(elapsed_seconds(&header));
                info!(errors = header.errors.len(), "transaction completed");
            }
            Forward::Parked => {
                self.store.save_transaction(&header).await?;
                info!("transaction parked on pending step");
            }
            Forward::Compensate => {
                self.compensate(flow, &mut header, &mut steps, slot, container)
                    .await?;
            }
        }

        Ok(RunOutcome::new(header, steps))
    }

    async fn walk_forward(
        &self,
        flow: &Arc<FlowDefinition>,
        header: &mut TransactionHeader,
        steps: &mut StepTable,
        slot: &TransactionSlot,
        container: &Container,
        emitter: &Emitter,
    ) -> Result<Forward> {
        let cancel = slot.cancel.subscribe();
        let mut tasks: JoinSet<StepOutcome> = JoinSet::new();
        let mut running: HashSet<NodeId> = HashSet::new();
        let mut spawned: HashMap<task::Id, (NodeId, String)> = HashMap::new();
        let mut compensate = false;

        loop {
            if !compensate && *cancel.borrow() {
                info!("cancellation requested, draining in-flight steps");
                compensate = true;
            }

            if !compensate {
                let plan = flow.plan(&header.input, steps);
                if plan.saga_failure {
                    compensate = true;
                } else {
                    for node in plan.newly_skipped {
                        if let Err(e) = self.record_skip(flow, header, steps, node, emitter).await {
                            self.infrastructure_failure(header, flow_step_id(flow, node), 0, &e);
                            compensate = true;
                            break;
                        }
                    }
                    if !compensate {
                        for node in plan.runnable {
                            if running.insert(node) {
                                let task = self.step_task(flow, header, steps, node, &cancel, container, emitter)?;
                                let step_id = task.key.step_id.clone();
                                let handle = tasks.spawn(execute_step(task));
                                spawned.insert(handle.id(), (node, step_id));
                            }
                        }
                    }
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let outcome = match joined {
                Ok((id, outcome)) => {
                    spawned.remove(&id);
                    outcome
                }
                Err(join_error) => {
                    compensate = true;
                    match spawned.remove(&join_error.id()) {
                        Some((node, step_id)) => {
                            running.remove(&node);
                            self.record_lost_task(header, steps, &step_id, &join_error, emitter)
                                .await;
                        }
                        None => {
                            error!(kind = "infrastructure", error = %join_error, "untracked step task aborted");
                        }
                    }
                    continue;
                }
            };
            running.remove(&outcome.node);

            match outcome.result {
                TaskResult::Completed {
                    mut record,
                    response,
                    compensation_input,
                } => {
                    let seq = steps.max_completion_seq() + 1;
                    let compensation_input = compensation_input.unwrap_or_else(|| response.clone());
                    record.mark_done(response, Some(compensation_input), seq);

                    let key = step_key(header, &outcome.step_id, ActionType::Invoke);
                    match self.store.save_step(&key, &record).await {
                        Ok(()) => {
                            emitter
                                .emit(WorkflowEvent::step_completed(&outcome.step_id, record.attempts))
                                .await;
                            debug!(step = %outcome.step_id, seq, "step completed");
                            steps.insert(outcome.step_id, ActionType::Invoke, record);
                        }
                        Err(e) => {
                            // The side effects happened, so the reverse walk still has to undo them
                            self.infrastructure_failure(header, &outcome.step_id, record.attempts, &e);
                            steps.insert(outcome.step_id, ActionType::Invoke, record);
                            compensate = true;
                        }
                    }
                }
                TaskResult::Parked { record } => {
                    emitter
                        .emit(WorkflowEvent::step_parked(&outcome.step_id, record.attempts))
                        .await;
                    info!(step = %outcome.step_id, "step parked, awaiting external signal");
                    steps.insert(outcome.step_id, ActionType::Invoke, record);
                }
                TaskResult::Failed {
                    record,
                    error,
                    saga,
                } => {
                    header.errors.push(error);
                    header.transition(header.status);
                    steps.insert(outcome.step_id.clone(), ActionType::Invoke, record);
                    if let Err(e) = self.store.save_transaction(header).await {
                        self.infrastructure_failure(header, &outcome.step_id, 0, &e);
                        compensate = true;
                    }
                    if saga {
                        compensate = true;
                    } else {
                        info!(step = %outcome.step_id, "non-saga step failed, continuing");
                    }
                }
                TaskResult::Interrupted { record } => {
                    steps.insert(outcome.step_id, ActionType::Invoke, record);
                }
                TaskResult::Infrastructure { attempt, error } => {
                    self.infrastructure_failure(header, &outcome.step_id, attempt, &error);
                    compensate = true;
                }
            }
        }

        if compensate {
            return Ok(Forward::Compensate);
        }
        let plan = flow.plan(&header.input, steps);
        if plan.saga_failure {
            Ok(Forward::Compensate)
        } else if plan.is_complete(flow) {
            Ok(Forward::Completed)
        } else {
            debug!(pending = plan.pending.len(), "walk stopped before completion");
            Ok(Forward::Parked)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step_task(
        &self,
        flow: &Arc<FlowDefinition>,
        header: &TransactionHeader,
        steps: &StepTable,
        node: NodeId,
        cancel: &watch::Receiver<bool>,
        container: &Container,
        emitter: &Emitter,
    ) -> Result<StepTask> {
        let invocation = flow.invocation(node).ok_or_else(|| {
            WorkflowError::invalid_flow(flow.workflow_id(), format!("node {node} is not a step"))
        })?;
        let definition = flow.steps().resolve(&invocation.step_id)?.clone();
        let options = definition.options();

        Ok(StepTask {
            node,
            key: step_key(header, &invocation.step_id, ActionType::Invoke),
            input: flow.resolve(&invocation.input, &header.input, steps),
            record: steps
                .get(&invocation.step_id, ActionType::Invoke)
                .cloned()
                .unwrap_or_default(),
            retry: options.retry.unwrap_or(self.config.retry),
            timeout: options.timeout.or(self.config.step_timeout),
            saga: options.saga,
            definition,
            store: self.store.clone(),
            emitter: emitter.clone(),
            container: container.clone(),
            cancel: cancel.clone(),
        })
    }

    async fn record_skip(
        &self,
        flow: &FlowDefinition,
        header: &TransactionHeader,
        steps: &mut StepTable,
        node: NodeId,
        emitter: &Emitter,
    ) -> std::result::Result<(), TransactionStoreError> {
        let Some(invocation) = flow.invocation(node) else {
            return Ok(());
        };
        let mut record = steps
            .get(&invocation.step_id, ActionType::Invoke)
            .cloned()
            .unwrap_or_default();
        record.mark_skipped();
        self.store
            .save_step(&step_key(header, &invocation.step_id, ActionType::Invoke), &record)
            .await?;
        steps.insert(invocation.step_id.clone(), ActionType::Invoke, record);
        emitter.emit(WorkflowEvent::step_skipped(&invocation.step_id)).await;
        debug!(step = %invocation.step_id, "step skipped");
        Ok(())
    }

    /// Records a step whose task died outside its attempt loop.
    async fn record_lost_task(
        &self,
        header: &mut TransactionHeader,
        steps: &mut StepTable,
        step_id: &str,
        join_error: &task::JoinError,
        emitter: &Emitter,
    ) {
        let message = if join_error.is_panic() {
            "step task panicked".to_string()
        } else {
            format!("step task aborted: {join_error}")
        };
        error!(kind = "infrastructure", step = step_id, error = %join_error, "step task lost");

        let mut record = steps
            .get(step_id, ActionType::Invoke)
            .cloned()
            .unwrap_or_default();
        let attempt = record.attempts;
        record.mark_failed(ErrorRecord::new(ErrorKind::Infrastructure, &message));
        if let Err(e) = self
            .store
            .save_step(&step_key(header, step_id, ActionType::Invoke), &record)
            .await
        {
            error!(kind = "infrastructure", step = step_id, error = %e, "failed to persist lost step");
        }
        emitter
            .emit(WorkflowEvent::step_failed(step_id, attempt, ErrorKind::Infrastructure, &message))
            .await;

        header.errors.push(TransactionError {
            step_id: step_id.to_string(),
            action: ActionType::Invoke,
            kind: ErrorKind::Infrastructure,
            message,
            attempt,
        });
        steps.insert(step_id.to_string(), ActionType::Invoke, record);
    }

    fn infrastructure_failure(
        &self,
        header: &mut TransactionHeader,
        step_id: &str,
        attempt: u32,
        err: &TransactionStoreError,
    ) {
        error!(kind = "infrastructure", step = step_id, error = %err, "transaction store write failed");
        header.errors.push(TransactionError {
            step_id: step_id.to_string(),
            action: ActionType::Invoke,
            kind: ErrorKind::Infrastructure,
            message: err.to_string(),
            attempt,
        });
    }

    /// Reverse walk: compensates completed steps in reverse completion order.
    ///
    /// Compensation is single-attempt and best-effort: failures are recorded
    /// and the walk continues.
    async fn compensate(
        &self,
        flow: &Arc<FlowDefinition>,
        header: &mut TransactionHeader,
        steps: &mut StepTable,
        slot: &TransactionSlot,
        container: &Container,
    ) -> Result<()> {
        let emitter = Emitter::new(self.events.clone(), header);

        if header.status != TransactionStatus::Compensating {
            if header.status != TransactionStatus::WaitingToCompensate {
                header.transition(TransactionStatus::WaitingToCompensate);
                self.store.save_transaction(header).await?;
            }
            emitter.emit(WorkflowEvent::CompensationStarted).await;
            header.result = None;
            header.transition(TransactionStatus::Compensating);
            self.store.save_transaction(header).await?;
            info!("compensation started");
        }

        let mut completed: Vec<(String, i64, Value)> = steps
            .iter()
            .filter(|(_, action, r)| *action == ActionType::Invoke && r.status == StepStatus::Done)
            .map(|(id, _, r)| {
                let input = r
                    .compensation_input
                    .clone()
                    .or_else(|| r.response.clone())
                    .unwrap_or(Value::Null);
                (id.to_string(), r.completion_seq.unwrap_or(0), input)
            })
            .collect();
        completed.sort_by(|a, b| b.1.cmp(&a.1));

        // Any failed compensation or store write ends the transaction as failed
        let mut failed = header
            .errors
            .iter()
            .any(|e| e.action == ActionType::Compensate || e.kind == ErrorKind::Infrastructure);

        for (step_id, _, input) in completed {
            let mut record = steps
                .get(&step_id, ActionType::Compensate)
                .cloned()
                .unwrap_or_default();
            if record.status.is_settled() {
                continue;
            }

            let definition = flow.steps().resolve(&step_id)?.clone();
            let key = step_key(header, &step_id, ActionType::Compensate);

            let result = match self
                .run_compensation(&definition, input, &mut record, &key, slot, container, &emitter)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    error!(kind = "infrastructure", step = %step_id, error = %e, "compensation record write failed");
                    Some(Err(format!("transaction store write failed: {e}")))
                }
            };

            match result {
                None => {
                    emitter
                        .emit(WorkflowEvent::compensation_step_skipped(&step_id))
                        .await;
                    debug!(step = %step_id, "no compensation registered, skipped");
                }
                Some(Ok(())) => {
                    emitter
                        .emit(WorkflowEvent::compensation_step_completed(&step_id))
                        .await;
                    info!(step = %step_id, "step compensated");
                }
                Some(Err(message)) => {
                    failed = true;
                    warn!(
                        error = %WorkflowError::StepCompensate {
                            step_id: step_id.clone(),
                            message: message.clone(),
                        },
                        "compensation failed, continuing"
                    );
                    emitter
                        .emit(WorkflowEvent::compensation_step_failed(&step_id, &message))
                        .await;
                    header.errors.push(TransactionError {
                        step_id: step_id.clone(),
                        action: ActionType::Compensate,
                        kind: ErrorKind::Compensation,
                        message,
                        attempt: 1,
                    });
                }
            }
            steps.insert(step_id, ActionType::Compensate, record);
        }

        let workflow = header.workflow_id.to_string();
        if failed {
            header.transition(TransactionStatus::Failed);
            self.store.save_transaction(header).await?;
            emitter.emit(WorkflowEvent::TransactionFailed).await;
            metrics::counter!("workflow_transactions_failed", "workflow" => workflow.clone())
                .increment(1);
            warn!(errors = header.errors.len(), "transaction failed, compensation incomplete");
        } else {
            header.transition(TransactionStatus::Reverted);
            self.store.save_transaction(header).await?;
            emitter.emit(WorkflowEvent::TransactionReverted).await;
            metrics::counter!("workflow_transactions_reverted", "workflow" => workflow.clone())
                .increment(1);
            info!(errors = header.errors.len(), "transaction reverted");
        }
        metrics::histogram!("workflow_transaction_duration_seconds", "workflow" => workflow)
            .record(elapsed_seconds(header));
        Ok(())
    }

    /// Runs one compensating action and persists its record.
    ///
    /// Returns `None` when the step has no compensating action.
    #[allow(clippy::too_many_arguments)]
    async fn run_compensation(
        &self,
        definition: &StepDefinition,
        input: Value,
        record: &mut StepRecord,
        key: &StepKey,
        slot: &TransactionSlot,
        container: &Container,
        emitter: &Emitter,
    ) -> std::result::Result<Option<std::result::Result<(), String>>, TransactionStoreError> {
        if !definition.has_compensation() {
            record.mark_skipped();
            self.store.save_step(key, record).await?;
            return Ok(None);
        }

        record.mark_invoking(1);
        self.store.save_step(key, record).await?;

        let ctx = emitter.context(definition.id(), 1, container.clone(), slot.cancel.subscribe());
        let timeout = definition.options().timeout.or(self.config.step_timeout);
        let result = match definition.compensate(input, ctx) {
            Some(compensation) => match timeout {
                Some(limit) => match tokio::time::timeout(limit, compensation).await {
                    Ok(result) => result.map_err(|e| e.message().to_string()),
                    Err(_) => Err(format!("compensation timed out after {}ms", limit.as_millis())),
                },
                None => compensation.await.map_err(|e| e.message().to_string()),
            },
            None => Ok(()),
        };

        match &result {
            Ok(()) => record.mark_reverted(),
            Err(message) => record.mark_failed(ErrorRecord::new(ErrorKind::Compensation, message)),
        }
        self.store.save_step(key, record).await?;
        Ok(Some(result))
    }
}

enum Forward {
    Completed,
    Parked,
    Compensate,
}

fn step_key(header: &TransactionHeader, step_id: &str, action: ActionType) -> StepKey {
    StepKey::new(
        header.workflow_id.clone(),
        header.transaction_id.clone(),
        step_id,
        action,
    )
}

fn flow_step_id(flow: &FlowDefinition, node: NodeId) -> &str {
    flow.invocation(node).map(|i| i.step_id.as_str()).unwrap_or("")
}

fn elapsed_seconds(header: &TransactionHeader) -> f64 {
    (Utc::now() - header.created_at)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Everything a spawned step attempt loop needs.
struct StepTask {
    node: NodeId,
    key: StepKey,
    definition: StepDefinition,
    input: Value,
    record: StepRecord,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    saga: bool,
    store: Arc<dyn TransactionStore>,
    emitter: Emitter,
    container: Container,
    cancel: watch::Receiver<bool>,
}

struct StepOutcome {
    node: NodeId,
    step_id: String,
    result: TaskResult,
}

enum TaskResult {
    Completed {
        record: StepRecord,
        response: Value,
        compensation_input: Option<Value>,
    },
    Parked {
        record: StepRecord,
    },
    Failed {
        record: StepRecord,
        error: TransactionError,
        saga: bool,
    },
    /// Cancelled while waiting for a retry.
    Interrupted {
        record: StepRecord,
    },
    Infrastructure {
        attempt: u32,
        error: TransactionStoreError,
    },
}

/// Attempt loop of one step: invoke, persist, back off and retry.
async fn execute_step(task: StepTask) -> StepOutcome {
    let node = task.node;
    let step_id = task.key.step_id.clone();
    let result = attempt_loop(task).await;
    StepOutcome {
        node,
        step_id,
        result,
    }
}

async fn attempt_loop(mut task: StepTask) -> TaskResult {
    let step_id = task.key.step_id.clone();
    let mut record = std::mem::take(&mut task.record);

    let mut attempt = match record.status {
        // The process stopped mid-attempt; run the same attempt again
        StepStatus::Invoking => record.attempts.max(1),
        StepStatus::WaitingForRetry => {
            let wait = record
                .next_attempt_at
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or(Duration::ZERO);
            if !wait.is_zero() && !sleep_unless_cancelled(wait, &mut task.cancel).await {
                return TaskResult::Interrupted { record };
            }
            record.attempts + 1
        }
        _ => 1,
    };

    loop {
        record.mark_invoking(attempt);
        if let Err(error) = task.store.save_step(&task.key, &record).await {
            return TaskResult::Infrastructure { attempt, error };
        }
        metrics::counter!("workflow_step_attempts_total", "step" => step_id.clone()).increment(1);
        task.emitter
            .emit(WorkflowEvent::step_started(&step_id, attempt))
            .await;

        let ctx = task.emitter.context(
            &step_id,
            attempt,
            task.container.clone(),
            task.cancel.clone(),
        );
        let invocation = guarded_invoke(&task.definition, task.input.clone(), ctx);
        let result = match task.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result.map_err(|e| (e, ErrorKind::Domain)),
                Err(_) => Err((
                    StepError::failed(format!("attempt timed out after {}ms", limit.as_millis())),
                    ErrorKind::Timeout,
                )),
            },
            None => invocation.await.map_err(|e| (e, ErrorKind::Domain)),
        };

        let (step_error, kind) = match result {
            Ok(StepResponse::Completed {
                response,
                compensation_input,
            }) => {
                return TaskResult::Completed {
                    record,
                    response,
                    compensation_input,
                };
            }
            Ok(StepResponse::Pending) => {
                record.mark_pending();
                if let Err(error) = task.store.save_step(&task.key, &record).await {
                    return TaskResult::Infrastructure { attempt, error };
                }
                return TaskResult::Parked { record };
            }
            Err((step_error, _)) if step_error.is_permanent() => (step_error, ErrorKind::Permanent),
            Err(failure) => failure,
        };

        if !step_error.is_permanent() && task.retry.should_retry(attempt) {
            let next_attempt_at = task.retry.next_attempt_at(attempt);
            record.mark_waiting_for_retry(
                ErrorRecord::new(kind, step_error.message()),
                next_attempt_at,
            );
            if let Err(error) = task.store.save_step(&task.key, &record).await {
                return TaskResult::Infrastructure { attempt, error };
            }

            metrics::counter!("workflow_step_retries_total", "step" => step_id.clone()).increment(1);
            warn!(
                step = %step_id,
                attempt,
                error = %step_error,
                "step attempt failed, retry scheduled"
            );
            task.emitter
                .emit(WorkflowEvent::step_retry_scheduled(
                    &step_id,
                    attempt,
                    next_attempt_at,
                    step_error.message(),
                ))
                .await;

            if !sleep_unless_cancelled(task.retry.backoff_duration(attempt), &mut task.cancel).await {
                return TaskResult::Interrupted { record };
            }
            attempt += 1;
            continue;
        }

        let kind = if kind == ErrorKind::Permanent || task.retry.max_attempts <= 1 {
            kind
        } else {
            ErrorKind::RetryExhausted
        };
        record.mark_failed(ErrorRecord::new(kind, step_error.message()));
        if let Err(error) = task.store.save_step(&task.key, &record).await {
            return TaskResult::Infrastructure { attempt, error };
        }

        warn!(
            step = %step_id,
            attempt,
            %kind,
            error = %WorkflowError::StepInvoke {
                step_id: step_id.clone(),
                attempt,
                message: step_error.message().to_string(),
            },
            "step failed"
        );
        task.emitter
            .emit(WorkflowEvent::step_failed(&step_id, attempt, kind, step_error.message()))
            .await;

        return TaskResult::Failed {
            record,
            error: TransactionError {
                step_id: step_id.clone(),
                action: ActionType::Invoke,
                kind,
                message: step_error.message().to_string(),
                attempt,
            },
            saga: task.saga,
        };
    }
}

/// Invokes a step, turning a panic in its body into a step error.
fn guarded_invoke(
    definition: &StepDefinition,
    input: Value,
    ctx: StepContext,
) -> BoxFuture<'static, StepResult<StepResponse>> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| definition.invoke(input, ctx))) {
        Ok(invocation) => AssertUnwindSafe(invocation)
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|payload| Err(panicked(payload.as_ref()))))
            .boxed(),
        Err(payload) => futures_util::future::ready(Err(panicked(payload.as_ref()))).boxed(),
    }
}

fn panicked(payload: &(dyn Any + Send)) -> StepError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    StepError::failed(format!("step panicked: {message}"))
}

/// Sleeps for `delay`; returns false if the transaction is cancelled first.
async fn sleep_unless_cancelled(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = wait_for_cancel(cancel) => false,
    }
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
