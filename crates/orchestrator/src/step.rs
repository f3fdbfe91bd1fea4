//! Step definitions: the invoke/compensate pair and its execution options.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use transaction_store::{TransactionId, WorkflowId};

use crate::container::Container;
use crate::retry::RetryPolicy;

/// Type-erased invoke action.
pub type InvokeFn =
    Arc<dyn Fn(Value, StepContext) -> BoxFuture<'static, StepResult<StepResponse>> + Send + Sync>;

/// Type-erased compensating action.
pub type CompensateFn =
    Arc<dyn Fn(Value, StepContext) -> BoxFuture<'static, StepResult<()>> + Send + Sync>;

pub type StepResult<T> = std::result::Result<T, StepError>;

/// Error returned by a step action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Ordinary failure; retried while the step's retry budget lasts.
    #[error("{0}")]
    Failed(String),

    /// Failure that retrying cannot fix; the retry budget is skipped.
    #[error("{0}")]
    Permanent(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StepError::Permanent(message.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, StepError::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StepError::Failed(message) | StepError::Permanent(message) => message,
        }
    }
}

/// Outcome of a successful invoke.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResponse {
    /// The step finished; `response` flows to downstream steps and
    /// `compensation_input` (defaulting to the response) to the compensator.
    Completed {
        response: Value,
        compensation_input: Option<Value>,
    },

    /// The step started asynchronous work and waits for an external signal.
    Pending,
}

impl StepResponse {
    pub fn new(response: Value) -> Self {
        StepResponse::Completed {
            response,
            compensation_input: None,
        }
    }

    /// Serializes `response` into a completed step response.
    pub fn json<T: Serialize>(response: &T) -> StepResult<Self> {
        serde_json::to_value(response)
            .map(Self::new)
            .map_err(|e| StepError::permanent(format!("failed to serialize response: {e}")))
    }

    /// Parks the transaction until `register_step_success`/`register_step_failure`.
    pub fn pending() -> Self {
        StepResponse::Pending
    }

    /// Sets the value handed to the compensating action.
    pub fn with_compensation(self, input: Value) -> Self {
        match self {
            StepResponse::Completed { response, .. } => StepResponse::Completed {
                response,
                compensation_input: Some(input),
            },
            StepResponse::Pending => StepResponse::Pending,
        }
    }
}

/// Execution context passed to every step action.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: WorkflowId,
    pub transaction_id: TransactionId,
    pub event_group_id: Option<String>,
    pub step_id: String,
    /// 1-based attempt number of this invocation.
    pub attempt: u32,
    container: Container,
    cancelled: watch::Receiver<bool>,
}

impl StepContext {
    pub(crate) fn new(
        workflow_id: WorkflowId,
        transaction_id: TransactionId,
        event_group_id: Option<String>,
        step_id: impl Into<String>,
        attempt: u32,
        container: Container,
        cancelled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            workflow_id,
            transaction_id,
            event_group_id,
            step_id: step_id.into(),
            attempt,
            container,
            cancelled,
        }
    }

    /// Resolves a service registered in the run's container.
    pub fn resolve<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.container.resolve(key)
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Returns true once the transaction has been asked to cancel.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Waits until the transaction is cancelled.
    ///
    /// Long-running steps may race their work against this to stop early.
    pub async fn cancelled(&mut self) {
        while !*self.cancelled.borrow_and_update() {
            if self.cancelled.changed().await.is_err() {
                // Sender dropped; the transaction can no longer be cancelled
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Per-step execution options.
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Overrides the engine's default retry policy.
    pub retry: Option<RetryPolicy>,
    /// Overrides the engine's default per-attempt timeout.
    pub timeout: Option<Duration>,
    /// When false, a failure of this step is recorded but does not trigger
    /// compensation; steps that consume its output are skipped instead.
    pub saga: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            retry: None,
            timeout: None,
            saga: true,
        }
    }
}

/// A named step: invoke action, optional compensation and options.
#[derive(Clone)]
pub struct StepDefinition {
    id: String,
    invoke: InvokeFn,
    compensate: Option<CompensateFn>,
    options: StepOptions,
}

impl StepDefinition {
    /// Creates a step from an invoke closure over raw JSON input.
    pub fn new<F, Fut>(id: impl Into<String>, invoke: F) -> Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult<StepResponse>> + Send + 'static,
    {
        Self {
            id: id.into(),
            invoke: Arc::new(move |input, ctx| invoke(input, ctx).boxed()),
            compensate: None,
            options: StepOptions::default(),
        }
    }

    /// Creates a step whose input is deserialized into `I` before invoking.
    ///
    /// Input that does not deserialize fails the step permanently.
    pub fn typed<I, F, Fut>(id: impl Into<String>, invoke: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        F: Fn(I, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult<StepResponse>> + Send + 'static,
    {
        let invoke = Arc::new(invoke);
        Self::new(id, move |input: Value, ctx: StepContext| {
            let invoke = invoke.clone();
            async move {
                let input = decode::<I>(input, &ctx.step_id)?;
                invoke(input, ctx).await
            }
        })
    }

    /// Attaches a compensating action over raw JSON compensation input.
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult<()>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |input, ctx| compensate(input, ctx).boxed()));
        self
    }

    /// Attaches a compensating action whose input is deserialized into `I`.
    pub fn with_typed_compensation<I, F, Fut>(self, compensate: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        F: Fn(I, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult<()>> + Send + 'static,
    {
        let compensate = Arc::new(compensate);
        self.with_compensation(move |input: Value, ctx: StepContext| {
            let compensate = compensate.clone();
            async move {
                let input = decode::<I>(input, &ctx.step_id)?;
                compensate(input, ctx).await
            }
        })
    }

    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Marks the step as non-saga: its failure does not roll back the transaction.
    pub fn continue_on_failure(mut self) -> Self {
        self.options.saga = false;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &StepOptions {
        &self.options
    }

    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }

    pub(crate) fn invoke(&self, input: Value, ctx: StepContext) -> BoxFuture<'static, StepResult<StepResponse>> {
        (self.invoke)(input, ctx)
    }

    /// Runs the compensating action, or returns `None` if the step has none.
    pub(crate) fn compensate(
        &self,
        input: Value,
        ctx: StepContext,
    ) -> Option<BoxFuture<'static, StepResult<()>>> {
        self.compensate.as_ref().map(|compensate| compensate(input, ctx))
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("has_compensation", &self.has_compensation())
            .field("options", &self.options)
            .finish()
    }
}

fn decode<I: DeserializeOwned>(input: Value, step_id: &str) -> StepResult<I> {
    serde_json::from_value(input)
        .map_err(|e| StepError::permanent(format!("invalid input for step '{step_id}': {e}")))
}
