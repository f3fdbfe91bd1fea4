//! Transaction endpoints: start runs, inspect state, deliver step signals.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use orchestrator::{RunOutcome, RunRequest, StepError, TransactionSnapshot, WorkflowHandle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use transaction_store::TransactionError;

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct RunTransactionRequest {
    #[serde(default)]
    pub input: Value,
    pub transaction_id: Option<String>,
    pub event_group_id: Option<String>,
}

#[derive(Deserialize)]
pub struct StepSuccessRequest {
    #[serde(default)]
    pub response: Value,
}

#[derive(Deserialize)]
pub struct StepFailureRequest {
    pub message: String,
    /// Skips the step's remaining retry budget.
    #[serde(default)]
    pub permanent: bool,
}

// -- Response types --

#[derive(Serialize)]
pub struct TransactionResponse {
    pub workflow_id: String,
    pub transaction_id: String,
    pub status: String,
    pub result: Option<Value>,
    pub errors: Vec<TransactionError>,
    pub steps: Vec<StepResponse>,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub step_id: String,
    pub action: String,
    pub status: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl From<&TransactionSnapshot> for TransactionResponse {
    fn from(snapshot: &TransactionSnapshot) -> Self {
        let header = &snapshot.header;
        Self {
            workflow_id: header.workflow_id.to_string(),
            transaction_id: header.transaction_id.to_string(),
            status: header.status.as_str().to_string(),
            result: header.result.clone(),
            errors: header.errors.clone(),
            steps: snapshot
                .steps
                .iter()
                .map(|(step_id, action, record)| StepResponse {
                    step_id: step_id.to_string(),
                    action: action.as_str().to_string(),
                    status: record.status.as_str().to_string(),
                    attempts: record.attempts,
                    last_error: record.last_error.as_ref().map(|e| e.message.clone()),
                })
                .collect(),
        }
    }
}

impl From<RunOutcome> for TransactionResponse {
    fn from(outcome: RunOutcome) -> Self {
        Self::from(&outcome.transaction)
    }
}

async fn workflow(state: &AppState, workflow_id: String) -> Result<WorkflowHandle, ApiError> {
    Ok(state.registry.get_workflow(&workflow_id.into()).await?)
}

// -- Handlers --

/// POST /workflows/{workflow_id}/transactions: runs the workflow.
///
/// Responds once the walk finishes or parks; a parked transaction is
/// reported with status `invoking`.
#[tracing::instrument(skip(state, req))]
pub async fn run(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(req): Json<RunTransactionRequest>,
) -> Result<(StatusCode, Json<TransactionResponse>), ApiError> {
    let handle = workflow(&state, workflow_id).await?;

    let mut request = RunRequest::new(req.input);
    if let Some(transaction_id) = req.transaction_id {
        if transaction_id.trim().is_empty() {
            return Err(ApiError::BadRequest("transaction_id must not be empty".to_string()));
        }
        request = request.with_transaction_id(transaction_id);
    }
    if let Some(event_group_id) = req.event_group_id {
        request = request.with_event_group(event_group_id);
    }

    let outcome = handle.run_with(request).await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

/// GET /workflows/{workflow_id}/transactions/{transaction_id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path((workflow_id, transaction_id)): Path<(String, String)>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let handle = workflow(&state, workflow_id).await?;
    let snapshot = handle.get_transaction(transaction_id).await?;
    Ok(Json(TransactionResponse::from(&snapshot)))
}

/// POST /workflows/{workflow_id}/transactions/{transaction_id}/cancel
#[tracing::instrument(skip(state))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path((workflow_id, transaction_id)): Path<(String, String)>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let handle = workflow(&state, workflow_id).await?;
    let outcome = handle.cancel(transaction_id).await?;
    Ok(Json(outcome.into()))
}

/// POST /workflows/{workflow_id}/transactions/{transaction_id}/steps/{step_id}/success
///
/// Completes a parked step. With a resume queue configured the walk
/// continues on a worker and the response reflects the state right after
/// the signal was recorded.
#[tracing::instrument(skip(state, req))]
pub async fn step_success(
    State(state): State<Arc<AppState>>,
    Path((workflow_id, transaction_id, step_id)): Path<(String, String, String)>,
    Json(req): Json<StepSuccessRequest>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let handle = workflow(&state, workflow_id).await?;
    let outcome = handle
        .register_step_success(transaction_id, &step_id, req.response)
        .await?;
    Ok(Json(outcome.into()))
}

/// POST /workflows/{workflow_id}/transactions/{transaction_id}/steps/{step_id}/failure
#[tracing::instrument(skip(state, req))]
pub async fn step_failure(
    State(state): State<Arc<AppState>>,
    Path((workflow_id, transaction_id, step_id)): Path<(String, String, String)>,
    Json(req): Json<StepFailureRequest>,
) -> Result<Json<TransactionResponse>, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    let error = if req.permanent {
        StepError::permanent(req.message)
    } else {
        StepError::failed(req.message)
    };

    let handle = workflow(&state, workflow_id).await?;
    let outcome = handle
        .register_step_failure(transaction_id, &step_id, error)
        .await?;
    Ok(Json(outcome.into()))
}

/// POST /workflows/{workflow_id}/transactions/{transaction_id}/steps/{step_id}/retry
///
/// Re-runs a failed non-saga step.
#[tracing::instrument(skip(state))]
pub async fn retry_step(
    State(state): State<Arc<AppState>>,
    Path((workflow_id, transaction_id, step_id)): Path<(String, String, String)>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let handle = workflow(&state, workflow_id).await?;
    let outcome = handle.retry_step(transaction_id, &step_id).await?;
    Ok(Json(outcome.into()))
}
