//! Flow-scoped step registry.

use std::collections::HashMap;

use transaction_store::WorkflowId;

use crate::error::{Result, WorkflowError};
use crate::step::StepDefinition;

/// Maps step ids to their definitions within one flow.
///
/// Populated while the flow is being defined and read-only afterwards. Two
/// flows may register steps with the same id without colliding.
#[derive(Debug, Clone)]
pub struct StepRegistry {
    workflow_id: WorkflowId,
    steps: HashMap<String, StepDefinition>,
}

impl StepRegistry {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            steps: HashMap::new(),
        }
    }

    /// Adds a step, rejecting ids already registered in this flow.
    pub fn register(&mut self, step: StepDefinition) -> Result<()> {
        if self.steps.contains_key(step.id()) {
            return Err(WorkflowError::DuplicateStep {
                workflow_id: self.workflow_id.clone(),
                step_id: step.id().to_string(),
            });
        }
        self.steps.insert(step.id().to_string(), step);
        Ok(())
    }

    pub fn resolve(&self, step_id: &str) -> Result<&StepDefinition> {
        self.steps
            .get(step_id)
            .ok_or_else(|| WorkflowError::UnknownStep {
                workflow_id: self.workflow_id.clone(),
                step_id: step_id.to_string(),
            })
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
