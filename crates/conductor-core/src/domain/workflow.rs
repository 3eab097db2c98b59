//! Result of a config-driven workflow run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::WorkflowId;
use super::status::WorkflowErrorInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    /// Every executed step succeeded.
    Success,
    /// Some steps completed despite errors.
    PartialSuccess,
    /// Nothing completed and at least one error was recorded.
    Failed,
    /// Stopped by `cancel` before running to the end.
    Cancelled,
}

impl WorkflowOutcome {
    pub fn from_counts(completed_steps: usize, error_count: usize) -> Self {
        match (completed_steps, error_count) {
            (_, 0) => WorkflowOutcome::Success,
            (0, _) => WorkflowOutcome::Failed,
            _ => WorkflowOutcome::PartialSuccess,
        }
    }
}

/// Per-step execution report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub handler_id: String,
    pub success: bool,
    pub skipped: bool,
    pub attempts: u32,
    /// Backoff delays slept between attempts.
    #[serde(default)]
    pub delays: Vec<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub status: WorkflowOutcome,
    pub completed_steps: usize,
    pub total_steps: usize,
    #[serde(default)]
    pub errors: Vec<WorkflowErrorInfo>,
    #[serde(default)]
    pub steps: Vec<StepReport>,
    /// Context data at the end of the run.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl WorkflowResult {
    /// Immediate failure with zero completed steps.
    pub fn rejected(workflow_id: WorkflowId, workflow_type: impl Into<String>, error: WorkflowErrorInfo) -> Self {
        Self {
            workflow_id,
            workflow_type: workflow_type.into(),
            status: WorkflowOutcome::Failed,
            completed_steps: 0,
            total_steps: 0,
            errors: vec![error],
            steps: Vec::new(),
            data: serde_json::Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowOutcome::Success
    }
}
