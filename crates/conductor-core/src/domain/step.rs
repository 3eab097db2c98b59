//! Step results: the common result format handlers return.

use serde::{Deserialize, Serialize};

use super::event::EventPayload;

/// Result of one handler / step execution.
///
/// - `success = true`: forward progress; `data` is folded into the context.
/// - `success = false`: recoverable failure, the retry wrapper may try again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// `Some(false)` asks a config-driven workflow to stop after this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_workflow: Option<bool>,

    /// Dynamic branching hint. Static configs ignore it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,

    /// Follow-up events published after a successful run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emit: Vec<EventPayload>,
}

impl StepResult {
    pub fn success(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            success: true,
            data: None,
            error: None,
            continue_workflow: None,
            next_steps: Vec::new(),
            emit: Vec::new(),
        }
    }

    pub fn failure(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            continue_workflow: None,
            next_steps: Vec::new(),
            emit: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_next_step(mut self, step_id: impl Into<String>) -> Self {
        self.next_steps.push(step_id.into());
        self
    }

    pub fn stop_workflow(mut self) -> Self {
        self.continue_workflow = Some(false);
        self
    }

    pub fn emitting(mut self, payload: EventPayload) -> Self {
        self.emit.push(payload);
        self
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("step failed")
    }

    pub fn halts_workflow(&self) -> bool {
        self.continue_workflow == Some(false)
    }
}
