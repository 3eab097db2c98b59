//! Workflow lifecycle state machine and status record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::WorkflowContext;
use super::errors::FailureKind;
use super::ids::WorkflowId;

/// Workflow state.
///
/// State transitions:
/// - Pending -> Running
/// - Running <-> Paused
/// - Running | Paused -> Completed | Failed | Cancelled
///
/// Terminal states have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    /// Is `self -> next` a legal transition?
    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        match (self, next) {
            (Pending, Running) => true,
            (Pending, Failed | Cancelled) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running | Paused, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// One recorded failure of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowErrorInfo {
    pub step_id: String,
    pub kind: FailureKind,

    /// Classification of the last underlying handler error, when `kind`
    /// summarizes several attempts (`RetriesExhausted`, `CriticalStepFailure`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureKind>,

    pub message: String,

    /// Rendered `source()` chain of the underlying error, outermost first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_chain: Option<String>,

    pub timestamp: DateTime<Utc>,

    /// Attempts made before the failure was recorded (0 when nothing ran).
    pub attempt: u32,
}

impl WorkflowErrorInfo {
    pub fn new(step_id: impl Into<String>, kind: FailureKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
            cause: None,
            message: message.into(),
            source_chain: None,
            timestamp: Utc::now(),
            attempt,
        }
    }

    pub fn with_cause(mut self, cause: Option<FailureKind>) -> Self {
        self.cause = cause;
        self
    }

    pub fn with_source_chain(mut self, chain: Option<String>) -> Self {
        self.source_chain = chain;
        self
    }
}

/// Lifecycle record of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: WorkflowId,
    pub state: WorkflowState,
    pub current_step: usize,
    pub total_steps: usize,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<WorkflowErrorInfo>,
}

impl WorkflowStatus {
    pub fn new(workflow_id: WorkflowId, total_steps: usize, start_time: DateTime<Utc>) -> Self {
        Self {
            workflow_id,
            state: WorkflowState::Pending,
            current_step: 0,
            total_steps,
            start_time,
            end_time: None,
            errors: Vec::new(),
        }
    }

    /// Status mirroring a context that is about to run.
    pub fn running(ctx: &WorkflowContext) -> Self {
        let mut status = Self::new(ctx.workflow_id, ctx.total_steps, ctx.start_time);
        status.state = WorkflowState::Running;
        status.current_step = ctx.current_step.min(ctx.total_steps);
        status
    }

    /// Apply a transition if it is legal. Terminal transitions stamp `end_time`.
    pub fn transition(&mut self, next: WorkflowState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        true
    }

    pub fn set_current_step(&mut self, step: usize) {
        self.current_step = step.min(self.total_steps);
    }

    pub fn record_error(&mut self, error: WorkflowErrorInfo) {
        self.errors.push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use super::WorkflowState::*;

    #[rstest]
    #[case(Pending, Running, true)]
    #[case(Running, Paused, true)]
    #[case(Paused, Running, true)]
    #[case(Running, Completed, true)]
    #[case(Paused, Cancelled, true)]
    #[case(Running, Pending, false)]
    #[case(Pending, Paused, false)]
    #[case(Completed, Running, false)]
    #[case(Failed, Cancelled, false)]
    #[case(Cancelled, Paused, false)]
    fn transitions_are_monotonic(
        #[case] from: WorkflowState,
        #[case] to: WorkflowState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn terminal_transition_stamps_end_time() {
        let mut status = WorkflowStatus::new(WorkflowId::generate(), 1, Utc::now());
        assert!(status.transition(Running));
        assert!(status.end_time.is_none());

        assert!(status.transition(Failed));
        assert!(status.end_time.is_some());
        assert!(!status.transition(Running));
        assert_eq!(status.state, Failed);
    }

    #[test]
    fn current_step_is_capped_by_total() {
        let mut status = WorkflowStatus::new(WorkflowId::generate(), 2, Utc::now());
        status.set_current_step(5);
        assert_eq!(status.current_step, 2);
    }

    #[test]
    fn state_serializes_snake_case() {
        let s = serde_json::to_string(&Cancelled).unwrap();
        assert_eq!(s, "\"cancelled\"");
    }
}
