use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::WorkflowState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCounts {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl WorkflowCounts {
    pub fn add(&mut self, state: WorkflowState) {
        match state {
            WorkflowState::Pending => self.pending += 1,
            WorkflowState::Running => self.running += 1,
            WorkflowState::Paused => self.paused += 1,
            WorkflowState::Completed => self.completed += 1,
            WorkflowState::Failed => self.failed += 1,
            WorkflowState::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.paused + self.completed + self.failed + self.cancelled
    }
}

/// Snapshot returned by `Orchestrator::statistics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub counts: WorkflowCounts,
    pub running_count: usize,
    /// Errors recorded since start (not reduced by eviction).
    pub error_count: u64,
    pub handler_count: usize,
    pub event_type_count: usize,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub evicted: u64,
}
