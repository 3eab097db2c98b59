//! WorkflowStateStore - workflow id -> status record.
//!
//! Design:
//! - Single source of truth for workflow lifecycle state.
//! - Counters live under the same lock as the records.
//! - Every entry owns a `watch` channel of its state so paused workflows
//!   can await a change instead of polling.
//! - Bounded history: past `max_history`, the oldest terminal entries
//!   (by `start_time`) are evicted. Running / paused entries never are.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::domain::{WorkflowErrorInfo, WorkflowId, WorkflowState, WorkflowStatus};
use crate::observability::WorkflowCounts;

/// Result of a requested state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The current state does not allow it.
    Rejected(WorkflowState),
    NotFound,
}

impl Transition {
    pub fn is_applied(self) -> bool {
        self == Transition::Applied
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub counts: WorkflowCounts,
    pub error_count: u64,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub evicted: u64,
}

struct Entry {
    status: WorkflowStatus,
    signal: watch::Sender<WorkflowState>,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<WorkflowId, Entry>,
    error_count: u64,
    last_execution_time: Option<DateTime<Utc>>,
    evicted: u64,
}

impl StoreState {
    fn evict_over(&mut self, max_history: usize) {
        if self.entries.len() <= max_history {
            return;
        }
        let mut terminal: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.status.state.is_terminal())
            .map(|e| (e.status.start_time, e.status.workflow_id))
            .collect();
        terminal.sort();

        let excess = self.entries.len() - max_history;
        for (_, id) in terminal.into_iter().take(excess) {
            self.entries.remove(&id);
            self.evicted += 1;
            debug!(workflow_id = %id, "evicted workflow status");
        }
    }
}

pub struct WorkflowStateStore {
    max_history: usize,
    state: Mutex<StoreState>,
}

impl WorkflowStateStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Insert a record for a workflow id not seen before.
    ///
    /// Returns `false` and leaves the store untouched when the id is already
    /// present; existing records only change through `transition`,
    /// `set_current_step` and `record_error`.
    pub fn insert_new(&self, status: WorkflowStatus) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let id = status.workflow_id;
        if state.entries.contains_key(&id) {
            return false;
        }
        if status.state == WorkflowState::Running {
            state.last_execution_time = Some(Utc::now());
        }
        let (signal, _) = watch::channel(status.state);
        state.entries.insert(id, Entry { status, signal });
        state.evict_over(self.max_history);
        true
    }

    pub fn get(&self, id: &WorkflowId) -> Option<WorkflowStatus> {
        self.lock().entries.get(id).map(|e| e.status.clone())
    }

    pub fn state_of(&self, id: &WorkflowId) -> Option<WorkflowState> {
        self.lock().entries.get(id).map(|e| e.status.state)
    }

    /// All records, oldest first.
    pub fn all(&self) -> Vec<WorkflowStatus> {
        let state = self.lock();
        let mut all: Vec<_> = state.entries.values().map(|e| e.status.clone()).collect();
        all.sort_by_key(|s| (s.start_time, s.workflow_id));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn transition(&self, id: &WorkflowId, next: WorkflowState) -> Transition {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            return Transition::NotFound;
        };
        let current = entry.status.state;
        if !entry.status.transition(next) {
            return Transition::Rejected(current);
        }
        entry.signal.send_replace(next);
        if next.is_terminal() {
            state.evict_over(self.max_history);
        }
        Transition::Applied
    }

    pub fn set_current_step(&self, id: &WorkflowId, step: usize) {
        if let Some(entry) = self.lock().entries.get_mut(id) {
            entry.status.set_current_step(step);
        }
    }

    pub fn record_error(&self, id: &WorkflowId, error: WorkflowErrorInfo) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(id) {
            entry.status.record_error(error);
            state.error_count += 1;
        }
    }

    /// Receiver that observes every state change of `id`.
    pub fn subscribe(&self, id: &WorkflowId) -> Option<watch::Receiver<WorkflowState>> {
        self.lock().entries.get(id).map(|e| e.signal.subscribe())
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.lock();
        let mut counts = WorkflowCounts::default();
        for entry in state.entries.values() {
            counts.add(entry.status.state);
        }
        StoreStats {
            counts,
            error_count: state.error_count,
            last_execution_time: state.last_execution_time,
            evicted: state.evicted,
        }
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        *state = StoreState::default();
    }
}
