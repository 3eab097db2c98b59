//! Configuration: orchestrator settings and config-driven workflow definitions.
//!
//! `WorkflowConfig` is read once at construction, validated fail-fast and
//! shared immutably afterwards (`Arc<WorkflowConfig>`, no locking).

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::Condition;
use crate::retry::{RetryPolicy, millis};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("workflow '{workflow}': duplicate step id '{step_id}'")]
    DuplicateStepId { workflow: String, step_id: String },

    #[error("workflow '{workflow}', step '{step_id}': invalid condition: {reason}")]
    InvalidCondition {
        workflow: String,
        step_id: String,
        reason: String,
    },

    #[error("workflow '{0}': timeout must be greater than zero")]
    ZeroTimeout(String),

    #[error("max_history must be greater than zero")]
    ZeroHistory,
}

/// Orchestrator-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Status records retained before terminal entries are evicted.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Upper bound for a single `rollback` call.
    #[serde(rename = "rollback_timeout_ms", with = "millis", default = "default_timeout")]
    pub rollback_timeout: Duration,

    /// How long a config-driven workflow may stay paused before it fails.
    #[serde(rename = "resume_timeout_ms", with = "millis", default = "default_resume_timeout")]
    pub resume_timeout: Duration,

    /// Publish `StepResult::emit` payloads after successful runs.
    #[serde(default = "default_true")]
    pub emit_follow_up_events: bool,
}

pub const DEFAULT_MAX_HISTORY: usize = 1000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RESUME_TIMEOUT: Duration = Duration::from_secs(60 * 60);

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_resume_timeout() -> Duration {
    DEFAULT_RESUME_TIMEOUT
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            rollback_timeout: DEFAULT_TIMEOUT,
            resume_timeout: DEFAULT_RESUME_TIMEOUT,
            emit_follow_up_events: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_history == 0 {
            return Err(ConfigError::ZeroHistory);
        }
        Ok(())
    }
}

/// One step of a config-driven workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub id: String,
    pub name: String,
    pub handler_id: String,

    /// JMESPath expression over the context; falsy skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default = "default_true")]
    pub retryable: bool,

    #[serde(default)]
    pub critical: bool,

    #[serde(default)]
    pub order: u32,
}

impl StepConfig {
    pub fn new(id: impl Into<String>, handler_id: impl Into<String>, order: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            handler_id: handler_id.into(),
            condition: None,
            retryable: true,
            critical: false,
            order,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// A named multi-step workflow type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub steps: Vec<StepConfig>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Per-step timeout for this workflow type.
    #[serde(rename = "timeout_ms", with = "millis", default = "default_timeout")]
    pub timeout: Duration,
}

impl WorkflowDefinition {
    pub fn new(steps: Vec<StepConfig>) -> Self {
        Self {
            enabled: true,
            steps,
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        self.retry_policy.validate()?;
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout(name.to_string()));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(ConfigError::DuplicateStepId {
                    workflow: name.to_string(),
                    step_id: step.id.clone(),
                });
            }
            if let Some(expr) = &step.condition {
                Condition::parse(expr).map_err(|e| ConfigError::InvalidCondition {
                    workflow: name.to_string(),
                    step_id: step.id.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }
}

/// Workflow type name -> definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowDefinition>,
}

impl WorkflowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, name: impl Into<String>, definition: WorkflowDefinition) -> Self {
        self.workflows.insert(name.into(), definition);
        self
    }

    /// Validate every definition and sort steps by `order` (stable).
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        for (name, definition) in &mut self.workflows {
            definition.validate(name)?;
            definition.steps.sort_by_key(|s| s.order);
        }
        Ok(self)
    }

    /// Enabled definition for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(name).filter(|d| d.enabled)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
