//! Domain events delivered by the event bus.
//!
//! Payloads are a tagged union: the event-type key used by the handler
//! registry is derived from the variant, so a handler never has to cast an
//! untyped payload.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::HandlerError;
use super::ids::WorkflowId;

/// Key under which handlers are registered and events are routed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub const TASK_COMPLETED: &'static str = "task.completed";
    pub const WORKFLOW_STEP: &'static str = "workflow.step";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the follow-up event emitted when an entity of `entity_type` is created.
    pub fn created(entity_type: &str) -> Self {
        Self(format!("{entity_type}.created"))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Who caused an event (user id, service name, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    pub const SYSTEM: &'static str = "system";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn system() -> Self {
        Self::new(Self::SYSTEM)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A task of a contract was marked completed.
    TaskCompleted {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contract_id: Option<String>,
        #[serde(default)]
        data: serde_json::Value,
    },

    /// A business record was created (log, inspection, invoice, ...).
    RecordCreated {
        entity_type: String,
        entity_id: String,
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Synthetic event handed to handlers invoked as a configured workflow step.
    WorkflowStep {
        workflow_type: String,
        step_id: String,
    },

    /// Anything else, routed by its own name.
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::TaskCompleted { .. } => EventType::new(EventType::TASK_COMPLETED),
            EventPayload::RecordCreated { entity_type, .. } => EventType::created(entity_type),
            EventPayload::WorkflowStep { .. } => EventType::new(EventType::WORKFLOW_STEP),
            EventPayload::Custom { name, .. } => EventType::new(name.clone()),
        }
    }

    /// `(entity_type, entity_id)` of the entity this event is about, if any.
    pub fn entity(&self) -> Option<(&str, &str)> {
        match self {
            EventPayload::TaskCompleted { task_id, .. } => Some(("task", task_id.as_str())),
            EventPayload::RecordCreated {
                entity_type,
                entity_id,
                ..
            } => Some((entity_type.as_str(), entity_id.as_str())),
            EventPayload::WorkflowStep { .. } | EventPayload::Custom { .. } => None,
        }
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            EventPayload::TaskCompleted { data, .. }
            | EventPayload::RecordCreated { data, .. }
            | EventPayload::Custom { data, .. } => Some(data),
            EventPayload::WorkflowStep { .. } => None,
        }
    }
}

/// Envelope metadata attached to every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub timestamp: DateTime<Utc>,

    /// Set on events the orchestrator emits after a successful handler run.
    #[serde(default)]
    pub auto_created: bool,

    /// Originating workflow of an auto-created event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<WorkflowId>,

    /// Tenant / blueprint scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            auto_created: false,
            correlation_id: None,
            scope_id: None,
        }
    }
}

/// An event as it travels through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub payload: EventPayload,
    pub actor: Actor,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl DomainEvent {
    pub fn new(payload: EventPayload, actor: Actor) -> Self {
        Self {
            payload,
            actor,
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.metadata.scope_id = Some(scope_id.into());
        self
    }

    /// Mark as emitted by the orchestrator on behalf of `workflow_id`.
    pub fn correlated_with(mut self, workflow_id: WorkflowId) -> Self {
        self.metadata.auto_created = true;
        self.metadata.correlation_id = Some(workflow_id);
        self
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Decode the payload's `data` into a handler-specific type.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        let data = self.payload.data().cloned().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(HandlerError::invalid_payload)
    }
}
