//! WorkflowContext - 1 回のワークフロー実行に閉じた実行コンテキスト
//!
//! # 所有権
//! - 1 つの実行インスタンスが排他的に所有する（並行実行間で共有しない）
//! - ステップ間の受け渡しは `data` に step id をキーとして格納する

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::event::{Actor, DomainEvent};
use super::ids::WorkflowId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: WorkflowId,

    /// Tenant / blueprint scope the workflow runs in.
    pub scope_id: String,

    pub initiator: Actor,
    pub start_time: DateTime<Utc>,
    pub current_step: usize,
    pub total_steps: usize,

    /// Step-scoped key-value store.
    #[serde(default)]
    pub data: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl WorkflowContext {
    pub fn new(scope_id: impl Into<String>, initiator: Actor) -> Self {
        Self {
            workflow_id: WorkflowId::generate(),
            scope_id: scope_id.into(),
            initiator,
            start_time: Utc::now(),
            current_step: 0,
            total_steps: 0,
            data: Map::new(),
            entity_id: None,
            entity_type: None,
        }
    }

    /// Fresh single-handler context for an event-driven dispatch.
    pub fn for_event(scope_id: &str, event: &DomainEvent) -> Self {
        let scope = event.metadata.scope_id.as_deref().unwrap_or(scope_id);
        let mut ctx = Self::new(scope, event.actor.clone());
        ctx.total_steps = 1;
        if let Some((entity_type, entity_id)) = event.payload.entity() {
            ctx.entity_type = Some(entity_type.to_string());
            ctx.entity_id = Some(entity_id.to_string());
        }
        ctx
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Advance the step cursor, never past `total_steps`.
    pub fn advance(&mut self) {
        if self.current_step < self.total_steps {
            self.current_step += 1;
        }
    }

    /// JSON document step conditions are evaluated against.
    pub fn evaluation_document(&self) -> Value {
        serde_json::json!({
            "data": Value::Object(self.data.clone()),
            "entity": {
                "type": self.entity_type,
                "id": self.entity_id,
            },
            "initiator": self.initiator.as_str(),
            "scope": self.scope_id,
            "step": {
                "current": self.current_step,
                "total": self.total_steps,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EventPayload;
    use serde_json::json;

    #[test]
    fn event_context_picks_up_entity_and_scope() {
        let event = DomainEvent::new(
            EventPayload::TaskCompleted {
                task_id: "task-9".into(),
                contract_id: Some("c-1".into()),
                data: json!({}),
            },
            Actor::new("alice"),
        )
        .with_scope("blueprint-2");

        let ctx = WorkflowContext::for_event("blueprint-1", &event);

        assert_eq!(ctx.scope_id, "blueprint-2");
        assert_eq!(ctx.initiator.as_str(), "alice");
        assert_eq!(ctx.entity_type.as_deref(), Some("task"));
        assert_eq!(ctx.entity_id.as_deref(), Some("task-9"));
        assert_eq!((ctx.current_step, ctx.total_steps), (0, 1));
    }

    #[test]
    fn each_context_gets_its_own_workflow_id() {
        let a = WorkflowContext::new("s", Actor::system());
        let b = WorkflowContext::new("s", Actor::system());
        assert_ne!(a.workflow_id, b.workflow_id);
    }

    #[test]
    fn advance_stops_at_total_steps() {
        let mut ctx = WorkflowContext::new("s", Actor::system());
        ctx.total_steps = 2;
        ctx.advance();
        ctx.advance();
        ctx.advance();
        assert_eq!(ctx.current_step, 2);
    }

    #[test]
    fn evaluation_document_exposes_step_data() {
        let ctx = WorkflowContext::new("s", Actor::system()).with_data("inspect", json!({"passed": true}));
        let doc = ctx.evaluation_document();
        assert_eq!(doc["data"]["inspect"]["passed"], json!(true));
        assert_eq!(doc["initiator"], json!("system"));
    }
}
