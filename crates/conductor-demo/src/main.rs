use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_core::impls::InMemoryEventBus;
use conductor_core::ports::EventBus;
use conductor_core::{
    Actor, DomainEvent, EventPayload, EventType, HandlerError, HandlerOptions, Orchestrator, RetryPolicy,
    StepResult, WorkflowConfig, WorkflowContext, WorkflowHandler,
};

#[derive(Debug, Deserialize)]
struct QualityReport {
    quality: String,
}

/// 受け取ったイベントの entity に紐づくレコードを 1 件作り、`<entity>.created` を emit する
struct CreateRecord {
    id: &'static str,
    entity_type: &'static str,
    remaining_failures: AtomicU32,
}

impl CreateRecord {
    fn new(id: &'static str, entity_type: &'static str) -> Arc<Self> {
        Self::flaky(id, entity_type, 0)
    }

    fn flaky(id: &'static str, entity_type: &'static str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            entity_type,
            remaining_failures: AtomicU32::new(failures),
        })
    }
}

#[async_trait]
impl WorkflowHandler for CreateRecord {
    fn id(&self) -> &str {
        self.id
    }

    fn name(&self) -> &str {
        self.entity_type
    }

    async fn execute(&self, event: &DomainEvent, ctx: &WorkflowContext) -> Result<StepResult, HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::failed(format!("intentional failure (left={left})")));
        }

        let source = ctx.entity_id.as_deref().unwrap_or("none");
        let entity_id = format!("{}-of-{source}", self.entity_type);
        let data = event.payload.data().cloned().unwrap_or(Value::Null);
        println!("created {entity_id}");

        Ok(StepResult::success(self.id)
            .with_data(json!({ "id": entity_id }))
            .emitting(EventPayload::RecordCreated {
                entity_type: self.entity_type.to_string(),
                entity_id,
                data,
            }))
    }
}

/// inspection の結果で acceptance / defect に分岐する
fn passed(event: &DomainEvent) -> bool {
    match event.decode_data::<QualityReport>() {
        Ok(report) => report.quality == "good",
        Err(err) => {
            warn!(error = %err, "inspection without a quality report");
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bus = Arc::new(InMemoryEventBus::new());
    let workflows = WorkflowConfig::from_json(json!({
        "workflows": {
            "task_completion": {
                "timeout_ms": 2000,
                "retry_policy": { "max_attempts": 3, "initial_delay_ms": 50, "max_delay_ms": 500 },
                "steps": [
                    { "id": "log", "name": "Create log", "handler_id": "create-log", "order": 1, "critical": true },
                    { "id": "inspection", "name": "Create inspection", "handler_id": "create-inspection", "order": 2 },
                    { "id": "invoice", "name": "Create invoice", "handler_id": "create-invoice", "order": 3,
                      "condition": "data.inspection.id != null" }
                ]
            }
        }
    }))?;

    let orchestrator = Orchestrator::builder(bus.clone()).workflows(workflows).build()?;
    orchestrator.initialize("blueprint-demo")?;

    let retry = RetryPolicy::new(3, Duration::from_millis(50), 2.0, Duration::from_millis(500));
    orchestrator.register_handler(EventType::TASK_COMPLETED, CreateRecord::new("create-log", "log"), None)?;
    orchestrator.register_handler(
        EventType::created("log"),
        CreateRecord::new("create-inspection", "inspection"),
        None,
    )?;
    orchestrator.register_handler(
        EventType::created("inspection"),
        CreateRecord::new("create-acceptance", "acceptance"),
        Some(HandlerOptions::default().with_priority(10).when(passed)),
    )?;
    orchestrator.register_handler(
        EventType::created("inspection"),
        CreateRecord::new("create-defect", "defect"),
        Some(HandlerOptions::default().with_priority(5).when(|e| !passed(e))),
    )?;
    orchestrator.register_handler(
        EventType::created("acceptance"),
        CreateRecord::flaky("create-invoice", "invoice", 1),
        Some(HandlerOptions::default().with_retry_policy(retry)),
    )?;
    orchestrator.register_handler(
        EventType::created("defect"),
        CreateRecord::new("create-warranty", "warranty"),
        None,
    )?;

    for (task_id, quality) in [("task-1", "good"), ("task-2", "poor")] {
        bus.emit(DomainEvent::new(
            EventPayload::TaskCompleted {
                task_id: task_id.to_string(),
                contract_id: Some("contract-1".to_string()),
                data: json!({ "quality": quality }),
            },
            Actor::new("site-manager"),
        ));
    }
    orchestrator.wait_for_idle().await;

    let ctx = WorkflowContext::new("blueprint-demo", Actor::system()).with_entity("task", "task-3");
    let result = orchestrator.execute_workflow("task_completion", ctx).await;
    info!(status = ?result.status, completed = result.completed_steps, "config-driven workflow finished");
    orchestrator.wait_for_idle().await;

    println!("{}", serde_json::to_string_pretty(&orchestrator.get_statistics())?);
    orchestrator.dispose();
    Ok(())
}
