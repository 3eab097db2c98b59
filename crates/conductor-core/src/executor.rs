//! WorkflowExecutor - イベント駆動の dispatch とリトライ/タイムアウト
//!
//! # フロー（1 イベント）
//! 1. HandlerRegistry から優先度順の handler 一覧を取得
//! 2. handler ごとに（逐次実行）:
//!    condition → validate → 新しい WorkflowContext → timeout 付き execute を backoff で retry
//! 3. 成功: completed + follow-up イベント emit / 失敗: rollback → エラー記録 → failed
//!
//! handler の失敗は同じ dispatch 内の他の handler を止めない。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::compensation::CompensationManager;
use crate::config::OrchestratorConfig;
use crate::domain::{
    DomainEvent, FailureKind, HandlerError, StepResult, WorkflowContext, WorkflowErrorInfo, WorkflowId,
    WorkflowState, WorkflowStatus,
};
use crate::handler::RegisteredHandler;
use crate::ports::EventBus;
use crate::registry::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::store::WorkflowStateStore;

/// Outcome of `execute_handler_with_retry`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub result: StepResult,
    /// Attempts actually made.
    pub attempts: u32,
    /// Backoff delays slept between attempts, in order.
    pub delays: Vec<Duration>,
    /// Last error when `result.success` is false.
    pub error: Option<HandlerError>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.result.success
    }

    pub fn was_cancelled(&self) -> bool {
        self.error == Some(HandlerError::Cancelled)
    }
}

pub struct WorkflowExecutor {
    registry: Arc<HandlerRegistry>,
    store: Arc<WorkflowStateStore>,
    bus: Arc<dyn EventBus>,
    compensation: CompensationManager,
    config: OrchestratorConfig,
    scope_id: OnceLock<String>,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<WorkflowStateStore>,
        bus: Arc<dyn EventBus>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            compensation: CompensationManager::new(),
            config,
            scope_id: OnceLock::new(),
        }
    }

    /// Returns `false` if a scope was already set.
    pub(crate) fn set_scope(&self, scope_id: String) -> bool {
        self.scope_id.set(scope_id).is_ok()
    }

    pub fn scope_id(&self) -> Option<&str> {
        self.scope_id.get().map(String::as_str)
    }

    pub fn compensation(&self) -> &CompensationManager {
        &self.compensation
    }

    /// Run every applicable handler for `event`, each as its own workflow.
    ///
    /// Returns the ids of the workflows started, in execution order.
    pub async fn handle_event(&self, event: DomainEvent) -> Vec<WorkflowId> {
        let event_type = event.event_type();
        let handlers = self.registry.lookup(&event_type);
        if handlers.is_empty() {
            debug!(%event_type, "no handlers registered");
            return Vec::new();
        }

        let mut started = Vec::with_capacity(handlers.len());
        for registered in handlers.iter() {
            if !registered.options.accepts(&event) {
                debug!(%event_type, handler_id = registered.id(), "skipped: condition not met");
                continue;
            }
            if !registered.handler.validate(&event) {
                debug!(%event_type, handler_id = registered.id(), "skipped: validation failed");
                continue;
            }
            started.push(self.run_single(registered, &event).await);
        }
        started
    }

    async fn run_single(&self, registered: &RegisteredHandler, event: &DomainEvent) -> WorkflowId {
        let ctx = WorkflowContext::for_event(self.scope_id().unwrap_or_default(), event);
        let id = ctx.workflow_id;
        self.store.insert_new(WorkflowStatus::running(&ctx));
        info!(
            workflow_id = %id,
            event_type = %event.event_type(),
            handler_id = registered.id(),
            "workflow started"
        );

        let policy = registered.options.effective_retry_policy();
        let report = self
            .execute_handler_with_retry(registered, event, &ctx, &policy, registered.options.timeout, None)
            .await;

        if report.succeeded() {
            self.store.set_current_step(&id, 1);
            self.store.transition(&id, WorkflowState::Completed);
            self.publish_follow_ups(&ctx, &report.result);
            info!(workflow_id = %id, attempts = report.attempts, "workflow completed");
        } else {
            self.compensate(registered, &ctx).await;
            self.store.record_error(
                &id,
                error_info(registered.id(), FailureKind::RetriesExhausted, &report),
            );
            self.store.transition(&id, WorkflowState::Failed);
            error!(
                workflow_id = %id,
                handler_id = registered.id(),
                attempts = report.attempts,
                error = report.result.error_message(),
                "workflow failed: retries exhausted"
            );
        }
        id
    }

    /// Execute `handler` up to `policy.max_attempts` times.
    ///
    /// Each attempt is raced against `timeout`; a timeout counts as a failed
    /// attempt. Between attempts the backoff delay is slept. When `cancel` is
    /// given, a `Cancelled` state observed before or during a backoff stops
    /// further attempts. The caller decides whether to roll back.
    pub async fn execute_handler_with_retry(
        &self,
        handler: &RegisteredHandler,
        event: &DomainEvent,
        ctx: &WorkflowContext,
        policy: &RetryPolicy,
        timeout: Duration,
        mut cancel: Option<watch::Receiver<WorkflowState>>,
    ) -> ExecutionReport {
        let max_attempts = policy.attempts();
        let mut delays = Vec::new();
        let mut attempts = 0;
        let mut last_error = HandlerError::failed("handler was never executed");
        let mut last_result = None;

        for attempt in 0..max_attempts {
            attempts = attempt + 1;
            let outcome = tokio::time::timeout(timeout, handler.handler.execute(event, ctx)).await;

            let error = match outcome {
                Ok(Ok(result)) if result.success => {
                    return ExecutionReport {
                        result,
                        attempts,
                        delays,
                        error: None,
                    };
                }
                Ok(Ok(result)) => {
                    let error = HandlerError::Failed(result.error_message().to_string());
                    last_result = Some(result);
                    error
                }
                Ok(Err(err)) => {
                    last_result = None;
                    err
                }
                Err(_) => {
                    last_result = None;
                    HandlerError::Timeout(timeout)
                }
            };

            warn!(
                workflow_id = %ctx.workflow_id,
                handler_id = handler.id(),
                attempt = attempts,
                max_attempts,
                error = %error,
                "handler attempt failed"
            );
            last_error = error;

            if attempts < max_attempts {
                let delay = policy.next_delay(attempt);
                delays.push(delay);
                if !backoff(delay, cancel.as_mut()).await {
                    last_error = HandlerError::Cancelled;
                    last_result = None;
                    break;
                }
            }
        }

        let result = last_result.unwrap_or_else(|| StepResult::failure(handler.id(), last_error.to_string()));
        ExecutionReport {
            result,
            attempts,
            delays,
            error: Some(last_error),
        }
    }

    pub(crate) async fn compensate(&self, registered: &RegisteredHandler, ctx: &WorkflowContext) {
        self.compensation
            .rollback(registered, ctx, self.config.rollback_timeout)
            .await;
    }

    /// Emit `result.emit` as auto-created events correlated with the workflow.
    pub(crate) fn publish_follow_ups(&self, ctx: &WorkflowContext, result: &StepResult) {
        if !self.config.emit_follow_up_events {
            return;
        }
        for payload in &result.emit {
            let event = DomainEvent::new(payload.clone(), ctx.initiator.clone())
                .with_scope(ctx.scope_id.clone())
                .correlated_with(ctx.workflow_id);
            debug!(
                workflow_id = %ctx.workflow_id,
                event_type = %event.event_type(),
                "emitting follow-up event"
            );
            self.bus.emit(event);
        }
    }
}

pub(crate) fn error_info(step_id: &str, kind: FailureKind, report: &ExecutionReport) -> WorkflowErrorInfo {
    let cause = report.error.as_ref().and_then(HandlerError::kind);
    let chain = report
        .error
        .as_ref()
        .and_then(|e| crate::domain::errors::source_chain(e));
    WorkflowErrorInfo::new(step_id, kind, report.result.error_message(), report.attempts)
        .with_cause(cause)
        .with_source_chain(chain)
}

/// Sleep for `delay`; returns `false` if the workflow got cancelled meanwhile.
async fn backoff(delay: Duration, cancel: Option<&mut watch::Receiver<WorkflowState>>) -> bool {
    let Some(rx) = cancel else {
        tokio::time::sleep(delay).await;
        return true;
    };
    if *rx.borrow_and_update() == WorkflowState::Cancelled {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = rx.changed() => {
                if changed.is_err() {
                    // status entry is gone; nothing left to observe
                    sleep.await;
                    return true;
                }
                if *rx.borrow_and_update() == WorkflowState::Cancelled {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Actor, EventPayload, EventType};
    use crate::handler::{HandlerOptions, WorkflowHandler};
    use crate::impls::InMemoryEventBus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times, then succeeds.
    struct Flaky {
        id: &'static str,
        failures: u32,
        calls: AtomicU32,
        rollbacks: AtomicU32,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Flaky {
        fn new(id: &'static str, failures: u32, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                id,
                failures,
                calls: AtomicU32::new(0),
                rollbacks: AtomicU32::new(0),
                log,
            })
        }
    }

    #[async_trait]
    impl WorkflowHandler for Flaky {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            self.id
        }

        async fn execute(&self, _event: &DomainEvent, _ctx: &WorkflowContext) -> Result<StepResult, HandlerError> {
            self.log.lock().unwrap().push(self.id);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(HandlerError::failed(format!("failure #{}", n + 1)))
            } else {
                Ok(StepResult::success(self.id).emitting(EventPayload::RecordCreated {
                    entity_type: "log".into(),
                    entity_id: format!("log-{}", self.id),
                    data: json!({}),
                }))
            }
        }

        async fn rollback(&self, _ctx: &WorkflowContext) -> Result<(), HandlerError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Hangs;

    #[async_trait]
    impl WorkflowHandler for Hangs {
        fn id(&self) -> &str {
            "hangs"
        }

        fn name(&self) -> &str {
            "Hangs"
        }

        async fn execute(&self, _event: &DomainEvent, _ctx: &WorkflowContext) -> Result<StepResult, HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(StepResult::success("hangs"))
        }
    }

    struct Fixture {
        executor: WorkflowExecutor,
        registry: Arc<HandlerRegistry>,
        store: Arc<WorkflowStateStore>,
        bus: Arc<InMemoryEventBus>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(HandlerRegistry::new());
        let store = Arc::new(WorkflowStateStore::new(100));
        let bus = Arc::new(InMemoryEventBus::new());
        let executor = WorkflowExecutor::new(registry.clone(), store.clone(), bus.clone(), OrchestratorConfig::default());
        executor.set_scope("blueprint-1".into());
        Fixture {
            executor,
            registry,
            store,
            bus,
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(10), 2.0, Duration::from_millis(100))
    }

    fn task_completed() -> DomainEvent {
        DomainEvent::new(
            EventPayload::TaskCompleted {
                task_id: "task-1".into(),
                contract_id: None,
                data: json!({}),
            },
            Actor::new("alice"),
        )
    }

    fn register(f: &Fixture, handler: Arc<dyn WorkflowHandler>, options: HandlerOptions) {
        f.registry.register(
            EventType::new(EventType::TASK_COMPLETED),
            RegisteredHandler::new(handler, Some(options)),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_records_delays() {
        let f = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Flaky::new("h", 2, log);
        let registered = RegisteredHandler::new(handler.clone(), None);
        let ctx = WorkflowContext::new("s", Actor::system());

        let report = f
            .executor
            .execute_handler_with_retry(&registered, &task_completed(), &ctx, &fast_policy(5), Duration::from_secs(1), None)
            .await;

        assert!(report.succeeded());
        assert_eq!(report.attempts, 3);
        assert_eq!(report.delays, [Duration::from_millis(10), Duration::from_millis(20)]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failed_attempt() {
        let f = fixture();
        let registered = RegisteredHandler::new(Arc::new(Hangs), None);
        let ctx = WorkflowContext::new("s", Actor::system());

        let report = f
            .executor
            .execute_handler_with_retry(
                &registered,
                &task_completed(),
                &ctx,
                &fast_policy(2),
                Duration::from_millis(50),
                None,
            )
            .await;

        assert!(!report.succeeded());
        assert_eq!(report.attempts, 2);
        assert_eq!(report.error, Some(HandlerError::Timeout(Duration::from_millis(50))));
        assert!(report.result.error_message().starts_with("Timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_state_stops_backoff() {
        let f = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Flaky::new("h", u32::MAX, log);
        let registered = RegisteredHandler::new(handler.clone(), None);
        let ctx = WorkflowContext::new("s", Actor::system());
        let (tx, rx) = watch::channel(WorkflowState::Running);

        let policy = RetryPolicy::new(5, Duration::from_secs(10), 2.0, Duration::from_secs(60));
        let event = task_completed();
        let run = f
            .executor
            .execute_handler_with_retry(&registered, &event, &ctx, &policy, Duration::from_secs(1), Some(rx));
        let cancel = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send_replace(WorkflowState::Cancelled);
        };
        let (report, _) = tokio::join!(run, cancel);

        assert!(report.was_cancelled());
        assert_eq!(report.attempts, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_event_runs_handlers_in_priority_order_as_separate_workflows() {
        let f = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        register(&f, Flaky::new("low", 0, log.clone()), HandlerOptions::default().with_priority(1));
        register(&f, Flaky::new("high", 0, log.clone()), HandlerOptions::default().with_priority(10));

        let ids = f.executor.handle_event(task_completed()).await;

        assert_eq!(*log.lock().unwrap(), ["high", "low"]);
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        for id in &ids {
            let status = f.store.get(id).unwrap();
            assert_eq!(status.state, WorkflowState::Completed);
            assert_eq!((status.current_step, status.total_steps), (1, 1));
            assert!(status.end_time.is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_handler_is_rolled_back_and_siblings_still_run() {
        let f = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = Flaky::new("failing", u32::MAX, log.clone());
        let fine = Flaky::new("fine", 0, log.clone());
        register(
            &f,
            failing.clone(),
            HandlerOptions::default().with_priority(5).with_retry_policy(fast_policy(3)).critical(),
        );
        register(&f, fine.clone(), HandlerOptions::default());

        let ids = f.executor.handle_event(task_completed()).await;

        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        assert_eq!(failing.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(fine.rollbacks.load(Ordering::SeqCst), 0);

        let failed = f.store.get(&ids[0]).unwrap();
        assert_eq!(failed.state, WorkflowState::Failed);
        assert_eq!(failed.errors.len(), 1);
        assert_eq!(failed.errors[0].kind, FailureKind::RetriesExhausted);
        assert_eq!(failed.errors[0].attempt, 3);
        assert_eq!(failed.errors[0].cause, Some(FailureKind::HandlerError));
        assert_eq!(f.store.get(&ids[1]).unwrap().state, WorkflowState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_by_timeouts_records_the_timeout_cause() {
        let f = fixture();
        register(
            &f,
            Arc::new(Hangs),
            HandlerOptions::default()
                .with_timeout(Duration::from_millis(50))
                .with_retry_policy(fast_policy(2)),
        );

        let ids = f.executor.handle_event(task_completed()).await;

        let status = f.store.get(&ids[0]).unwrap();
        assert_eq!(status.state, WorkflowState::Failed);
        assert_eq!(status.errors[0].kind, FailureKind::RetriesExhausted);
        assert_eq!(status.errors[0].cause, Some(FailureKind::HandlerTimeout));
        assert!(status.errors[0].message.starts_with("Timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_runs_emit_correlated_follow_ups() {
        let f = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        register(&f, Flaky::new("h", 0, log), HandlerOptions::default());

        let ids = f.executor.handle_event(task_completed()).await;

        let emitted = f.bus.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].event_type().as_str(), "log.created");
        assert!(emitted[0].metadata.auto_created);
        assert_eq!(emitted[0].metadata.correlation_id, Some(ids[0]));
        assert_eq!(emitted[0].metadata.scope_id.as_deref(), Some("blueprint-1"));
        assert_eq!(emitted[0].actor.as_str(), "alice");
    }

    #[tokio::test]
    async fn condition_and_validation_skip_without_creating_workflows() {
        let f = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let skipped = Flaky::new("skipped", 0, log.clone());
        register(&f, skipped.clone(), HandlerOptions::default().when(|_| false));

        let ids = f.executor.handle_event(task_completed()).await;

        assert!(ids.is_empty());
        assert_eq!(skipped.calls.load(Ordering::SeqCst), 0);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn unknown_event_type_is_a_noop() {
        let f = fixture();
        let event = DomainEvent::new(
            EventPayload::Custom {
                name: "nobody.listens".into(),
                data: json!({}),
            },
            Actor::system(),
        );
        assert!(f.executor.handle_event(event).await.is_empty());
        assert!(f.store.is_empty());
    }
}
