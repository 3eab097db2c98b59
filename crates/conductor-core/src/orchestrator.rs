//! Orchestrator - 公開 facade
//!
//! # 責務
//! - 初期化（scope の確定、tokio runtime handle の取得）
//! - handler の登録と、event type ごとに 1 回だけのバス購読
//! - config 駆動の multi-step ワークフロー実行
//! - pause / resume / cancel と状態・統計の参照
//!
//! バスの listener は同期的に呼ばれるため、dispatch は runtime 上に spawn して
//! `JoinSet` で追跡する（`wait_for_idle` で全て待てる）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::condition::Condition;
use crate::config::{ConfigError, OrchestratorConfig, StepConfig, WorkflowConfig, WorkflowDefinition};
use crate::domain::{
    DomainEvent, EventPayload, EventType, FailureKind, OrchestratorError, StepReport, SubscriptionId,
    WorkflowContext, WorkflowErrorInfo, WorkflowId, WorkflowOutcome, WorkflowResult, WorkflowState,
    WorkflowStatus,
};
use crate::executor::{WorkflowExecutor, error_info};
use crate::handler::{HandlerOptions, RegisteredHandler, WorkflowHandler};
use crate::observability::Statistics;
use crate::ports::{EventBus, EventListener};
use crate::registry::{HandlerRegistry, Registration, Unregistration};
use crate::retry::RetryPolicy;
use crate::store::WorkflowStateStore;

// ============================================================================
// Builder
// ============================================================================

pub struct OrchestratorBuilder {
    bus: Arc<dyn EventBus>,
    config: OrchestratorConfig,
    workflows: WorkflowConfig,
}

impl OrchestratorBuilder {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            config: OrchestratorConfig::default(),
            workflows: WorkflowConfig::default(),
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workflows(mut self, workflows: WorkflowConfig) -> Self {
        self.workflows = workflows;
        self
    }

    /// Validate configuration and assemble the orchestrator.
    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        self.config.validate()?;
        let workflows = Arc::new(self.workflows.validated()?);

        let registry = Arc::new(HandlerRegistry::new());
        let store = Arc::new(WorkflowStateStore::new(self.config.max_history));
        let executor = Arc::new(WorkflowExecutor::new(
            registry.clone(),
            store.clone(),
            self.bus.clone(),
            self.config.clone(),
        ));

        Ok(Orchestrator {
            bus: self.bus,
            config: self.config,
            workflows,
            registry,
            store,
            executor,
            lifecycle: Mutex::new(Lifecycle::default()),
            dispatches: Arc::new(Mutex::new(JoinSet::new())),
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Default)]
struct Lifecycle {
    runtime: Option<Handle>,
    subscriptions: HashMap<EventType, SubscriptionId>,
    disposed: bool,
}

type DispatchSet = Arc<Mutex<JoinSet<()>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Gate {
    Proceed,
    Cancelled,
    ResumeTimedOut,
    Stopped,
}

pub struct Orchestrator {
    bus: Arc<dyn EventBus>,
    config: OrchestratorConfig,
    workflows: Arc<WorkflowConfig>,
    registry: Arc<HandlerRegistry>,
    store: Arc<WorkflowStateStore>,
    executor: Arc<WorkflowExecutor>,
    lifecycle: Mutex<Lifecycle>,
    dispatches: DispatchSet,
}

impl Orchestrator {
    pub fn builder(bus: Arc<dyn EventBus>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(bus)
    }

    /// Bind the orchestrator to `scope_id` and to the current tokio runtime.
    ///
    /// Must be called from within a runtime. A second call fails.
    pub fn initialize(&self, scope_id: impl Into<String>) -> Result<(), OrchestratorError> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.disposed {
            return Err(OrchestratorError::Disposed);
        }
        let runtime = Handle::try_current().map_err(|_| OrchestratorError::NoRuntime)?;
        let scope_id = scope_id.into();
        if !self.executor.set_scope(scope_id.clone()) {
            return Err(OrchestratorError::AlreadyInitialized(
                self.executor.scope_id().unwrap_or_default().to_string(),
            ));
        }
        lifecycle.runtime = Some(runtime);
        info!(scope_id = %scope_id, "orchestrator initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.executor.scope_id().is_some()
    }

    /// Register `handler` for `event_type`.
    ///
    /// `options` override the handler's own `options()`. A handler id already
    /// present for the type is replaced. The first handler of a type
    /// subscribes the orchestrator to that type on the bus.
    pub fn register_handler(
        &self,
        event_type: impl Into<EventType>,
        handler: Arc<dyn WorkflowHandler>,
        options: Option<HandlerOptions>,
    ) -> Result<(), OrchestratorError> {
        let event_type = event_type.into();
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.disposed {
            return Err(OrchestratorError::Disposed);
        }
        let Some(runtime) = lifecycle.runtime.clone() else {
            return Err(OrchestratorError::NotInitialized);
        };

        let registered = RegisteredHandler::new(handler, options);
        let handler_id = registered.id().to_string();
        let priority = registered.priority();
        let registration = self.registry.register(event_type.clone(), registered);

        if registration == Registration::NewEventType || !lifecycle.subscriptions.contains_key(&event_type) {
            let listener = self.listener(runtime);
            let subscription = self.bus.subscribe(&event_type, listener);
            lifecycle.subscriptions.insert(event_type.clone(), subscription);
            debug!(%event_type, subscription_id = %subscription, "subscribed to event type");
        }
        info!(%event_type, handler_id = %handler_id, priority, ?registration, "handler registered");
        Ok(())
    }

    /// Register `handler` for config-driven steps only.
    ///
    /// The handler is found by id from `StepConfig::handler_id` and never
    /// receives bus events. A step handler with the same id is replaced.
    pub fn register_step_handler(
        &self,
        handler: Arc<dyn WorkflowHandler>,
        options: Option<HandlerOptions>,
    ) -> Result<(), OrchestratorError> {
        let lifecycle = lock(&self.lifecycle);
        if lifecycle.disposed {
            return Err(OrchestratorError::Disposed);
        }
        if lifecycle.runtime.is_none() {
            return Err(OrchestratorError::NotInitialized);
        }

        let registered = RegisteredHandler::new(handler, options);
        let handler_id = registered.id().to_string();
        let replaced = self.registry.register_step(registered);
        info!(handler_id = %handler_id, replaced, "step handler registered");
        Ok(())
    }

    /// Remove `handler_id` from `event_type`. Returns whether anything was removed.
    pub fn unregister_handler(&self, event_type: &EventType, handler_id: &str) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        match self.registry.unregister(event_type, handler_id) {
            Unregistration::NotFound => false,
            Unregistration::Removed => {
                info!(%event_type, handler_id, "handler unregistered");
                true
            }
            Unregistration::BucketEmptied => {
                if let Some(subscription) = lifecycle.subscriptions.remove(event_type) {
                    self.bus.unsubscribe(subscription);
                }
                info!(%event_type, handler_id, "handler unregistered; event type unsubscribed");
                true
            }
        }
    }

    fn listener(&self, runtime: Handle) -> EventListener {
        let executor = Arc::downgrade(&self.executor);
        let dispatches = self.dispatches.clone();
        Arc::new(move |event: DomainEvent| {
            let Some(executor) = executor.upgrade() else {
                return;
            };
            let mut set = lock(&*dispatches);
            while let Some(finished) = set.try_join_next() {
                if let Err(err) = finished {
                    error!(error = %err, "dispatch task aborted");
                }
            }
            set.spawn_on(
                async move {
                    executor.handle_event(event).await;
                },
                &runtime,
            );
        })
    }

    /// Dispatch `event` directly, bypassing the bus, and wait for it.
    ///
    /// Returns the ids of the workflows started.
    pub async fn dispatch(&self, event: DomainEvent) -> Vec<WorkflowId> {
        self.executor.handle_event(event).await
    }

    /// Wait until every dispatch spawned from bus events has finished,
    /// including dispatches triggered by follow-up events.
    pub async fn wait_for_idle(&self) {
        loop {
            let mut set = std::mem::take(&mut *lock(&*self.dispatches));
            if set.is_empty() {
                return;
            }
            while let Some(finished) = set.join_next().await {
                if let Err(err) = finished {
                    error!(error = %err, "dispatch task aborted");
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Config-driven workflows
    // ------------------------------------------------------------------------

    /// Run the configured multi-step workflow `workflow_type` with `ctx`.
    ///
    /// Never fails: unknown types and step failures are reported in the result.
    pub async fn execute_workflow(&self, workflow_type: &str, mut ctx: WorkflowContext) -> WorkflowResult {
        let Some(definition) = self.workflows.get(workflow_type) else {
            warn!(workflow_type, "unknown or disabled workflow type");
            return WorkflowResult::rejected(
                ctx.workflow_id,
                workflow_type,
                WorkflowErrorInfo::new(
                    "",
                    FailureKind::UnknownWorkflowType,
                    format!("unknown or disabled workflow type '{workflow_type}'"),
                    0,
                ),
            );
        };

        ctx.total_steps = definition.steps.len();
        ctx.current_step = 0;
        let id = ctx.workflow_id;
        if !self.store.insert_new(WorkflowStatus::running(&ctx)) {
            warn!(workflow_id = %id, workflow_type, "workflow id already has a status record");
            return WorkflowResult::rejected(
                id,
                workflow_type,
                WorkflowErrorInfo::new(
                    "",
                    FailureKind::DuplicateWorkflowId,
                    format!("workflow id '{id}' was already executed"),
                    0,
                ),
            );
        }
        let mut signal = self.store.subscribe(&id);
        info!(workflow_id = %id, workflow_type, steps = ctx.total_steps, "workflow started");

        let mut run = StepRun::default();
        for step in &definition.steps {
            match self.wait_until_runnable(signal.as_mut()).await {
                Gate::Proceed => {}
                Gate::Cancelled | Gate::Stopped => {
                    run.cancelled = true;
                    break;
                }
                Gate::ResumeTimedOut => {
                    let error = WorkflowErrorInfo::new(
                        &step.id,
                        FailureKind::ResumeTimeout,
                        format!("not resumed within {:?}", self.config.resume_timeout),
                        0,
                    );
                    warn!(workflow_id = %id, step_id = %step.id, "resume timeout");
                    self.record(&id, &mut run, error);
                    run.resume_timed_out = true;
                    break;
                }
            }

            let proceed = self
                .run_step(workflow_type, definition, step, &mut ctx, signal.clone(), &mut run)
                .await;
            ctx.advance();
            self.store.set_current_step(&id, ctx.current_step);
            if !proceed {
                break;
            }
        }

        let cancelled = run.cancelled || self.store.state_of(&id) == Some(WorkflowState::Cancelled);
        let status = if cancelled {
            WorkflowOutcome::Cancelled
        } else if run.resume_timed_out {
            WorkflowOutcome::Failed
        } else {
            WorkflowOutcome::from_counts(run.completed, run.errors.len())
        };
        let final_state = match status {
            WorkflowOutcome::Success | WorkflowOutcome::PartialSuccess => WorkflowState::Completed,
            WorkflowOutcome::Failed => WorkflowState::Failed,
            WorkflowOutcome::Cancelled => WorkflowState::Cancelled,
        };
        self.store.transition(&id, final_state);
        info!(
            workflow_id = %id,
            workflow_type,
            ?status,
            completed = run.completed,
            errors = run.errors.len(),
            "workflow finished"
        );

        WorkflowResult {
            workflow_id: id,
            workflow_type: workflow_type.to_string(),
            status,
            completed_steps: run.completed,
            total_steps: definition.steps.len(),
            errors: run.errors,
            steps: run.reports,
            data: ctx.data,
        }
    }

    /// Execute one step. Returns `false` when the workflow must stop.
    async fn run_step(
        &self,
        workflow_type: &str,
        definition: &WorkflowDefinition,
        step: &StepConfig,
        ctx: &mut WorkflowContext,
        signal: Option<watch::Receiver<WorkflowState>>,
        run: &mut StepRun,
    ) -> bool {
        let id = ctx.workflow_id;

        if let Some(expr) = &step.condition {
            match Condition::parse(expr).and_then(|c| c.evaluate_context(ctx)) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(workflow_id = %id, step_id = %step.id, "skipped: condition not met");
                    run.reports.push(StepReport {
                        step_id: step.id.clone(),
                        handler_id: step.handler_id.clone(),
                        success: false,
                        skipped: true,
                        attempts: 0,
                        delays: Vec::new(),
                    });
                    return true;
                }
                Err(err) => {
                    let kind = failure_kind(step, FailureKind::HandlerError);
                    let error = WorkflowErrorInfo::new(&step.id, kind, format!("condition: {err}"), 0);
                    error!(workflow_id = %id, step_id = %step.id, error = %err, "condition evaluation failed");
                    self.record(&id, run, error);
                    return !step.critical;
                }
            }
        }

        let Some(registered) = self.registry.find(&step.handler_id) else {
            let kind = failure_kind(step, FailureKind::UnknownHandlerId);
            let error = WorkflowErrorInfo::new(
                &step.id,
                kind,
                format!("no handler registered with id '{}'", step.handler_id),
                0,
            );
            error!(workflow_id = %id, step_id = %step.id, handler_id = %step.handler_id, "unknown handler id");
            self.record(&id, run, error);
            return !step.critical;
        };

        let event = DomainEvent::new(
            EventPayload::WorkflowStep {
                workflow_type: workflow_type.to_string(),
                step_id: step.id.clone(),
            },
            ctx.initiator.clone(),
        )
        .with_scope(ctx.scope_id.clone());
        let policy = if step.retryable {
            definition.retry_policy.clone()
        } else {
            RetryPolicy::none()
        };

        let report = self
            .executor
            .execute_handler_with_retry(&registered, &event, ctx, &policy, definition.timeout, signal)
            .await;
        run.reports.push(StepReport {
            step_id: step.id.clone(),
            handler_id: step.handler_id.clone(),
            success: report.succeeded(),
            skipped: false,
            attempts: report.attempts,
            delays: report.delays.clone(),
        });

        if report.succeeded() {
            run.completed += 1;
            if let Some(data) = &report.result.data {
                ctx.insert(step.id.clone(), data.clone());
            }
            self.executor.publish_follow_ups(ctx, &report.result);
            debug!(workflow_id = %id, step_id = %step.id, attempts = report.attempts, "step completed");
            return !report.result.halts_workflow();
        }

        // A cancel that landed during the last attempt leaves nothing to roll back.
        if report.was_cancelled() || self.store.state_of(&id) == Some(WorkflowState::Cancelled) {
            run.cancelled = true;
            return false;
        }

        self.executor.compensate(&registered, ctx).await;
        let kind = failure_kind(step, FailureKind::RetriesExhausted);
        error!(
            workflow_id = %id,
            step_id = %step.id,
            attempts = report.attempts,
            critical = step.critical,
            error = report.result.error_message(),
            "step failed"
        );
        self.record(&id, run, error_info(&step.id, kind, &report));
        !step.critical && !report.result.halts_workflow()
    }

    fn record(&self, id: &WorkflowId, run: &mut StepRun, error: WorkflowErrorInfo) {
        self.store.record_error(id, error.clone());
        run.errors.push(error);
    }

    /// Block while the workflow is paused, up to `resume_timeout` per pause.
    async fn wait_until_runnable(&self, signal: Option<&mut watch::Receiver<WorkflowState>>) -> Gate {
        let Some(rx) = signal else {
            return Gate::Proceed;
        };
        let mut deadline = None;
        loop {
            let state = *rx.borrow_and_update();
            match state {
                WorkflowState::Pending | WorkflowState::Running => return Gate::Proceed,
                WorkflowState::Cancelled => return Gate::Cancelled,
                WorkflowState::Completed | WorkflowState::Failed => return Gate::Stopped,
                WorkflowState::Paused => {
                    let until = *deadline
                        .get_or_insert_with(|| tokio::time::Instant::now() + self.config.resume_timeout);
                    match tokio::time::timeout_at(until, rx.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return Gate::Stopped,
                        Err(_) => return Gate::ResumeTimedOut,
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle control & queries
    // ------------------------------------------------------------------------

    pub fn get_workflow_status(&self, id: &WorkflowId) -> Option<WorkflowStatus> {
        self.store.get(id)
    }

    /// Every retained status, oldest first.
    pub fn get_all_workflow_statuses(&self) -> Vec<WorkflowStatus> {
        self.store.all()
    }

    /// Pause a running workflow. No-op (returns `false`) otherwise.
    pub fn pause_workflow(&self, id: &WorkflowId) -> bool {
        self.control(id, WorkflowState::Paused)
    }

    /// Resume a paused workflow. No-op (returns `false`) otherwise.
    pub fn resume_workflow(&self, id: &WorkflowId) -> bool {
        self.control(id, WorkflowState::Running)
    }

    /// Cancel a live workflow. Terminal or unknown ids are left untouched.
    pub fn cancel_workflow(&self, id: &WorkflowId) -> bool {
        self.control(id, WorkflowState::Cancelled)
    }

    fn control(&self, id: &WorkflowId, next: WorkflowState) -> bool {
        let transition = self.store.transition(id, next);
        if transition.is_applied() {
            info!(workflow_id = %id, state = ?next, "workflow state changed");
        } else {
            debug!(workflow_id = %id, requested = ?next, ?transition, "state change ignored");
        }
        transition.is_applied()
    }

    pub fn get_statistics(&self) -> Statistics {
        let store = self.store.stats();
        Statistics {
            counts: store.counts,
            running_count: store.counts.running,
            error_count: store.error_count,
            handler_count: self.registry.len(),
            event_type_count: self.registry.event_types().len(),
            last_execution_time: store.last_execution_time,
            evicted: store.evicted,
        }
    }

    /// Rollbacks attempted and failed so far.
    pub fn compensation_counts(&self) -> (u64, u64) {
        let compensation = self.executor.compensation();
        (compensation.attempted(), compensation.failed())
    }

    /// Unsubscribe from the bus, abort in-flight dispatches and drop all
    /// handlers and statuses. Idempotent.
    pub fn dispose(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.disposed {
            return;
        }
        lifecycle.disposed = true;
        for (_, subscription) in lifecycle.subscriptions.drain() {
            self.bus.unsubscribe(subscription);
        }
        lock(&*self.dispatches).abort_all();
        self.registry.clear();
        self.store.clear();
        info!("orchestrator disposed");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[derive(Default)]
struct StepRun {
    completed: usize,
    errors: Vec<WorkflowErrorInfo>,
    reports: Vec<StepReport>,
    cancelled: bool,
    resume_timed_out: bool,
}

fn failure_kind(step: &StepConfig, otherwise: FailureKind) -> FailureKind {
    if step.critical {
        FailureKind::CriticalStepFailure
    } else {
        otherwise
    }
}
