//! Handler trait - イベントに反応して業務処理を実行する単位
//!
//! # 契約
//! - `execute`: 長時間かかってもよいが、ambient timeout で打ち切られる
//! - `validate`: 純粋関数（副作用なし）。false ならスキップ
//! - `rollback`: retry を使い切った後のベストエフォート補償
//!
//! 登録時に `HandlerOptions` を渡すと handler 自身の `options()` を上書きします。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DEFAULT_TIMEOUT;
use crate::domain::{DomainEvent, HandlerError, StepResult, WorkflowContext};
use crate::retry::RetryPolicy;

/// Predicate deciding whether a handler applies to an event.
pub type EventPredicate = Arc<dyn Fn(&DomainEvent) -> bool + Send + Sync>;

/// Per-handler execution options.
#[derive(Clone)]
pub struct HandlerOptions {
    /// Higher runs first.
    pub priority: i32,
    pub retry_policy: RetryPolicy,
    pub timeout: Duration,
    pub critical: bool,
    /// `false` limits execution to a single attempt.
    pub retryable: bool,
    pub condition: Option<EventPredicate>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            critical: false,
            retryable: true,
            condition: None,
        }
    }
}

impl fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("priority", &self.priority)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("critical", &self.critical)
            .field("retryable", &self.retryable)
            .field("condition", &self.condition.is_some())
            .finish()
    }
}

impl HandlerOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DomainEvent) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(predicate));
        self
    }

    /// Policy the event-driven path applies, honoring `retryable`.
    pub fn effective_retry_policy(&self) -> RetryPolicy {
        if self.retryable {
            self.retry_policy.clone()
        } else {
            RetryPolicy::none()
        }
    }

    pub fn accepts(&self, event: &DomainEvent) -> bool {
        self.condition.as_ref().is_none_or(|predicate| predicate(event))
    }
}

/// Business logic invoked by the orchestrator.
///
/// # 使用例
/// ```ignore
/// struct CreateLog;
///
/// #[async_trait]
/// impl WorkflowHandler for CreateLog {
///     fn id(&self) -> &str { "create-log" }
///     fn name(&self) -> &str { "Create log record" }
///
///     async fn execute(&self, event: &DomainEvent, ctx: &WorkflowContext)
///         -> Result<StepResult, HandlerError>
///     {
///         Ok(StepResult::success(self.id()))
///     }
/// }
/// ```
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Default options, overridable at registration.
    fn options(&self) -> HandlerOptions {
        HandlerOptions::default()
    }

    fn validate(&self, _event: &DomainEvent) -> bool {
        true
    }

    async fn execute(&self, event: &DomainEvent, ctx: &WorkflowContext) -> Result<StepResult, HandlerError>;

    async fn rollback(&self, _ctx: &WorkflowContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// A handler together with the options it was registered with.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn WorkflowHandler>,
    pub options: HandlerOptions,
}

impl RegisteredHandler {
    pub fn new(handler: Arc<dyn WorkflowHandler>, options: Option<HandlerOptions>) -> Self {
        let options = options.unwrap_or_else(|| handler.options());
        Self { handler, options }
    }

    pub fn id(&self) -> &str {
        self.handler.id()
    }

    pub fn priority(&self) -> i32 {
        self.options.priority
    }
}

impl fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("id", &self.handler.id())
            .field("name", &self.handler.name())
            .field("options", &self.options)
            .finish()
    }
}
