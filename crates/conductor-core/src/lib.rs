//! conductor-core
//!
//! In-process workflow orchestrator: domain events fan out to prioritized
//! handlers, each run as a tracked workflow with retry, timeout and rollback.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, event, context, status, step, workflow, errors）
//! - **ports**: 抽象化レイヤー（EventBus）
//! - **impls**: 実装（InMemoryEventBus など開発用）
//! - **config / retry / condition**: 設定、backoff、ステップ条件
//! - **handler / registry**: handler trait と優先度付き registry
//! - **store**: ワークフロー状態（eviction 付き）
//! - **executor / compensation**: dispatch、retry、rollback
//! - **orchestrator**: 公開 facade

pub mod domain;
pub mod ports;
pub mod impls;

pub mod condition;
pub mod config;
pub mod retry;

pub mod handler;
pub mod registry;

pub mod compensation;
pub mod executor;
pub mod observability;
pub mod orchestrator;
pub mod store;

pub use config::{ConfigError, OrchestratorConfig, StepConfig, WorkflowConfig, WorkflowDefinition};
pub use domain::{
    Actor, DomainEvent, EventPayload, EventType, FailureKind, HandlerError, OrchestratorError, StepResult,
    WorkflowContext, WorkflowId, WorkflowOutcome, WorkflowResult, WorkflowState, WorkflowStatus,
};
pub use handler::{HandlerOptions, WorkflowHandler};
pub use observability::Statistics;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use retry::RetryPolicy;
