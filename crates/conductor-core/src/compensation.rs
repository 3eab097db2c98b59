//! CompensationManager - retry を使い切った handler の rollback を呼ぶ
//!
//! rollback はベストエフォート。失敗してもログに残すだけで握りつぶし、
//! orchestrator や他のワークフローを止めない。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{error, info};

use crate::domain::{HandlerError, WorkflowContext};
use crate::handler::RegisteredHandler;

/// What happened to a compensation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    RolledBack,
    Failed(HandlerError),
}

#[derive(Debug, Default)]
pub struct CompensationManager {
    attempted: AtomicU64,
    failed: AtomicU64,
}

impl CompensationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `handler.rollback`, bounded by `timeout`. Never propagates errors.
    pub async fn rollback(
        &self,
        handler: &RegisteredHandler,
        ctx: &WorkflowContext,
        timeout: Duration,
    ) -> CompensationOutcome {
        self.attempted.fetch_add(1, Ordering::Relaxed);

        let result = match tokio::time::timeout(timeout, handler.handler.rollback(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Timeout(timeout)),
        };

        match result {
            Ok(()) => {
                info!(
                    workflow_id = %ctx.workflow_id,
                    handler_id = handler.id(),
                    "rollback completed"
                );
                CompensationOutcome::RolledBack
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    workflow_id = %ctx.workflow_id,
                    handler_id = handler.id(),
                    error = %err,
                    "rollback failed"
                );
                CompensationOutcome::Failed(err)
            }
        }
    }

    pub fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
