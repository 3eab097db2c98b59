//! Errors - エラー型と分類
//!
//! - `HandlerError`: handler の execute / rollback が返すエラー
//! - `FailureKind`: WorkflowStatus に記録される失敗の分類（スキップとキャンセルは記録しない）
//! - `OrchestratorError`: facade の誤用のみ。handler の失敗は決して伝播しない

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// Failure caused by another error; its chain is kept for the status record.
    #[error("{message}")]
    Caused {
        message: String,
        #[source]
        source: ErrorSource,
    },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("invalid payload")]
    InvalidPayload(#[source] ErrorSource),

    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    pub fn caused_by<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        HandlerError::Caused {
            message: message.into(),
            source: ErrorSource::new(source),
        }
    }

    pub fn invalid_payload<E>(source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        HandlerError::InvalidPayload(ErrorSource::new(source))
    }

    /// Failure classification, `None` for cancellation.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            HandlerError::Timeout(_) => Some(FailureKind::HandlerTimeout),
            HandlerError::Cancelled => None,
            HandlerError::Failed(_) | HandlerError::Caused { .. } | HandlerError::InvalidPayload(_) => {
                Some(FailureKind::HandlerError)
            }
        }
    }
}

/// Shared, cloneable wrapper around an underlying error.
///
/// Two sources are equal only when they are the same allocation.
#[derive(Clone)]
pub struct ErrorSource(Arc<dyn StdError + Send + Sync>);

impl ErrorSource {
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }
}

impl fmt::Debug for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl StdError for ErrorSource {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl PartialEq for ErrorSource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ErrorSource {}

/// Classification of a recorded workflow failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    HandlerTimeout,
    HandlerError,
    RetriesExhausted,
    CriticalStepFailure,
    UnknownWorkflowType,
    UnknownHandlerId,
    ResumeTimeout,
    /// The workflow id already has a status record.
    DuplicateWorkflowId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("orchestrator already initialized for scope '{0}'")]
    AlreadyInitialized(String),

    #[error("orchestrator not initialized")]
    NotInitialized,

    #[error("orchestrator has been disposed")]
    Disposed,

    #[error("orchestrator must be initialized inside a tokio runtime")]
    NoRuntime,
}

/// Render the `source()` chain below `err`, or `None` if it has no source.
pub fn source_chain(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut parts = Vec::new();
    let mut current = err.source();
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(": "))
    }
}
