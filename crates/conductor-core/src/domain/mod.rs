//! Domain model (IDs, events, context, lifecycle, results, errors).

pub mod context;
pub mod errors;
pub mod event;
pub mod ids;
pub mod status;
pub mod step;
pub mod workflow;

pub use context::WorkflowContext;
pub use errors::{ErrorSource, FailureKind, HandlerError, OrchestratorError};
pub use event::{Actor, DomainEvent, EventMetadata, EventPayload, EventType};
pub use ids::{SubscriptionId, WorkflowId};
pub use status::{WorkflowErrorInfo, WorkflowState, WorkflowStatus};
pub use step::StepResult;
pub use workflow::{StepReport, WorkflowOutcome, WorkflowResult};
