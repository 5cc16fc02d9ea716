pub mod agent;
pub mod error;
pub mod task;

pub use agent::{AgentIdentity, ConnectionState, CorrelationId, SessionId, SessionSummary};
pub use error::{CoreError, CoreErrorKind};
pub use task::{
    ExecutionClass, ExecutionTarget, TaskCommand, TaskId, TaskPayload, TaskPriority, TaskRecord,
    TaskSnapshot, TaskSpec, TaskStatus, WaitReason,
};
