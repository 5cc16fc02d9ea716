use thiserror::Error;

use crate::models::{SessionId, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    InvalidInput,
    NotFound,
    Unauthorized,
    Expired,
    Conflict,
    ProtocolViolation,
    SessionLost,
    Timeout,
    Cancelled,
    ExecutionFailure,
    ProcessFailure,
    StorageFailure,
    Internal,
}

impl CoreErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Expired => "expired",
            Self::Conflict => "conflict",
            Self::ProtocolViolation => "protocol_violation",
            Self::SessionLost => "session_lost",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ExecutionFailure => "execution_failure",
            Self::ProcessFailure => "process_failure",
            Self::StorageFailure => "storage_failure",
            Self::Internal => "internal",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskId>,
    pub session: Option<SessionId>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            session: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_task(task: TaskId, kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: Some(task),
            ..Self::new(kind, message)
        }
    }

    pub fn for_session(
        session: SessionId,
        kind: CoreErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session: Some(session),
            ..Self::new(kind, message)
        }
    }

    /// Attributes an error raised deeper in the stack to the task it surfaced on,
    /// keeping any attribution the error already carries.
    pub fn attribute(self, task: TaskId) -> Self {
        Self {
            task: self.task.or(Some(task)),
            ..self
        }
    }
}
