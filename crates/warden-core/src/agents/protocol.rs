use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::models::{CoreError, CoreErrorKind, CorrelationId, SessionId, TaskCommand, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Hello,
    Heartbeat,
    Command,
    Result,
    Error,
    Cancel,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Heartbeat => "heartbeat",
            Self::Command => "command",
            Self::Result => "result",
            Self::Error => "error",
            Self::Cancel => "cancel",
        }
    }
}

/// One JSON message on an agent channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw).map_err(|error| {
            CoreError::new(
                CoreErrorKind::ProtocolViolation,
                format!("malformed frame: {error}"),
            )
        })
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("failed to encode {} frame: {error}", self.kind.as_str()),
            )
        })
    }

    pub fn server_hello(session_id: &SessionId, heartbeat_interval_ms: u64) -> Self {
        Self {
            kind: FrameKind::Hello,
            correlation_id: None,
            task_id: None,
            payload: json!({
                "session_id": session_id,
                "heartbeat_interval_ms": heartbeat_interval_ms,
            }),
        }
    }

    pub fn command(correlation_id: CorrelationId, command: &TaskCommand) -> Self {
        Self {
            kind: FrameKind::Command,
            correlation_id: Some(correlation_id),
            task_id: Some(command.task_id),
            payload: json!({
                "execution_class": command.execution_class,
                "attempt": command.attempt,
                "payload": command.payload,
                "case_id": command.case_id,
                "investigation_id": command.investigation_id,
            }),
        }
    }

    pub fn cancel(correlation_id: CorrelationId, task_id: TaskId) -> Self {
        Self {
            kind: FrameKind::Cancel,
            correlation_id: Some(correlation_id),
            task_id: Some(task_id),
            payload: Value::Null,
        }
    }

    /// Message carried by an inbound `error` frame, whatever shape the agent chose.
    pub fn error_message(&self) -> String {
        match &self.payload {
            Value::String(message) => message.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.payload.to_string()),
            Value::Null => "agent reported an error without details".to_string(),
            other => other.to_string(),
        }
    }

    /// `Some(true)` when a heartbeat asks to stop receiving work, `Some(false)` to resume.
    pub fn draining_flag(&self) -> Option<bool> {
        self.payload.get("draining").and_then(Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Frame, FrameKind};
    use crate::models::CoreErrorKind;

    #[test]
    fn heartbeat_without_correlation_parses() {
        let frame = Frame::parse(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Heartbeat);
        assert!(frame.correlation_id.is_none());
        assert_eq!(frame.draining_flag(), None);
    }

    #[test]
    fn unknown_frame_type_is_a_protocol_violation() {
        let error = Frame::parse(r#"{"type":"shell","payload":{}}"#).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::ProtocolViolation);
    }

    #[test]
    fn error_message_prefers_message_field() {
        let frame = Frame {
            kind: FrameKind::Error,
            correlation_id: None,
            task_id: None,
            payload: json!({"message": "tool crashed", "code": 3}),
        };
        assert_eq!(frame.error_message(), "tool crashed");
    }
}
