use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{ExecutionClass, TaskId};

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

opaque_id!(SessionId);
opaque_id!(AgentIdentity);
opaque_id!(CorrelationId);

impl SessionId {
    pub fn random() -> Self {
        Self(format!("sess-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl AgentIdentity {
    pub fn random() -> Self {
        Self(format!("agent-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl CorrelationId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Handshaking,
    Authenticated,
    Active,
    Draining,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshaking => "handshaking",
            Self::Authenticated => "authenticated",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        match (self, next) {
            (Self::Closed, _) => false,
            (_, Self::Closed) => true,
            (Self::Handshaking, Self::Authenticated) => true,
            (Self::Authenticated, Self::Active) => true,
            (Self::Active, Self::Draining) | (Self::Draining, Self::Active) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub agent_identity: AgentIdentity,
    pub execution_class: ExecutionClass,
    pub state: ConnectionState,
    pub connected_at: SystemTime,
    pub last_heartbeat_at: SystemTime,
    pub in_flight_task_id: Option<TaskId>,
    pub completed_commands: u64,
}

#[cfg(test)]
mod tests {
    use super::ConnectionState;

    #[test]
    fn sessions_move_forward_or_close() {
        assert!(ConnectionState::Handshaking.can_transition_to(ConnectionState::Authenticated));
        assert!(!ConnectionState::Handshaking.can_transition_to(ConnectionState::Active));
        assert!(ConnectionState::Active.can_transition_to(ConnectionState::Draining));
        assert!(ConnectionState::Draining.can_transition_to(ConnectionState::Active));
        assert!(ConnectionState::Authenticated.can_transition_to(ConnectionState::Closed));
        assert!(!ConnectionState::Closed.can_transition_to(ConnectionState::Active));
        assert!(!ConnectionState::Closed.can_transition_to(ConnectionState::Closed));
    }
}
