use std::time::SystemTime;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::agents::protocol::Frame;
use crate::models::{
    AgentIdentity, ConnectionState, CoreError, CoreErrorKind, CorrelationId, ExecutionClass,
    SessionId, SessionSummary, TaskId,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct InFlight {
    pub task_id: TaskId,
    pub correlation_id: CorrelationId,
}

/// One connected endpoint. Owned by the registry; callers only see summaries.
pub(crate) struct AgentSession {
    pub session_id: SessionId,
    pub agent_identity: AgentIdentity,
    pub execution_class: ExecutionClass,
    pub enrollment_token_hash: String,
    pub connected_at: SystemTime,
    pub last_heartbeat_at: SystemTime,
    pub closed_at: Option<Instant>,
    pub last_assigned: Option<Instant>,
    pub completed_commands: u64,
    state: ConnectionState,
    last_heartbeat: Instant,
    in_flight: Option<InFlight>,
    outbound: Option<UnboundedSender<Frame>>,
}

impl AgentSession {
    pub fn new(
        agent_identity: AgentIdentity,
        execution_class: ExecutionClass,
        enrollment_token_hash: String,
        outbound: UnboundedSender<Frame>,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            session_id: SessionId::random(),
            agent_identity,
            execution_class,
            enrollment_token_hash,
            connected_at: now,
            last_heartbeat_at: now,
            closed_at: None,
            last_assigned: None,
            completed_commands: 0,
            state: ConnectionState::Handshaking,
            last_heartbeat: Instant::now(),
            in_flight: None,
            outbound: Some(outbound),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.state == ConnectionState::Active && self.in_flight.is_none() && self.outbound.is_some()
    }

    pub fn transition(&mut self, next: ConnectionState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::for_session(
                self.session_id.clone(),
                CoreErrorKind::ProtocolViolation,
                format!(
                    "session cannot move from '{}' to '{}'",
                    self.state.as_str(),
                    next.as_str()
                ),
            ));
        }
        self.state = next;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
        self.last_heartbeat_at = SystemTime::now();
    }

    pub fn silent_since(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    pub fn send(&self, frame: Frame) -> Result<(), CoreError> {
        let outbound = self.outbound.as_ref().ok_or_else(|| self.lost("channel is closed"))?;
        outbound
            .send(frame)
            .map_err(|_| self.lost("channel writer has gone away"))
    }

    pub fn occupy(&mut self, in_flight: InFlight) {
        self.in_flight = Some(in_flight);
        self.last_assigned = Some(Instant::now());
    }

    /// Frees the slot only if `correlation_id` is the command it holds.
    pub fn release(&mut self, correlation_id: &CorrelationId) -> Option<InFlight> {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|current| &current.correlation_id == correlation_id)
        {
            return self.in_flight.take();
        }
        None
    }

    /// Moves to `Closed`, drops the writer half and hands back any in-flight command.
    pub fn close(&mut self) -> Option<InFlight> {
        self.state = ConnectionState::Closed;
        self.closed_at = Some(Instant::now());
        self.outbound = None;
        self.in_flight.take()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            agent_identity: self.agent_identity.clone(),
            execution_class: self.execution_class,
            state: self.state,
            connected_at: self.connected_at,
            last_heartbeat_at: self.last_heartbeat_at,
            in_flight_task_id: self.in_flight.as_ref().map(|in_flight| in_flight.task_id),
            completed_commands: self.completed_commands,
        }
    }

    fn lost(&self, message: &str) -> CoreError {
        CoreError::for_session(
            self.session_id.clone(),
            CoreErrorKind::SessionLost,
            message.to_string(),
        )
    }
}
