use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::agents::enrollment::{
    ConnectionBundle, DownloadGrant, EnrollmentRecord, random_secret, token_digest,
};
use crate::agents::protocol::{Frame, FrameKind};
use crate::agents::session::{AgentSession, InFlight};
use crate::config::DispatchConfig;
use crate::models::{
    AgentIdentity, ConnectionState, CoreError, CoreErrorKind, CorrelationId, ExecutionClass,
    SessionId, SessionSummary, TaskCommand, TaskId,
};
use crate::orchestration::OrchestrationResult;
use crate::persistence::EnrollmentStore;

type Reply = oneshot::Sender<OrchestrationResult<Value>>;

/// A command that left on a session and is waiting for its `result`/`error`.
pub struct PendingCommand {
    pub session_id: SessionId,
    pub agent_identity: AgentIdentity,
    pub correlation_id: CorrelationId,
    pub task_id: TaskId,
    pub reply: oneshot::Receiver<OrchestrationResult<Value>>,
}

/// What the transport layer gets back from `connect`: the id to report inbound
/// frames against, and the queue of frames to write to the endpoint.
pub struct SessionHandle {
    pub session_id: SessionId,
    pub agent_identity: AgentIdentity,
    pub execution_class: ExecutionClass,
    pub outbound: UnboundedReceiver<Frame>,
}

#[derive(Clone, Copy, Debug)]
struct RegistrySettings {
    heartbeat_interval: Duration,
    heartbeat_grace: Duration,
    token_ttl: Duration,
}

struct PendingGrant {
    execution_class: ExecutionClass,
    label: Option<String>,
    expires_at: Instant,
}

struct PendingReply {
    session_id: SessionId,
    task_id: TaskId,
    reply: Reply,
}

#[derive(Default)]
struct RegistryState {
    grants: HashMap<String, PendingGrant>,
    enrollments: HashMap<String, EnrollmentRecord>,
    sessions: HashMap<SessionId, AgentSession>,
    pending: HashMap<CorrelationId, PendingReply>,
}

#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<Mutex<RegistryState>>,
    settings: RegistrySettings,
    capacity: Arc<Notify>,
    enrollment_store: Option<Arc<dyn EnrollmentStore>>,
}

impl AgentRegistry {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryState::default())),
            settings: RegistrySettings {
                heartbeat_interval: config.heartbeat_interval(),
                heartbeat_grace: config.heartbeat_grace(),
                token_ttl: config.enrollment_token_ttl(),
            },
            capacity: Arc::new(Notify::new()),
            enrollment_store: None,
        }
    }

    /// Loads previously enrolled agents and persists new enrollments to `store`.
    pub fn with_enrollment_store(
        config: &DispatchConfig,
        store: Arc<dyn EnrollmentStore>,
    ) -> OrchestrationResult<Self> {
        let mut registry = Self::new(config);
        let records = store.list_enrollments()?;
        {
            let mut state = registry.lock_state()?;
            for record in records {
                state.enrollments.insert(record.token_hash.clone(), record);
            }
        }
        registry.enrollment_store = Some(store);
        Ok(registry)
    }

    /// Notified whenever a session becomes able to take work.
    pub fn capacity_signal(&self) -> Arc<Notify> {
        self.capacity.clone()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.settings.heartbeat_interval
    }

    pub fn heartbeat_grace(&self) -> Duration {
        self.settings.heartbeat_grace
    }

    pub fn issue_download_token(
        &self,
        execution_class: ExecutionClass,
        label: Option<String>,
    ) -> OrchestrationResult<DownloadGrant> {
        if !execution_class.is_remote() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "agents can only enroll for remote execution classes",
            ));
        }

        let expires_at = Instant::now()
            .checked_add(self.settings.token_ttl)
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    "enrollment token lifetime is too large",
                )
            })?;
        let download_token = random_secret("wdl");
        let mut state = self.lock_state()?;
        state.grants.insert(
            token_digest(&download_token),
            PendingGrant {
                execution_class,
                label: label.clone(),
                expires_at,
            },
        );
        tracing::info!(
            class = execution_class.as_str(),
            label = label.as_deref().unwrap_or(""),
            "issued agent download token"
        );

        Ok(DownloadGrant {
            download_token,
            execution_class,
            label,
            expires_in: self.settings.token_ttl,
        })
    }

    /// Exchanges a download token for long-lived connection credentials. The
    /// token is consumed whether or not it turns out to be expired.
    pub async fn enroll(&self, download_token: &str) -> OrchestrationResult<ConnectionBundle> {
        let grant = {
            let mut state = self.lock_state()?;
            state
                .grants
                .remove(&token_digest(download_token))
                .ok_or_else(|| {
                    CoreError::new(
                        CoreErrorKind::Unauthorized,
                        "download token is unknown or was already used",
                    )
                })?
        };

        if Instant::now() >= grant.expires_at {
            return Err(CoreError::new(
                CoreErrorKind::Expired,
                "download token has expired",
            ));
        }

        let session_token = random_secret("wst");
        let record = EnrollmentRecord {
            agent_identity: AgentIdentity::random(),
            execution_class: grant.execution_class,
            token_hash: token_digest(&session_token),
            label: grant.label,
            enrolled_at: SystemTime::now(),
        };

        if let Some(store) = self.enrollment_store.clone() {
            let persisted = record.clone();
            tokio::task::spawn_blocking(move || store.save_enrollment(&persisted))
                .await
                .map_err(|join_error| {
                    CoreError::new(
                        CoreErrorKind::Internal,
                        format!("enrollment persistence join failure: {join_error}"),
                    )
                })??;
        }

        let bundle = ConnectionBundle {
            agent_identity: record.agent_identity.clone(),
            session_token,
            execution_class: record.execution_class,
            heartbeat_interval_ms: self.settings.heartbeat_interval.as_millis() as u64,
        };

        tracing::info!(
            agent = %record.agent_identity,
            class = record.execution_class.as_str(),
            "agent enrolled"
        );
        self.lock_state()?
            .enrollments
            .insert(record.token_hash.clone(), record);

        Ok(bundle)
    }

    /// Opens a new session in `handshaking`. A live session of the same agent is
    /// closed first; sessions are never resumed across reconnects.
    pub fn connect(&self, session_token: &str) -> OrchestrationResult<SessionHandle> {
        let mut state = self.lock_state()?;
        let token_hash = token_digest(session_token);
        let record = state.enrollments.get(&token_hash).cloned().ok_or_else(|| {
            CoreError::new(CoreErrorKind::Unauthorized, "session token is not enrolled")
        })?;

        let superseded: Vec<SessionId> = state
            .sessions
            .values()
            .filter(|session| {
                session.agent_identity == record.agent_identity
                    && session.state() != ConnectionState::Closed
            })
            .map(|session| session.session_id.clone())
            .collect();
        for session_id in superseded {
            close_locked(&mut state, &session_id, "superseded by a reconnect");
        }

        let (sender, outbound) = unbounded_channel();
        let session = AgentSession::new(
            record.agent_identity.clone(),
            record.execution_class,
            token_hash,
            sender,
        );
        let session_id = session.session_id.clone();
        state.sessions.insert(session_id.clone(), session);

        tracing::info!(
            session_id = %session_id,
            agent = %record.agent_identity,
            class = record.execution_class.as_str(),
            "agent session opened"
        );

        Ok(SessionHandle {
            session_id,
            agent_identity: record.agent_identity,
            execution_class: record.execution_class,
            outbound,
        })
    }

    /// Applies one inbound frame. Protocol violations close the session before
    /// the error is returned to the transport.
    pub fn receive(&self, session_id: &SessionId, frame: Frame) -> OrchestrationResult<()> {
        let outcome = match frame.kind {
            FrameKind::Hello => self.handshake(session_id),
            FrameKind::Heartbeat => self.heartbeat_with(session_id, frame.draining_flag()),
            FrameKind::Result | FrameKind::Error => {
                let correlation_id = frame.correlation_id.clone().ok_or_else(|| {
                    CoreError::for_session(
                        session_id.clone(),
                        CoreErrorKind::ProtocolViolation,
                        format!("{} frame without correlation_id", frame.kind.as_str()),
                    )
                });
                correlation_id.and_then(|correlation_id| {
                    let outcome = if frame.kind == FrameKind::Result {
                        Ok(frame.payload)
                    } else {
                        Err(CoreError::new(
                            CoreErrorKind::ExecutionFailure,
                            frame.error_message(),
                        ))
                    };
                    self.complete(session_id, &correlation_id, outcome).map(|_| ())
                })
            }
            FrameKind::Command | FrameKind::Cancel => Err(CoreError::for_session(
                session_id.clone(),
                CoreErrorKind::ProtocolViolation,
                format!("agents may not send '{}' frames", frame.kind.as_str()),
            )),
        };

        if let Err(error) = &outcome
            && matches!(
                error.kind,
                CoreErrorKind::ProtocolViolation | CoreErrorKind::Unauthorized
            )
        {
            tracing::warn!(
                session_id = %session_id,
                kind = ?error.kind,
                message = %error.message,
                "closing session after protocol violation"
            );
            self.disconnect(session_id, &error.message);
        }
        outcome
    }

    pub fn handshake(&self, session_id: &SessionId) -> OrchestrationResult<()> {
        let mut state = self.lock_state()?;
        let session = live_session(&mut state, session_id)?;
        if session.state() != ConnectionState::Handshaking {
            return Err(CoreError::for_session(
                session_id.clone(),
                CoreErrorKind::ProtocolViolation,
                "hello received after the handshake completed",
            ));
        }
        session.transition(ConnectionState::Authenticated)?;
        session.touch();
        tracing::debug!(session_id = %session_id, "agent handshake completed");
        Ok(())
    }

    pub fn heartbeat(&self, session_id: &SessionId) -> OrchestrationResult<()> {
        self.heartbeat_with(session_id, None)
    }

    fn heartbeat_with(
        &self,
        session_id: &SessionId,
        draining: Option<bool>,
    ) -> OrchestrationResult<()> {
        let mut state = self.lock_state()?;
        let session = live_session(&mut state, session_id)?;
        session.touch();

        let became_available = match (session.state(), draining) {
            (ConnectionState::Handshaking, _) => {
                return Err(CoreError::for_session(
                    session_id.clone(),
                    CoreErrorKind::ProtocolViolation,
                    "heartbeat received before hello",
                ));
            }
            (ConnectionState::Authenticated, _) => {
                session.transition(ConnectionState::Active)?;
                tracing::info!(
                    session_id = %session_id,
                    agent = %session.agent_identity,
                    "agent session active"
                );
                true
            }
            (ConnectionState::Active, Some(true)) => {
                session.transition(ConnectionState::Draining)?;
                false
            }
            (ConnectionState::Draining, Some(false)) => {
                session.transition(ConnectionState::Active)?;
                true
            }
            _ => false,
        };

        if became_available && session.is_available() {
            self.capacity.notify_one();
        }
        Ok(())
    }

    /// Stops new work from reaching `session_id`; its in-flight command may finish.
    pub fn drain(&self, session_id: &SessionId) -> OrchestrationResult<SessionSummary> {
        let mut state = self.lock_state()?;
        let session = live_session(&mut state, session_id)?;
        if session.state() != ConnectionState::Draining {
            operator_transition(session, ConnectionState::Draining)?;
            tracing::info!(session_id = %session_id, "agent session draining");
        }
        Ok(session.summary())
    }

    pub fn resume(&self, session_id: &SessionId) -> OrchestrationResult<SessionSummary> {
        let mut state = self.lock_state()?;
        let session = live_session(&mut state, session_id)?;
        if session.state() != ConnectionState::Active {
            operator_transition(session, ConnectionState::Active)?;
            tracing::info!(session_id = %session_id, "agent session resumed");
        }
        if session.is_available() {
            self.capacity.notify_one();
        }
        Ok(session.summary())
    }

    /// Sends exactly one command on `session_id`. Fails fast when the session is
    /// not active or already carries a command.
    pub fn dispatch(
        &self,
        session_id: &SessionId,
        command: &TaskCommand,
    ) -> OrchestrationResult<PendingCommand> {
        let mut state = self.lock_state()?;
        let session = live_session(&mut state, session_id)?;
        if session.state() != ConnectionState::Active {
            return Err(CoreError::for_session(
                session_id.clone(),
                CoreErrorKind::Conflict,
                format!(
                    "session is '{}' and cannot accept commands",
                    session.state().as_str()
                ),
            ));
        }
        if let Some(in_flight) = session.in_flight() {
            return Err(CoreError::for_session(
                session_id.clone(),
                CoreErrorKind::Conflict,
                format!(
                    "session already carries task '{}'",
                    in_flight.task_id.0
                ),
            ));
        }
        dispatch_locked(&mut state, session_id, command)
    }

    /// Sends `command` to the least recently used idle session of its class.
    /// `None` means no agent can take it right now.
    pub fn dispatch_available(&self, command: &TaskCommand) -> Option<PendingCommand> {
        let mut state = match self.lock_state() {
            Ok(state) => state,
            Err(error) => {
                tracing::error!(message = %error.message, "agent registry unavailable");
                return None;
            }
        };

        loop {
            let candidate = state
                .sessions
                .values()
                .filter(|session| {
                    session.execution_class == command.execution_class && session.is_available()
                })
                .min_by_key(|session| session.last_assigned)
                .map(|session| session.session_id.clone())?;

            match dispatch_locked(&mut state, &candidate, command) {
                Ok(pending) => return Some(pending),
                Err(error) => {
                    tracing::warn!(
                        session_id = %candidate,
                        task_id = command.task_id.0,
                        message = %error.message,
                        "command could not be written; closing session"
                    );
                    close_locked(&mut state, &candidate, &error.message);
                }
            }
        }
    }

    /// Matches an inbound outcome to its pending command and frees the session.
    /// Returns `false` for correlations nobody waits for any more.
    pub fn complete(
        &self,
        session_id: &SessionId,
        correlation_id: &CorrelationId,
        outcome: OrchestrationResult<Value>,
    ) -> OrchestrationResult<bool> {
        let mut state = self.lock_state()?;
        live_session(&mut state, session_id)?;

        match state.pending.get(correlation_id) {
            None => {
                tracing::debug!(
                    session_id = %session_id,
                    correlation_id = %correlation_id,
                    "dropping outcome for a command nobody awaits"
                );
                if let Some(session) = state.sessions.get_mut(session_id) {
                    session.release(correlation_id);
                }
                return Ok(false);
            }
            Some(pending) if &pending.session_id != session_id => {
                return Err(CoreError::for_session(
                    session_id.clone(),
                    CoreErrorKind::ProtocolViolation,
                    format!("correlation '{correlation_id}' belongs to another session"),
                ));
            }
            Some(_) => {}
        }

        let Some(pending) = state.pending.remove(correlation_id) else {
            return Ok(false);
        };
        let mut available = false;
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.release(correlation_id);
            session.completed_commands = session.completed_commands.saturating_add(1);
            available = session.is_available();
        }
        drop(state);

        tracing::debug!(
            session_id = %session_id,
            task_id = pending.task_id.0,
            succeeded = outcome.is_ok(),
            "agent reported command outcome"
        );
        let _ = pending.reply.send(outcome);
        if available {
            self.capacity.notify_one();
        }
        Ok(true)
    }

    /// Sends a best-effort `cancel` frame and frees the session without waiting
    /// for the agent to acknowledge.
    pub fn cancel_command(&self, session_id: &SessionId, correlation_id: &CorrelationId) {
        self.release_command(session_id, correlation_id, "cancelled");
    }

    /// The command outlived its deadline. The session is freed on the assumption
    /// that the agent lost it, even if it is still working.
    pub fn abandon_command(&self, session_id: &SessionId, correlation_id: &CorrelationId) {
        tracing::warn!(
            session_id = %session_id,
            correlation_id = %correlation_id,
            "abandoning command after deadline; releasing session"
        );
        self.release_command(session_id, correlation_id, "abandoned");
    }

    fn release_command(&self, session_id: &SessionId, correlation_id: &CorrelationId, why: &str) {
        let Ok(mut state) = self.lock_state() else {
            tracing::error!(session_id = %session_id, "agent registry unavailable during release");
            return;
        };
        let pending = state.pending.remove(correlation_id);
        let mut available = false;
        if let Some(session) = state.sessions.get_mut(session_id)
            && let Some(in_flight) = session.release(correlation_id)
        {
            if let Err(error) = session.send(Frame::cancel(
                in_flight.correlation_id.clone(),
                in_flight.task_id,
            )) {
                tracing::debug!(
                    session_id = %session_id,
                    message = %error.message,
                    "cancel frame could not be written"
                );
            }
            available = session.is_available();
        }
        drop(state);

        if let Some(pending) = pending {
            let _ = pending.reply.send(Err(CoreError::for_task(
                pending.task_id,
                CoreErrorKind::Cancelled,
                format!("command {why} by the server"),
            )));
        }
        if available {
            self.capacity.notify_one();
        }
    }

    /// Closes `session_id` and fails its in-flight command, if any, for retry.
    pub fn disconnect(&self, session_id: &SessionId, reason: &str) {
        match self.lock_state() {
            Ok(mut state) => close_locked(&mut state, session_id, reason),
            Err(error) => {
                tracing::error!(session_id = %session_id, message = %error.message, "agent registry unavailable during disconnect")
            }
        }
    }

    /// Closes sessions whose heartbeat is older than the grace window, evicts
    /// sessions closed for longer than one grace window and drops expired
    /// download tokens. Returns the sessions closed by this pass.
    pub fn sweep_expired(&self) -> Vec<SessionId> {
        let Ok(mut state) = self.lock_state() else {
            tracing::error!("agent registry unavailable during sweep");
            return Vec::new();
        };
        let now = Instant::now();
        let grace = self.settings.heartbeat_grace;

        let expired: Vec<SessionId> = state
            .sessions
            .values()
            .filter(|session| {
                session.state() != ConnectionState::Closed && session.silent_since(now) > grace
            })
            .map(|session| session.session_id.clone())
            .collect();
        for session_id in &expired {
            close_locked(&mut state, session_id, "heartbeat timeout");
        }

        state.sessions.retain(|_, session| {
            session
                .closed_at
                .is_none_or(|closed_at| now.saturating_duration_since(closed_at) <= grace)
        });
        state.grants.retain(|_, grant| grant.expires_at > now);

        expired
    }

    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let period = (self.settings.heartbeat_interval.min(self.settings.heartbeat_grace) / 2)
            .max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep_expired();
            }
        })
    }

    /// Sessions that are not closed, oldest connection first.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        let Ok(state) = self.lock_state() else {
            return Vec::new();
        };
        let mut summaries: Vec<SessionSummary> = state
            .sessions
            .values()
            .filter(|session| session.state() != ConnectionState::Closed)
            .map(AgentSession::summary)
            .collect();
        summaries.sort_by_key(|summary| summary.connected_at);
        summaries
    }

    pub fn session(&self, session_id: &SessionId) -> Option<SessionSummary> {
        self.lock_state()
            .ok()?
            .sessions
            .get(session_id)
            .map(AgentSession::summary)
    }

    fn lock_state(&self) -> OrchestrationResult<MutexGuard<'_, RegistryState>> {
        self.inner.lock().map_err(|_| {
            CoreError::new(CoreErrorKind::Internal, "agent registry mutex poisoned")
        })
    }
}

fn live_session<'a>(
    state: &'a mut RegistryState,
    session_id: &SessionId,
) -> OrchestrationResult<&'a mut AgentSession> {
    match state.sessions.get_mut(session_id) {
        Some(session) if session.state() != ConnectionState::Closed => Ok(session),
        Some(_) => Err(CoreError::for_session(
            session_id.clone(),
            CoreErrorKind::SessionLost,
            "session is closed",
        )),
        None => Err(CoreError::for_session(
            session_id.clone(),
            CoreErrorKind::NotFound,
            format!("unknown session '{session_id}'"),
        )),
    }
}

/// Collaborator-requested moves that the session state forbids are conflicts,
/// not agent protocol faults.
fn operator_transition(
    session: &mut AgentSession,
    next: ConnectionState,
) -> OrchestrationResult<()> {
    session.transition(next).map_err(|mut error| {
        error.kind = CoreErrorKind::Conflict;
        error
    })
}

fn dispatch_locked(
    state: &mut RegistryState,
    session_id: &SessionId,
    command: &TaskCommand,
) -> OrchestrationResult<PendingCommand> {
    let correlation_id = CorrelationId::random();
    let session = live_session(state, session_id)?;
    session.send(Frame::command(correlation_id.clone(), command))?;
    session.occupy(InFlight {
        task_id: command.task_id,
        correlation_id: correlation_id.clone(),
    });
    let agent_identity = session.agent_identity.clone();

    let (reply, receiver) = oneshot::channel();
    state.pending.insert(
        correlation_id.clone(),
        PendingReply {
            session_id: session_id.clone(),
            task_id: command.task_id,
            reply,
        },
    );

    tracing::debug!(
        session_id = %session_id,
        task_id = command.task_id.0,
        attempt = command.attempt,
        "command dispatched to agent"
    );

    Ok(PendingCommand {
        session_id: session_id.clone(),
        agent_identity,
        correlation_id,
        task_id: command.task_id,
        reply: receiver,
    })
}

fn close_locked(state: &mut RegistryState, session_id: &SessionId, reason: &str) {
    let Some(session) = state.sessions.get_mut(session_id) else {
        return;
    };
    if session.state() == ConnectionState::Closed {
        return;
    }
    let in_flight = session.close();
    tracing::info!(
        session_id = %session_id,
        agent = %session.agent_identity,
        reason,
        "agent session closed"
    );

    if let Some(in_flight) = in_flight
        && let Some(pending) = state.pending.remove(&in_flight.correlation_id)
    {
        let _ = pending.reply.send(Err(CoreError {
            task: Some(pending.task_id),
            session: Some(session_id.clone()),
            kind: CoreErrorKind::SessionLost,
            message: format!("agent session closed: {reason}"),
        }));
    }
}
