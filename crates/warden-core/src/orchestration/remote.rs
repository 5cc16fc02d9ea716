use std::sync::Arc;

use crate::agents::AgentRegistry;
use crate::models::{
    CoreError, CoreErrorKind, CorrelationId, ExecutionTarget, SessionId, TaskCommand,
};
use crate::orchestration::dispatcher::{Assignment, AssignmentControl, TaskFuture, Worker};

/// Sends remote-class tasks to connected agents, one command per session.
#[derive(Clone)]
pub struct RemoteFleet {
    registry: AgentRegistry,
}

impl RemoteFleet {
    pub fn new(registry: AgentRegistry) -> Self {
        Self { registry }
    }
}

impl Worker for RemoteFleet {
    fn assign(&self, command: &TaskCommand) -> Option<Assignment> {
        let pending = self.registry.dispatch_available(command)?;
        let task_id = command.task_id;
        let session_id = pending.session_id.clone();

        let control = Arc::new(RemoteControl {
            registry: self.registry.clone(),
            session_id: pending.session_id.clone(),
            correlation_id: pending.correlation_id.clone(),
        });

        let reply = pending.reply;
        let lost_session = session_id.clone();
        let work: TaskFuture = Box::pin(async move {
            match reply.await {
                Ok(outcome) => outcome,
                Err(_) => Err(CoreError {
                    task: Some(task_id),
                    session: Some(lost_session),
                    kind: CoreErrorKind::SessionLost,
                    message: "agent session dropped the command".to_string(),
                }),
            }
        });

        Some(Assignment {
            target: ExecutionTarget::Agent {
                session_id,
                agent_identity: pending.agent_identity,
            },
            work,
            control,
        })
    }
}

struct RemoteControl {
    registry: AgentRegistry,
    session_id: SessionId,
    correlation_id: CorrelationId,
}

impl AssignmentControl for RemoteControl {
    fn cancel(&self) {
        self.registry
            .cancel_command(&self.session_id, &self.correlation_id);
    }

    fn abandon(&self) {
        self.registry
            .abandon_command(&self.session_id, &self.correlation_id);
    }
}
