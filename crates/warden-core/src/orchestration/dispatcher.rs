use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;

use crate::models::{CoreError, CoreErrorKind, ExecutionClass, ExecutionTarget, TaskCommand};
use crate::orchestration::OrchestrationResult;

pub type TaskFuture = Pin<Box<dyn Future<Output = OrchestrationResult<Value>> + Send>>;

/// Handle on one in-progress attempt, independent of the future that awaits it.
pub trait AssignmentControl: Send + Sync {
    /// Best-effort stop request. The attempt is already accounted as cancelled.
    fn cancel(&self);

    /// The deadline passed: release whatever the attempt holds and assume it lost.
    fn abandon(&self);
}

pub struct Assignment {
    pub target: ExecutionTarget,
    pub work: TaskFuture,
    pub control: Arc<dyn AssignmentControl>,
}

/// An execution target that can take a task right now, or decline without error.
pub trait Worker: Send + Sync {
    fn assign(&self, command: &TaskCommand) -> Option<Assignment>;
}

#[derive(Clone)]
pub struct CommandDispatcher {
    workers: HashMap<ExecutionClass, Arc<dyn Worker>>,
}

impl CommandDispatcher {
    /// Routes `local` to `local` and every remote class to `remote`.
    pub fn new(local: Arc<dyn Worker>, remote: Arc<dyn Worker>) -> Self {
        let workers = ExecutionClass::ALL
            .into_iter()
            .map(|class| {
                let worker = if class.is_remote() {
                    remote.clone()
                } else {
                    local.clone()
                };
                (class, worker)
            })
            .collect();
        Self { workers }
    }

    pub fn with_worker(mut self, class: ExecutionClass, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(class, worker);
        self
    }

    /// `None` is backpressure: nothing can take the task yet and it stays queued.
    pub fn assign(&self, command: &TaskCommand) -> Option<Assignment> {
        self.workers.get(&command.execution_class)?.assign(command)
    }

    /// Awaits one attempt under `deadline`. A missed deadline abandons the
    /// assignment and counts as an ordinary execution failure.
    pub async fn drive(
        work: TaskFuture,
        control: Arc<dyn AssignmentControl>,
        command: &TaskCommand,
        deadline: Duration,
    ) -> OrchestrationResult<Value> {
        match timeout(deadline, work).await {
            Ok(outcome) => outcome.map_err(|error| error.attribute(command.task_id)),
            Err(_) => {
                control.abandon();
                tracing::warn!(
                    task_id = command.task_id.0,
                    attempt = command.attempt,
                    class = command.execution_class.as_str(),
                    deadline_ms = deadline.as_millis() as u64,
                    "task attempt exceeded its deadline"
                );
                Err(CoreError::for_task(
                    command.task_id,
                    CoreErrorKind::Timeout,
                    format!("attempt timed out after {}ms", deadline.as_millis()),
                ))
            }
        }
    }
}
