use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;

use crate::models::{CoreError, CoreErrorKind, ExecutionTarget, TaskCommand};
use crate::orchestration::dispatcher::{Assignment, AssignmentControl, TaskFuture, Worker};

/// Body of an in-process task. The returned future may suspend freely.
pub trait LocalRunner: Send + Sync {
    fn run(&self, command: TaskCommand) -> TaskFuture;
}

impl<F> LocalRunner for F
where
    F: Fn(TaskCommand) -> TaskFuture + Send + Sync,
{
    fn run(&self, command: TaskCommand) -> TaskFuture {
        self(command)
    }
}

/// Runs local tasks as their own tokio tasks. Admission already enforced the
/// caps, so the pool never declines.
#[derive(Clone)]
pub struct LocalPool {
    runner: Arc<dyn LocalRunner>,
}

impl LocalPool {
    pub fn new(runner: Arc<dyn LocalRunner>) -> Self {
        Self { runner }
    }
}

impl Worker for LocalPool {
    fn assign(&self, command: &TaskCommand) -> Option<Assignment> {
        let task_id = command.task_id;
        let body = self.runner.run(command.clone());
        let handle = tokio::spawn(body);
        let control = Arc::new(LocalControl {
            abort: Mutex::new(Some(handle.abort_handle())),
        });

        let work: TaskFuture = Box::pin(async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) if join_error.is_cancelled() => Err(CoreError::for_task(
                    task_id,
                    CoreErrorKind::Cancelled,
                    "local task body was cancelled",
                )),
                Err(join_error) => Err(CoreError::for_task(
                    task_id,
                    CoreErrorKind::ExecutionFailure,
                    format!("local task body panicked: {join_error}"),
                )),
            }
        });

        Some(Assignment {
            target: ExecutionTarget::Local,
            work,
            control,
        })
    }
}

struct LocalControl {
    abort: Mutex<Option<AbortHandle>>,
}

impl LocalControl {
    fn abort(&self) {
        if let Ok(mut slot) = self.abort.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

impl AssignmentControl for LocalControl {
    fn cancel(&self) {
        self.abort();
    }

    fn abandon(&self) {
        self.abort();
    }
}
