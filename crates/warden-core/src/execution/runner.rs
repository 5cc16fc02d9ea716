use std::sync::Arc;

use serde_json::json;

use crate::execution::{
    CommandSpec, ProcessExecutor, ProcessExitStatus, ProcessSpawnRequest, TokioProcessExecutor,
    spawn_validated,
};
use crate::models::{CoreError, CoreErrorKind, TaskCommand};
use crate::orchestration::{LocalRunner, TaskFuture};

const STDERR_TAIL: usize = 512;

/// Runs `local` tasks whose payload names a program to execute.
#[derive(Clone)]
pub struct ProcessRunner {
    executor: Arc<dyn ProcessExecutor>,
}

impl ProcessRunner {
    pub fn new(executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { executor }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Arc::new(TokioProcessExecutor))
    }
}

impl LocalRunner for ProcessRunner {
    fn run(&self, command: TaskCommand) -> TaskFuture {
        let executor = self.executor.clone();
        Box::pin(async move {
            let task_id = command.task_id;
            let spec = CommandSpec::from_payload(&command.payload)
                .map_err(|error| error.attribute(task_id))?;
            let request = ProcessSpawnRequest::new(spec).task_id(task_id);
            let process = spawn_validated(executor.as_ref(), request)?;
            let output = process.wait().await?;

            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            match output.status {
                ProcessExitStatus::ExitCode(0) => Ok(json!({
                    "exit_code": 0,
                    "stdout": stdout,
                    "stderr": stderr,
                })),
                ProcessExitStatus::ExitCode(code) => Err(CoreError::for_task(
                    task_id,
                    CoreErrorKind::ExecutionFailure,
                    format!("process exited with status {code}: {}", tail(&stderr)),
                )),
                ProcessExitStatus::Terminated => Err(CoreError::for_task(
                    task_id,
                    CoreErrorKind::ExecutionFailure,
                    "process was terminated by a signal",
                )),
            }
        })
    }
}

fn tail(text: &str) -> &str {
    let trimmed = text.trim_end();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}
