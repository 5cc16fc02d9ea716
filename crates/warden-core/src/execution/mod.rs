mod runner;
mod tokio_process;

pub use runner::ProcessRunner;
pub use tokio_process::TokioProcessExecutor;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use serde_json::Value;

use crate::models::{CoreError, CoreErrorKind, TaskId, TaskPayload};

pub type ExecutionResult<T> = Result<T, CoreError>;

pub type ProcessWaitFuture = Pin<Box<dyn Future<Output = ExecutionResult<ProcessOutput>> + Send>>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    /// Reads `{program, args?, env?, working_dir?}` out of a task payload.
    pub fn from_payload(payload: &TaskPayload) -> ExecutionResult<Self> {
        let program = payload
            .get("program")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_input("payload.program must be a string"))?;
        let mut spec = Self::new(program);

        match payload.get("args") {
            None | Some(Value::Null) => {}
            Some(Value::Array(args)) => {
                for arg in args {
                    let arg = arg
                        .as_str()
                        .ok_or_else(|| invalid_input("payload.args must contain only strings"))?;
                    spec = spec.arg(arg);
                }
            }
            Some(_) => return Err(invalid_input("payload.args must be an array")),
        }

        match payload.get("env") {
            None | Some(Value::Null) => {}
            Some(Value::Object(env)) => {
                for (key, value) in env {
                    let value = value
                        .as_str()
                        .ok_or_else(|| invalid_input("payload.env values must be strings"))?;
                    spec = spec.env(key.as_str(), value);
                }
            }
            Some(_) => return Err(invalid_input("payload.env must be an object")),
        }

        match payload.get("working_dir") {
            None | Some(Value::Null) => {}
            Some(Value::String(dir)) => spec = spec.working_dir(dir),
            Some(_) => return Err(invalid_input("payload.working_dir must be a string")),
        }

        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(invalid_input("command program path must not be empty"));
        }

        if self
            .args
            .iter()
            .any(|arg| arg.is_empty() || arg.contains('\0'))
        {
            return Err(invalid_input(
                "command args must be non-empty and must not contain NUL bytes",
            ));
        }

        if self
            .env
            .iter()
            .any(|(key, value)| key.is_empty() || key.contains('\0') || value.contains('\0'))
        {
            return Err(invalid_input(
                "environment keys and values must be non-empty and must not contain NUL bytes",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpawnRequest {
    pub task_id: Option<TaskId>,
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
    pub requested_at: SystemTime,
}

impl ProcessSpawnRequest {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            task_id: None,
            command,
            timeout: None,
            requested_at: SystemTime::now(),
        }
    }

    pub fn task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        self.command.validate()?;

        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(invalid_input(
                "timeout must be greater than zero when provided",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExitStatus {
    ExitCode(i32),
    Terminated,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessOutput {
    pub status: ProcessExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

pub trait RunningProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Dropping the returned future before it resolves kills the process group.
    fn wait(self: Box<Self>) -> ProcessWaitFuture;
}

pub trait ProcessExecutor: Send + Sync {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>>;
}

pub fn spawn_validated(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> ExecutionResult<Box<dyn RunningProcess>> {
    request.validate()?;
    executor.spawn(request)
}

fn invalid_input(message: &str) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}
