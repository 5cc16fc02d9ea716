use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::execution::{
    CommandSpec, ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput,
    ProcessSpawnRequest, ProcessWaitFuture, RunningProcess,
};
use crate::models::{CoreError, CoreErrorKind, TaskId};

/// How long output readers may keep going once the child has exited.
/// Grandchildren can hold the pipes open indefinitely.
const PIPE_DRAIN_WINDOW: Duration = Duration::from_millis(250);
const REAP_WINDOW: Duration = Duration::from_secs(1);

/// Spawns each task command as the leader of its own process group so the whole
/// tree can be killed at once.
pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let ProcessSpawnRequest {
            task_id,
            command,
            timeout,
            ..
        } = request;

        let child = build_command(&command).spawn().map_err(|error| {
            process_failure(
                task_id,
                format!("failed to spawn '{}': {error}", command.program.display()),
            )
        })?;
        let pid = child.id();
        tracing::debug!(
            task_id = task_id.map(|task_id| task_id.0),
            pid,
            program = %command.program.display(),
            "process spawned"
        );

        Ok(Box::new(TaskProcess {
            child,
            pid,
            task_id,
            timeout,
            started_at: SystemTime::now(),
        }))
    }
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    command.process_group(0);
    command
}

struct TaskProcess {
    child: Child,
    pid: Option<u32>,
    task_id: Option<TaskId>,
    timeout: Option<Duration>,
    started_at: SystemTime,
}

impl RunningProcess for TaskProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn wait(self: Box<Self>) -> ProcessWaitFuture {
        let TaskProcess {
            mut child,
            pid,
            task_id,
            timeout,
            started_at,
        } = *self;

        Box::pin(async move {
            let mut group = GroupKiller(pid);
            let pipes = OutputPipes::capture(&mut child);

            let exited = match timeout {
                Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
                None => Some(child.wait().await),
            };
            let Some(exited) = exited else {
                group.fire();
                let _ = tokio::time::timeout(REAP_WINDOW, child.wait()).await;
                pipes.abort();
                let limit = timeout.unwrap_or_default();
                return Err(CoreError {
                    task: task_id,
                    session: None,
                    kind: CoreErrorKind::Timeout,
                    message: format!("process timed out after {}ms", limit.as_millis()),
                });
            };
            group.disarm();

            let status = exited.map_err(|error| {
                process_failure(task_id, format!("failed to wait for process: {error}"))
            })?;
            let (stdout, stderr) = pipes.collect().await;

            Ok(ProcessOutput {
                status: match status.code() {
                    Some(code) => ProcessExitStatus::ExitCode(code),
                    None => ProcessExitStatus::Terminated,
                },
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

/// Background readers for the child's stdout and stderr.
struct OutputPipes {
    stdout: JoinHandle<Vec<u8>>,
    stderr: JoinHandle<Vec<u8>>,
}

impl OutputPipes {
    fn capture(child: &mut Child) -> Self {
        Self {
            stdout: read_to_end(child.stdout.take()),
            stderr: read_to_end(child.stderr.take()),
        }
    }

    async fn collect(self) -> (Vec<u8>, Vec<u8>) {
        (drained(self.stdout).await, drained(self.stderr).await)
    }

    fn abort(self) {
        self.stdout.abort();
        self.stderr.abort();
    }
}

fn read_to_end<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        buffer
    })
}

async fn drained(reader: JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(PIPE_DRAIN_WINDOW, reader).await {
        Ok(Ok(buffer)) => buffer,
        _ => Vec::new(),
    }
}

/// Kills the process group when fired, or when dropped while still armed. A
/// wait future that is abandoned mid-flight therefore takes its tree with it.
struct GroupKiller(Option<u32>);

impl GroupKiller {
    fn disarm(&mut self) {
        self.0 = None;
    }

    fn fire(&mut self) {
        let Some(pid) = self.0.take() else {
            return;
        };
        match kill_process_group(pid) {
            Ok(()) => tracing::debug!(pid, "killed process group"),
            Err(error) => tracing::warn!(pid, %error, "failed to kill process group"),
        }
    }
}

impl Drop for GroupKiller {
    fn drop(&mut self) {
        self.fire();
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) -> std::io::Result<()> {
    let pgid = -(pid as libc::pid_t);
    if unsafe { libc::kill(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let error = std::io::Error::last_os_error();
    match error.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(error),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

fn process_failure(task_id: Option<TaskId>, message: String) -> CoreError {
    CoreError {
        task: task_id,
        session: None,
        kind: CoreErrorKind::ProcessFailure,
        message,
    }
}
