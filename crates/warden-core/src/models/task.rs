use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{AgentIdentity, CoreError, CoreErrorKind, SessionId};

pub type TaskPayload = Map<String, Value>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionClass {
    Local,
    Blue,
    Red,
    Purple,
}

impl ExecutionClass {
    pub const ALL: [ExecutionClass; 4] = [Self::Local, Self::Blue, Self::Red, Self::Purple];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Blue => "blue",
            Self::Red => "red",
            Self::Purple => "purple",
        }
    }

    pub fn is_remote(self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl std::str::FromStr for ExecutionClass {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "local" => Ok(Self::Local),
            "blue" => Ok(Self::Blue),
            "red" => Ok(Self::Red),
            "purple" => Ok(Self::Purple),
            _ => Err(()),
        }
    }
}

/// Declaration order matters: the derived `Ord` makes `Critical` the greatest tier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub const DRAIN_ORDER: [TaskPriority; 4] =
        [Self::Critical, Self::High, Self::Normal, Self::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub(crate) fn bucket_index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Waiting in a priority bucket, either for the first attempt or a retry.
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Queued | Self::Retrying)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Queued | Self::Cancelled),
            Self::Queued => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => matches!(
                next,
                Self::Completed | Self::Failed | Self::Cancelled | Self::Retrying
            ),
            Self::Retrying => matches!(next, Self::Running | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    GlobalCapacity,
    ClassCapacity,
    NoAgentAvailable,
}

impl WaitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GlobalCapacity => "global_capacity",
            Self::ClassCapacity => "class_capacity",
            Self::NoAgentAvailable => "no_agent_available",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionTarget {
    Local,
    Agent {
        session_id: SessionId,
        agent_identity: AgentIdentity,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskSpec {
    pub execution_class: ExecutionClass,
    pub priority: TaskPriority,
    pub payload: TaskPayload,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub case_id: Option<String>,
    pub investigation_id: Option<String>,
}

impl TaskSpec {
    pub fn new(execution_class: ExecutionClass, priority: TaskPriority) -> Self {
        Self {
            execution_class,
            priority,
            payload: TaskPayload::new(),
            max_retries: None,
            timeout: None,
            case_id: None,
            investigation_id: None,
        }
    }

    pub fn payload(mut self, payload: TaskPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn case_id(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    pub fn investigation_id(mut self, investigation_id: impl Into<String>) -> Self {
        self.investigation_id = Some(investigation_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub execution_class: ExecutionClass,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub retries: u32,
    pub max_retries: u32,
    pub timeout: Duration,
    pub case_id: Option<String>,
    pub investigation_id: Option<String>,
    pub wait_reason: Option<WaitReason>,
    pub assigned_to: Option<ExecutionTarget>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskRecord {
    /// Moves the record along the status graph. Terminal records never move.
    pub fn advance(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::for_task(
                self.id,
                CoreErrorKind::Conflict,
                format!(
                    "task cannot move from '{}' to '{}'",
                    self.status.as_str(),
                    next.as_str()
                ),
            ));
        }
        self.status = next;
        Ok(())
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            execution_class: self.execution_class,
            priority: self.priority,
            status: self.status,
            wait_reason: self.wait_reason,
            assigned_to: self.assigned_to.clone(),
            retries: self.retries,
            max_retries: self.max_retries,
            case_id: self.case_id.clone(),
            investigation_id: self.investigation_id.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    pub fn command(&self, attempt: u32) -> TaskCommand {
        TaskCommand {
            task_id: self.id,
            execution_class: self.execution_class,
            attempt,
            payload: self.payload.clone(),
            case_id: self.case_id.clone(),
            investigation_id: self.investigation_id.clone(),
        }
    }
}

/// Read-only view handed to polling collaborators. The payload stays with the scheduler.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub execution_class: ExecutionClass,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub wait_reason: Option<WaitReason>,
    pub assigned_to: Option<ExecutionTarget>,
    pub retries: u32,
    pub max_retries: u32,
    pub case_id: Option<String>,
    pub investigation_id: Option<String>,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskCommand {
    pub task_id: TaskId,
    pub execution_class: ExecutionClass,
    pub attempt: u32,
    pub payload: TaskPayload,
    pub case_id: Option<String>,
    pub investigation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::{ExecutionClass, TaskId, TaskPayload, TaskPriority, TaskRecord, TaskStatus};
    use crate::models::CoreErrorKind;

    fn record(status: TaskStatus) -> TaskRecord {
        TaskRecord {
            id: TaskId(9),
            execution_class: ExecutionClass::Blue,
            priority: TaskPriority::Normal,
            status,
            payload: TaskPayload::new(),
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            retries: 0,
            max_retries: 3,
            timeout: Duration::from_secs(30),
            case_id: None,
            investigation_id: None,
            wait_reason: None,
            assigned_to: None,
            result: None,
            error: None,
        }
    }

    #[test]
    fn records_only_advance_along_the_status_graph() {
        let mut task = record(TaskStatus::Queued);
        task.advance(TaskStatus::Running).unwrap();
        task.advance(TaskStatus::Retrying).unwrap();
        task.advance(TaskStatus::Running).unwrap();
        task.advance(TaskStatus::Completed).unwrap();

        let error = task.advance(TaskStatus::Running).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Conflict);
        assert_eq!(error.task, Some(TaskId(9)));
        assert_eq!(task.status, TaskStatus::Completed);

        let mut queued = record(TaskStatus::Queued);
        assert!(queued.advance(TaskStatus::Completed).is_err());
        assert_eq!(queued.status, TaskStatus::Queued);
    }

    #[test]
    fn critical_is_the_greatest_priority() {
        let mut tiers = vec![
            TaskPriority::Normal,
            TaskPriority::Critical,
            TaskPriority::Low,
            TaskPriority::High,
        ];
        tiers.sort_by(|a, b| b.cmp(a));
        assert_eq!(tiers, TaskPriority::DRAIN_ORDER.to_vec());
    }

    #[test]
    fn terminal_statuses_reject_every_transition() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Retrying,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for status in all.iter().filter(|status| status.is_terminal()) {
            assert!(all.iter().all(|next| !status.can_transition_to(*next)));
        }
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Retrying));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
    }
}
