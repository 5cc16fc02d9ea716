pub mod dispatcher;
pub mod events;
pub mod journal;
pub mod local;
pub mod remote;
pub mod scheduler;

pub use dispatcher::{Assignment, AssignmentControl, CommandDispatcher, TaskFuture, Worker};
pub use events::{TaskEvent, TaskEvents};
pub use journal::spawn_task_journal;
pub use local::{LocalPool, LocalRunner};
pub use remote::RemoteFleet;
pub use scheduler::{PriorityScheduler, SchedulerStats, TerminalCounts};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
