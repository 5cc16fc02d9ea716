use crate::agents::EnrollmentRecord;
use crate::models::{CoreError, TaskId, TaskSnapshot};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Durable copy of task snapshots, written as the scheduler publishes them.
pub trait TaskStore: Send + Sync {
    fn upsert_task(&self, task: &TaskSnapshot) -> PersistenceResult<()>;

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<TaskSnapshot>>;

    fn list_recent_tasks(&self, limit: usize) -> PersistenceResult<Vec<TaskSnapshot>>;

    /// First id that is safe to allocate after a restart.
    fn next_task_id(&self) -> PersistenceResult<u64>;
}

pub trait EnrollmentStore: Send + Sync {
    fn save_enrollment(&self, record: &EnrollmentRecord) -> PersistenceResult<()>;

    fn find_enrollment(&self, token_hash: &str) -> PersistenceResult<Option<EnrollmentRecord>>;

    fn list_enrollments(&self) -> PersistenceResult<Vec<EnrollmentRecord>>;
}
