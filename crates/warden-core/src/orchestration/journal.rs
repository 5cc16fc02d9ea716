use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::models::{CoreError, CoreErrorKind, TaskSnapshot};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::scheduler::PriorityScheduler;
use crate::persistence::TaskStore;

/// Writes every admission, retry and terminal transition to `store`, in the
/// order the scheduler published them.
pub fn spawn_task_journal(
    scheduler: &PriorityScheduler,
    task_store: Arc<dyn TaskStore>,
) -> JoinHandle<()> {
    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let snapshot = event.snapshot().clone();
            let task_id = snapshot.id;
            if let Err(error) = persist_snapshot(task_store.clone(), snapshot).await {
                tracing::error!(
                    task_id = task_id.0,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to persist task snapshot"
                );
            }
        }
    })
}

async fn persist_snapshot(
    task_store: Arc<dyn TaskStore>,
    snapshot: TaskSnapshot,
) -> OrchestrationResult<()> {
    let task_id = snapshot.id;
    tokio::task::spawn_blocking(move || task_store.upsert_task(&snapshot))
        .await
        .map_err(|join_error| {
            CoreError::for_task(
                task_id,
                CoreErrorKind::Internal,
                format!("task persistence join failure: {join_error}"),
            )
        })?
        .map_err(|error| error.attribute(task_id))
}
