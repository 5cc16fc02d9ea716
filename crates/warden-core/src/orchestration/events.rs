use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;

use crate::models::TaskSnapshot;

#[derive(Clone, Debug, PartialEq)]
pub enum TaskEvent {
    Admitted(TaskSnapshot),
    Retrying(TaskSnapshot),
    Completed(TaskSnapshot),
    Failed(TaskSnapshot),
    Cancelled(TaskSnapshot),
}

impl TaskEvent {
    pub fn snapshot(&self) -> &TaskSnapshot {
        match self {
            Self::Admitted(snapshot)
            | Self::Retrying(snapshot)
            | Self::Completed(snapshot)
            | Self::Failed(snapshot)
            | Self::Cancelled(snapshot) => snapshot,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::Failed(_) | Self::Cancelled(_)
        )
    }
}

/// Fan-out of task lifecycle events. Every subscriber owns an unbounded channel,
/// so publishing never waits on a subscriber and a dropped receiver is pruned
/// on the next publish.
#[derive(Clone, Default)]
pub struct TaskEvents {
    subscribers: Arc<Mutex<Vec<UnboundedSender<TaskEvent>>>>,
}

impl TaskEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<TaskEvent> {
        let (sender, receiver) = unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(sender),
            Err(_) => tracing::error!("task event subscriber list poisoned; subscription dropped"),
        }
        receiver
    }

    pub fn publish(&self, event: TaskEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            tracing::error!(
                task_id = event.snapshot().id.0,
                "task event subscriber list poisoned; event dropped"
            );
            return;
        };
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Invokes `hook` once for every task that completes successfully.
    pub fn on_complete<F>(&self, hook: F) -> JoinHandle<()>
    where
        F: Fn(&TaskSnapshot) + Send + 'static,
    {
        self.spawn_hook("on_complete", hook, |event| {
            matches!(event, TaskEvent::Completed(_))
        })
    }

    /// Invokes `hook` once for every task that exhausts its retries.
    pub fn on_failed<F>(&self, hook: F) -> JoinHandle<()>
    where
        F: Fn(&TaskSnapshot) + Send + 'static,
    {
        self.spawn_hook("on_failed", hook, |event| matches!(event, TaskEvent::Failed(_)))
    }

    fn spawn_hook<F>(
        &self,
        name: &'static str,
        hook: F,
        accepts: fn(&TaskEvent) -> bool,
    ) -> JoinHandle<()>
    where
        F: Fn(&TaskSnapshot) + Send + 'static,
    {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if !accepts(&event) {
                    continue;
                }
                let snapshot = event.snapshot();
                if catch_unwind(AssertUnwindSafe(|| hook(snapshot))).is_err() {
                    tracing::error!(
                        hook = name,
                        task_id = snapshot.id.0,
                        "task hook panicked; continuing with later events"
                    );
                }
            }
        })
    }
}
