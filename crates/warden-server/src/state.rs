use std::sync::Arc;

use tokio::task::JoinHandle;
use warden_core::agents::AgentRegistry;
use warden_core::execution::ProcessRunner;
use warden_core::models::TaskId;
use warden_core::orchestration::{
    CommandDispatcher, LocalPool, LocalRunner, OrchestrationResult, PriorityScheduler,
    RemoteFleet, spawn_task_journal,
};
use warden_core::persistence::{EnrollmentStore, TaskStore};
use warden_core::sqlite::SqliteStore;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: PriorityScheduler,
    pub registry: AgentRegistry,
    pub task_store: Option<Arc<dyn TaskStore>>,
    pub public_url: String,
    pub channel_url: String,
    pub collaborator_token: Option<String>,
}

impl AppState {
    /// Wires scheduler, dispatcher and registry. Local tasks run as processes.
    pub fn build(config: &ServerConfig) -> OrchestrationResult<Self> {
        Self::build_with_runner(config, Arc::new(ProcessRunner::default()))
    }

    pub fn build_with_runner(
        config: &ServerConfig,
        runner: Arc<dyn LocalRunner>,
    ) -> OrchestrationResult<Self> {
        let store = match &config.database_path {
            Some(path) => {
                let store = Arc::new(SqliteStore::new(path));
                store.migrate_to_latest()?;
                tracing::info!(path = %path.display(), "sqlite store ready");
                Some(store)
            }
            None => None,
        };

        let registry = match &store {
            Some(store) => AgentRegistry::with_enrollment_store(
                &config.dispatch,
                store.clone() as Arc<dyn EnrollmentStore>,
            )?,
            None => AgentRegistry::new(&config.dispatch),
        };

        let dispatcher = CommandDispatcher::new(
            Arc::new(LocalPool::new(runner)),
            Arc::new(RemoteFleet::new(registry.clone())),
        );
        let mut scheduler = PriorityScheduler::new(config.dispatch.clone(), dispatcher)?
            .with_capacity_signal(registry.capacity_signal());

        let task_store = match store {
            Some(store) => {
                let first = store.next_task_id()?;
                scheduler = scheduler.with_first_task_id(TaskId(first));
                Some(store as Arc<dyn TaskStore>)
            }
            None => None,
        };

        Ok(Self {
            scheduler,
            registry,
            task_store,
            public_url: config.public_url.trim_end_matches('/').to_string(),
            channel_url: config.channel_url(),
            collaborator_token: config.collaborator_token.clone(),
        })
    }

    /// Admission loop, heartbeat reaper and, with a store, the task journal.
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.scheduler.spawn(), self.registry.spawn_reaper()];
        if let Some(store) = &self.task_store {
            handles.push(spawn_task_journal(&self.scheduler, store.clone()));
        }
        handles
    }
}
