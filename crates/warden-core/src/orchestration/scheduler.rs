use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, timeout};

use crate::config::DispatchConfig;
use crate::models::{
    CoreError, CoreErrorKind, ExecutionClass, TaskCommand, TaskId, TaskPriority, TaskRecord,
    TaskSnapshot, TaskSpec, TaskStatus, WaitReason,
};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::dispatcher::{Assignment, AssignmentControl, CommandDispatcher};
use crate::orchestration::events::{TaskEvent, TaskEvents};

const BUCKETS: usize = TaskPriority::DRAIN_ORDER.len();

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TerminalCounts {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub queued_by_priority: BTreeMap<TaskPriority, usize>,
    pub running_by_class: BTreeMap<ExecutionClass, usize>,
    pub running_total: usize,
    pub waiting_by_reason: BTreeMap<WaitReason, usize>,
    pub terminal_counts: TerminalCounts,
}

struct RunningAttempt {
    attempt: u32,
    control: Arc<dyn AssignmentControl>,
    driver: AbortHandle,
}

struct TaskEntry {
    record: TaskRecord,
    attempts: u32,
    running: Option<RunningAttempt>,
    finished: Option<Instant>,
    terminal: Arc<Notify>,
}

struct SchedulerState {
    next_task_id: u64,
    tasks: HashMap<TaskId, TaskEntry>,
    buckets: [VecDeque<TaskId>; BUCKETS],
    running_total: usize,
    running_by_class: HashMap<ExecutionClass, usize>,
    terminal_counts: TerminalCounts,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            next_task_id: 1,
            tasks: HashMap::new(),
            buckets: Default::default(),
            running_total: 0,
            running_by_class: HashMap::new(),
            terminal_counts: TerminalCounts::default(),
        }
    }

    fn running_in(&self, class: ExecutionClass) -> usize {
        self.running_by_class.get(&class).copied().unwrap_or(0)
    }

    fn release_slot(&mut self, class: ExecutionClass) {
        self.running_total = self.running_total.saturating_sub(1);
        if let Some(running) = self.running_by_class.get_mut(&class) {
            *running = running.saturating_sub(1);
        }
    }

    fn count_terminal(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.terminal_counts.completed += 1,
            TaskStatus::Failed => self.terminal_counts.failed += 1,
            TaskStatus::Cancelled => self.terminal_counts.cancelled += 1,
            _ => {}
        }
    }
}

/// Priority-bucketed admission over a [`CommandDispatcher`]. Cloning shares the
/// same task table; every clone drives the same queue.
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<Mutex<SchedulerState>>,
    config: Arc<DispatchConfig>,
    dispatcher: CommandDispatcher,
    events: TaskEvents,
    wake: Arc<Notify>,
    capacity: Option<Arc<Notify>>,
}

impl PriorityScheduler {
    pub fn new(config: DispatchConfig, dispatcher: CommandDispatcher) -> OrchestrationResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(SchedulerState::new())),
            config: Arc::new(config),
            dispatcher,
            events: TaskEvents::new(),
            wake: Arc::new(Notify::new()),
            capacity: None,
        })
    }

    /// Ids below `first` are never handed out, so persisted tasks keep theirs.
    pub fn with_first_task_id(self, first: TaskId) -> Self {
        if let Ok(mut state) = self.inner.lock() {
            state.next_task_id = state.next_task_id.max(first.0);
        }
        self
    }

    /// Also wake the admission loop when `signal` fires, e.g. an agent becoming idle.
    pub fn with_capacity_signal(mut self, signal: Arc<Notify>) -> Self {
        self.capacity = Some(signal);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn events(&self) -> &TaskEvents {
        &self.events
    }

    pub fn subscribe(&self) -> UnboundedReceiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Queues a task without blocking. Admission happens on the next tick.
    pub fn submit(&self, spec: TaskSpec) -> OrchestrationResult<TaskId> {
        if self.config.class_cap(spec.execution_class) == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!(
                    "execution class '{}' is disabled",
                    spec.execution_class.as_str()
                ),
            ));
        }
        if spec.max_retries == Some(0) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "max_retries must be at least one",
            ));
        }
        if spec.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "timeout must be greater than zero",
            ));
        }

        let mut state = self.lock_state()?;
        let task_id = TaskId(state.next_task_id);
        state.next_task_id = state.next_task_id.saturating_add(1);

        let record = TaskRecord {
            id: task_id,
            execution_class: spec.execution_class,
            priority: spec.priority,
            status: TaskStatus::Queued,
            payload: spec.payload,
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            retries: 0,
            max_retries: spec.max_retries.unwrap_or(self.config.max_retries),
            timeout: spec.timeout.unwrap_or_else(|| self.config.task_timeout()),
            case_id: spec.case_id,
            investigation_id: spec.investigation_id,
            wait_reason: None,
            assigned_to: None,
            result: None,
            error: None,
        };

        tracing::debug!(
            task_id = task_id.0,
            class = record.execution_class.as_str(),
            priority = record.priority.as_str(),
            "task queued"
        );

        state.buckets[record.priority.bucket_index()].push_back(task_id);
        state.tasks.insert(
            task_id,
            TaskEntry {
                record,
                attempts: 0,
                running: None,
                finished: None,
                terminal: Arc::new(Notify::new()),
            },
        );
        drop(state);

        self.wake.notify_one();
        Ok(task_id)
    }

    pub fn status(&self, task_id: TaskId) -> OrchestrationResult<TaskSnapshot> {
        let state = self.lock_state()?;
        state
            .tasks
            .get(&task_id)
            .map(|entry| entry.record.snapshot())
            .ok_or_else(|| task_lookup_error(task_id))
    }

    pub fn snapshot(&self, task_id: TaskId) -> OrchestrationResult<TaskSnapshot> {
        self.status(task_id)
    }

    /// `Ok(false)` when the task already reached a terminal state. A running
    /// task is marked cancelled immediately; stopping the work is best effort.
    pub fn cancel(&self, task_id: TaskId) -> OrchestrationResult<bool> {
        let mut state = self.lock_state()?;
        let entry = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| task_lookup_error(task_id))?;
        let prior = entry.record.status;
        if prior.is_terminal() {
            return Ok(false);
        }
        entry.record.advance(TaskStatus::Cancelled)?;

        let class = entry.record.execution_class;
        let bucket = entry.record.priority.bucket_index();
        let running = entry.running.take();
        entry.record.completed_at = Some(SystemTime::now());
        entry.record.wait_reason = None;
        entry.finished = Some(Instant::now());
        let snapshot = entry.record.snapshot();
        let terminal = entry.terminal.clone();

        if let Some(running) = running {
            running.driver.abort();
            running.control.cancel();
            state.release_slot(class);
        } else {
            state.buckets[bucket].retain(|queued| *queued != task_id);
        }
        state.count_terminal(TaskStatus::Cancelled);

        tracing::info!(
            task_id = task_id.0,
            class = class.as_str(),
            prior = prior.as_str(),
            "task cancelled"
        );
        self.events.publish(TaskEvent::Cancelled(snapshot));
        drop(state);

        terminal.notify_waiters();
        self.wake.notify_one();
        Ok(true)
    }

    pub fn stats(&self) -> OrchestrationResult<SchedulerStats> {
        let state = self.lock_state()?;
        let mut stats = SchedulerStats {
            running_total: state.running_total,
            terminal_counts: state.terminal_counts,
            ..SchedulerStats::default()
        };

        for priority in TaskPriority::DRAIN_ORDER {
            stats
                .queued_by_priority
                .insert(priority, state.buckets[priority.bucket_index()].len());
        }
        for class in ExecutionClass::ALL {
            stats.running_by_class.insert(class, state.running_in(class));
        }
        for entry in state.tasks.values() {
            if entry.record.status.is_waiting()
                && let Some(reason) = entry.record.wait_reason
            {
                *stats.waiting_by_reason.entry(reason).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    /// Resolves once `task_id` is terminal, or fails with `Timeout` after `timeout_duration`.
    pub async fn wait_for_terminal(
        &self,
        task_id: TaskId,
        timeout_duration: Option<Duration>,
    ) -> OrchestrationResult<TaskSnapshot> {
        loop {
            let terminal = {
                let state = self.lock_state()?;
                let entry = state
                    .tasks
                    .get(&task_id)
                    .ok_or_else(|| task_lookup_error(task_id))?;
                entry.terminal.clone()
            };

            let notified = terminal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snapshot = self.status(task_id)?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }

            match timeout_duration {
                Some(duration) => timeout(duration, notified).await.map_err(|_| {
                    CoreError::for_task(
                        task_id,
                        CoreErrorKind::Timeout,
                        format!("timed out waiting for task '{}' to finish", task_id.0),
                    )
                })?,
                None => notified.await,
            }
        }
    }

    /// One admission pass over the buckets, critical first. A class that is at
    /// its cap or has no idle agent is skipped in place so the tasks behind it
    /// keep their order. Returns how many tasks started.
    pub fn tick(&self) -> OrchestrationResult<usize> {
        let mut state = self.lock_state()?;
        let mut blocked: HashMap<ExecutionClass, WaitReason> = HashMap::new();
        let mut started = 0;

        for bucket in 0..BUCKETS {
            let mut position = 0;
            while position < state.buckets[bucket].len() {
                let task_id = state.buckets[bucket][position];
                let Some(entry) = state.tasks.get(&task_id) else {
                    state.buckets[bucket].remove(position);
                    continue;
                };
                let class = entry.record.execution_class;

                let reason = if let Some(reason) = blocked.get(&class) {
                    Some(*reason)
                } else if state.running_total >= self.config.max_concurrent {
                    Some(WaitReason::GlobalCapacity)
                } else if state.running_in(class) >= self.config.class_cap(class) {
                    blocked.insert(class, WaitReason::ClassCapacity);
                    Some(WaitReason::ClassCapacity)
                } else {
                    None
                };

                if let Some(reason) = reason {
                    set_wait_reason(&mut state, task_id, reason);
                    position += 1;
                    continue;
                }

                let Some(entry) = state.tasks.get(&task_id) else {
                    continue;
                };
                let command = entry.record.command(entry.attempts + 1);
                match self.dispatcher.assign(&command) {
                    Some(assignment) => {
                        state.buckets[bucket].remove(position);
                        self.start_locked(&mut state, command, assignment);
                        started += 1;
                    }
                    None => {
                        blocked.insert(class, WaitReason::NoAgentAvailable);
                        set_wait_reason(&mut state, task_id, WaitReason::NoAgentAvailable);
                        position += 1;
                    }
                }
            }
        }

        Ok(started)
    }

    /// Runs admission until the handle is aborted. The loop wakes on submissions,
    /// finished attempts, capacity signals and the configured tick interval,
    /// which also prunes retained terminal tasks.
    pub fn spawn(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let capacity = scheduler
                .capacity
                .clone()
                .unwrap_or_else(|| Arc::new(Notify::new()));
            let mut ticker = tokio::time::interval(scheduler.config.tick_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                if let Err(error) = scheduler.tick() {
                    tracing::error!(
                        kind = ?error.kind,
                        message = %error.message,
                        "scheduler admission pass failed"
                    );
                }

                tokio::select! {
                    _ = scheduler.wake.notified() => {}
                    _ = capacity.notified() => {}
                    _ = ticker.tick() => {
                        scheduler.prune_terminal();
                    }
                }
            }
        })
    }

    /// Forgets terminal tasks older than the retention window. Returns how many.
    pub fn prune_terminal(&self) -> usize {
        let Ok(mut state) = self.lock_state() else {
            return 0;
        };
        let retention = self.config.terminal_retention();
        let now = Instant::now();
        let before = state.tasks.len();
        state.tasks.retain(|_, entry| {
            entry
                .finished
                .is_none_or(|finished| now.saturating_duration_since(finished) < retention)
        });
        let pruned = before - state.tasks.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned terminal tasks from memory");
        }
        pruned
    }

    fn start_locked(
        &self,
        state: &mut SchedulerState,
        command: TaskCommand,
        assignment: Assignment,
    ) {
        let Assignment {
            target,
            work,
            control,
        } = assignment;
        let Some(entry) = state.tasks.get_mut(&command.task_id) else {
            control.cancel();
            return;
        };
        if let Err(error) = entry.record.advance(TaskStatus::Running) {
            tracing::error!(task_id = command.task_id.0, %error, "refusing to start task");
            control.cancel();
            return;
        }

        entry.attempts = command.attempt;
        entry.record.started_at = Some(SystemTime::now());
        entry.record.wait_reason = None;
        entry.record.assigned_to = Some(target);
        let deadline = entry.record.timeout;
        let attempt = command.attempt;
        let snapshot = entry.record.snapshot();

        let scheduler = self.clone();
        let driver_control = control.clone();
        let driver = tokio::spawn(async move {
            let outcome = CommandDispatcher::drive(work, driver_control, &command, deadline).await;
            scheduler.finish(command.task_id, command.attempt, outcome);
        });

        let class = snapshot.execution_class;
        if let Some(entry) = state.tasks.get_mut(&snapshot.id) {
            entry.running = Some(RunningAttempt {
                attempt,
                control,
                driver: driver.abort_handle(),
            });
        }
        state.running_total += 1;
        *state.running_by_class.entry(class).or_insert(0) += 1;

        tracing::info!(
            task_id = snapshot.id.0,
            class = class.as_str(),
            priority = snapshot.priority.as_str(),
            attempt,
            "task admitted"
        );
        self.events.publish(TaskEvent::Admitted(snapshot));
    }

    /// Records the outcome of one attempt. Outcomes of attempts that were
    /// cancelled or superseded are ignored.
    fn finish(&self, task_id: TaskId, attempt: u32, outcome: OrchestrationResult<Value>) {
        let Ok(mut state) = self.lock_state() else {
            tracing::error!(task_id = task_id.0, "scheduler state poisoned; outcome dropped");
            return;
        };
        let Some(entry) = state.tasks.get_mut(&task_id) else {
            return;
        };
        let current = entry
            .running
            .as_ref()
            .is_some_and(|running| running.attempt == attempt);
        let retries = match &outcome {
            Ok(_) => entry.record.retries,
            Err(_) => entry.record.retries.saturating_add(1),
        };
        let next = match &outcome {
            Ok(_) => TaskStatus::Completed,
            Err(_) if retries < entry.record.max_retries => TaskStatus::Retrying,
            Err(_) => TaskStatus::Failed,
        };
        if !current || entry.record.advance(next).is_err() {
            tracing::debug!(
                task_id = task_id.0,
                attempt,
                "ignoring outcome of a superseded attempt"
            );
            return;
        }

        entry.running = None;
        let class = entry.record.execution_class;
        let bucket = entry.record.priority.bucket_index();
        let terminal = entry.terminal.clone();

        let (event, requeue) = match outcome {
            Ok(result) => {
                entry.record.completed_at = Some(SystemTime::now());
                entry.record.result = Some(result);
                entry.record.error = None;
                entry.finished = Some(Instant::now());
                tracing::info!(task_id = task_id.0, class = class.as_str(), "task completed");
                (TaskEvent::Completed(entry.record.snapshot()), false)
            }
            Err(error) => {
                entry.record.retries = retries;
                entry.record.error = Some(error.message.clone());
                if next == TaskStatus::Retrying {
                    tracing::warn!(
                        task_id = task_id.0,
                        class = class.as_str(),
                        kind = ?error.kind,
                        message = %error.message,
                        retries = entry.record.retries,
                        max_retries = entry.record.max_retries,
                        "task attempt failed; retrying"
                    );
                    (TaskEvent::Retrying(entry.record.snapshot()), true)
                } else {
                    entry.record.completed_at = Some(SystemTime::now());
                    entry.finished = Some(Instant::now());
                    tracing::error!(
                        task_id = task_id.0,
                        class = class.as_str(),
                        kind = ?error.kind,
                        message = %error.message,
                        retries = entry.record.retries,
                        "task failed after exhausting retries"
                    );
                    (TaskEvent::Failed(entry.record.snapshot()), false)
                }
            }
        };

        state.release_slot(class);
        if requeue {
            state.buckets[bucket].push_back(task_id);
        }
        if event.is_terminal() {
            state.count_terminal(event.snapshot().status);
        }
        let is_terminal = event.is_terminal();
        self.events.publish(event);
        drop(state);

        if is_terminal {
            terminal.notify_waiters();
        }
        self.wake.notify_one();
    }

    fn lock_state(&self) -> OrchestrationResult<MutexGuard<'_, SchedulerState>> {
        self.inner
            .lock()
            .map_err(|_| CoreError::new(CoreErrorKind::Internal, "scheduler mutex poisoned"))
    }
}

fn set_wait_reason(state: &mut SchedulerState, task_id: TaskId, reason: WaitReason) {
    if let Some(entry) = state.tasks.get_mut(&task_id) {
        entry.record.wait_reason = Some(reason);
    }
}

fn task_lookup_error(task_id: TaskId) -> CoreError {
    CoreError::for_task(
        task_id,
        CoreErrorKind::NotFound,
        format!("unknown task id '{}'", task_id.0),
    )
}
