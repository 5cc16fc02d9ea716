use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;
use warden_core::agents::AgentRegistry;
use warden_core::config::DispatchConfig;
use warden_core::models::{
    CoreError, CoreErrorKind, ExecutionClass, TaskCommand, TaskId, TaskPriority, TaskSpec,
    TaskStatus, WaitReason,
};
use warden_core::orchestration::{
    CommandDispatcher, LocalPool, LocalRunner, OrchestrationResult, PriorityScheduler,
    RemoteFleet, TaskEvent, TaskFuture, Worker,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn runner<F, Fut>(body: F) -> Arc<dyn LocalRunner>
where
    F: Fn(TaskCommand) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OrchestrationResult<Value>> + Send + 'static,
{
    Arc::new(move |command: TaskCommand| -> TaskFuture { Box::pin(body(command)) })
}

/// Local pool for `local`, plus `red` when `red_runs_locally` so caps can be
/// exercised without agents.
fn scheduler(
    config: DispatchConfig,
    local: Arc<dyn LocalRunner>,
    red_runs_locally: bool,
) -> PriorityScheduler {
    let pool: Arc<dyn Worker> = Arc::new(LocalPool::new(local));
    let registry = AgentRegistry::new(&config);
    let mut dispatcher = CommandDispatcher::new(pool.clone(), Arc::new(RemoteFleet::new(registry)));
    if red_runs_locally {
        dispatcher = dispatcher.with_worker(ExecutionClass::Red, pool);
    }
    PriorityScheduler::new(config, dispatcher).unwrap()
}

async fn drain_events(
    events: &mut UnboundedReceiver<TaskEvent>,
    terminal_expected: usize,
) -> Vec<TaskEvent> {
    let mut seen = Vec::new();
    let mut terminal = 0;
    while terminal < terminal_expected {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for task events")
            .expect("event stream closed");
        if event.is_terminal() {
            terminal += 1;
        }
        seen.push(event);
    }
    seen
}

fn admitted(events: &[TaskEvent]) -> Vec<TaskId> {
    events
        .iter()
        .filter_map(|event| match event {
            TaskEvent::Admitted(snapshot) => Some(snapshot.id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn priorities_drain_critical_first_regardless_of_submission_order() {
    let config = DispatchConfig {
        max_concurrent: 1,
        ..DispatchConfig::default()
    };
    let scheduler = scheduler(config, runner(|_| async { Ok(json!({})) }), false);
    let mut events = scheduler.subscribe();

    let mut submitted = Vec::new();
    for priority in [
        TaskPriority::Low,
        TaskPriority::Normal,
        TaskPriority::High,
        TaskPriority::Critical,
    ] {
        let task_id = scheduler
            .submit(TaskSpec::new(ExecutionClass::Local, priority))
            .unwrap();
        submitted.push((priority, task_id));
    }

    let admission = scheduler.spawn();
    let seen = drain_events(&mut events, 4).await;
    admission.abort();

    let priorities: Vec<TaskPriority> = admitted(&seen)
        .into_iter()
        .map(|task_id| {
            submitted
                .iter()
                .find(|(_, id)| *id == task_id)
                .map(|(priority, _)| *priority)
                .unwrap()
        })
        .collect();
    assert_eq!(priorities, TaskPriority::DRAIN_ORDER.to_vec());
}

#[tokio::test]
async fn red_class_never_exceeds_its_cap() {
    let mut config = DispatchConfig::default();
    config
        .max_concurrent_per_class
        .set(ExecutionClass::Red, Some(2));

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let body = {
        let current = current.clone();
        let peak = peak.clone();
        runner(move |_| {
            let current = current.clone();
            let peak = peak.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({}))
            }
        })
    };
    let scheduler = scheduler(config, body, true);
    let admission = scheduler.spawn();

    let tasks: Vec<TaskId> = (0..5)
        .map(|_| {
            scheduler
                .submit(TaskSpec::new(ExecutionClass::Red, TaskPriority::Normal))
                .unwrap()
        })
        .collect();

    for task_id in tasks {
        let snapshot = scheduler.wait_for_terminal(task_id, WAIT).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
    }
    admission.abort();

    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn critical_red_task_runs_before_low_red_task_under_cap_of_one() {
    let mut config = DispatchConfig::default();
    config
        .max_concurrent_per_class
        .set(ExecutionClass::Red, Some(1));
    let body = runner(|_| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(json!({}))
    });
    let scheduler = scheduler(config, body, true);
    let mut events = scheduler.subscribe();

    let task_b = scheduler
        .submit(TaskSpec::new(ExecutionClass::Red, TaskPriority::Low))
        .unwrap();
    let task_a = scheduler
        .submit(TaskSpec::new(ExecutionClass::Red, TaskPriority::Critical))
        .unwrap();

    let admission = scheduler.spawn();
    let seen = drain_events(&mut events, 2).await;
    admission.abort();

    let order: Vec<(&'static str, TaskId)> = seen
        .iter()
        .map(|event| {
            let label = match event {
                TaskEvent::Admitted(_) => "admitted",
                TaskEvent::Completed(_) => "completed",
                _ => "other",
            };
            (label, event.snapshot().id)
        })
        .collect();
    assert_eq!(
        order,
        vec![
            ("admitted", task_a),
            ("completed", task_a),
            ("admitted", task_b),
            ("completed", task_b),
        ]
    );
}

#[tokio::test]
async fn capped_class_does_not_block_other_classes() {
    let mut config = DispatchConfig::default();
    config
        .max_concurrent_per_class
        .set(ExecutionClass::Red, Some(1));
    let body = runner(|command: TaskCommand| async move {
        if command.execution_class == ExecutionClass::Red {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(json!({}))
    });
    let scheduler = scheduler(config, body, true);
    let admission = scheduler.spawn();

    let slow_red = scheduler
        .submit(TaskSpec::new(ExecutionClass::Red, TaskPriority::Critical))
        .unwrap();
    let waiting_red = scheduler
        .submit(TaskSpec::new(ExecutionClass::Red, TaskPriority::Critical))
        .unwrap();
    let local = scheduler
        .submit(TaskSpec::new(ExecutionClass::Local, TaskPriority::Low))
        .unwrap();

    let local_done = scheduler.wait_for_terminal(local, WAIT).await.unwrap();
    assert_eq!(local_done.status, TaskStatus::Completed);

    let waiting = scheduler.status(waiting_red).unwrap();
    assert_eq!(waiting.status, TaskStatus::Queued);
    assert_eq!(waiting.wait_reason, Some(WaitReason::ClassCapacity));

    scheduler.wait_for_terminal(slow_red, WAIT).await.unwrap();
    scheduler.wait_for_terminal(waiting_red, WAIT).await.unwrap();
    admission.abort();
}

#[tokio::test]
async fn task_failing_twice_completes_on_third_attempt() {
    let body = runner(|command: TaskCommand| async move {
        if command.attempt < 3 {
            return Err(CoreError::new(
                CoreErrorKind::ExecutionFailure,
                format!("attempt {} failed", command.attempt),
            ));
        }
        Ok(json!({ "attempt": command.attempt }))
    });
    let scheduler = scheduler(DispatchConfig::default(), body, false);
    let mut events = scheduler.subscribe();
    let admission = scheduler.spawn();

    let task_id = scheduler
        .submit(TaskSpec::new(ExecutionClass::Local, TaskPriority::High).max_retries(3))
        .unwrap();
    let seen = drain_events(&mut events, 1).await;
    admission.abort();

    let retrying = seen
        .iter()
        .filter(|event| matches!(event, TaskEvent::Retrying(_)))
        .count();
    assert_eq!(retrying, 2);

    let snapshot = scheduler.status(task_id).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.retries, 2);
    assert_eq!(snapshot.result, Some(json!({ "attempt": 3 })));
    assert_eq!(snapshot.error, None);
}

#[tokio::test]
async fn task_failing_every_attempt_ends_failed_with_last_error() {
    let body = runner(|command: TaskCommand| async move {
        Err(CoreError::new(
            CoreErrorKind::ExecutionFailure,
            format!("attempt {} failed", command.attempt),
        ))
    });
    let scheduler = scheduler(DispatchConfig::default(), body, false);
    let admission = scheduler.spawn();

    let task_id = scheduler
        .submit(TaskSpec::new(ExecutionClass::Local, TaskPriority::Normal).max_retries(3))
        .unwrap();
    let snapshot = scheduler.wait_for_terminal(task_id, WAIT).await.unwrap();
    admission.abort();

    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.retries, 3);
    assert!(snapshot.retries <= snapshot.max_retries);
    assert_eq!(snapshot.error.as_deref(), Some("attempt 3 failed"));
    assert!(snapshot.completed_at.is_some());
}

#[tokio::test]
async fn terminal_hooks_fire_exactly_once_and_survive_panics() {
    let body = runner(|command: TaskCommand| async move {
        let fail_always = command.payload.get("fail").is_some();
        if fail_always || command.attempt == 1 {
            return Err(CoreError::new(CoreErrorKind::ExecutionFailure, "boom"));
        }
        Ok(json!({}))
    });
    let scheduler = scheduler(DispatchConfig::default(), body, false);

    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let _on_complete = scheduler.events().on_complete({
        let completed = completed.clone();
        move |_| {
            completed.fetch_add(1, Ordering::SeqCst);
        }
    });
    let _on_failed = scheduler.events().on_failed({
        let failed = failed.clone();
        move |_| {
            let seen = failed.fetch_add(1, Ordering::SeqCst);
            if seen == 0 {
                panic!("hook failure must stay isolated");
            }
        }
    });
    let admission = scheduler.spawn();

    let flaky = scheduler
        .submit(TaskSpec::new(ExecutionClass::Local, TaskPriority::Normal).max_retries(3))
        .unwrap();
    let mut payload = serde_json::Map::new();
    payload.insert("fail".to_string(), json!(true));
    let doomed_first = scheduler
        .submit(
            TaskSpec::new(ExecutionClass::Local, TaskPriority::Normal)
                .payload(payload.clone())
                .max_retries(2),
        )
        .unwrap();
    let doomed_second = scheduler
        .submit(
            TaskSpec::new(ExecutionClass::Local, TaskPriority::Normal)
                .payload(payload)
                .max_retries(1),
        )
        .unwrap();

    for task_id in [flaky, doomed_first, doomed_second] {
        scheduler.wait_for_terminal(task_id, WAIT).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    admission.abort();

    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(failed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn remote_task_without_agents_stays_queued() {
    let scheduler = scheduler(
        DispatchConfig::default(),
        runner(|_| async { Ok(json!({})) }),
        false,
    );
    let admission = scheduler.spawn();

    let task_id = scheduler
        .submit(TaskSpec::new(ExecutionClass::Blue, TaskPriority::Critical))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let snapshot = scheduler.status(task_id).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Queued);
    assert_eq!(snapshot.wait_reason, Some(WaitReason::NoAgentAvailable));
    assert_eq!(snapshot.retries, 0);

    let stats = scheduler.stats().unwrap();
    assert_eq!(stats.queued_by_priority[&TaskPriority::Critical], 1);
    assert_eq!(stats.waiting_by_reason[&WaitReason::NoAgentAvailable], 1);
    assert_eq!(stats.running_total, 0);
    admission.abort();
}

#[tokio::test]
async fn attempt_past_its_deadline_counts_as_failure() {
    let body = runner(|_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!({}))
    });
    let scheduler = scheduler(DispatchConfig::default(), body, false);
    let admission = scheduler.spawn();

    let task_id = scheduler
        .submit(
            TaskSpec::new(ExecutionClass::Local, TaskPriority::Normal)
                .max_retries(2)
                .timeout(Duration::from_millis(50)),
        )
        .unwrap();
    let snapshot = scheduler.wait_for_terminal(task_id, WAIT).await.unwrap();
    admission.abort();

    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.retries, 2);
    assert!(snapshot.error.unwrap().contains("timed out"));
    assert_eq!(scheduler.stats().unwrap().running_total, 0);
}

#[tokio::test]
async fn cancel_covers_queued_running_and_terminal_tasks() {
    let body = runner(|_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!({}))
    });
    let scheduler = scheduler(DispatchConfig::default(), body, false);
    let admission = scheduler.spawn();

    let queued = scheduler
        .submit(TaskSpec::new(ExecutionClass::Purple, TaskPriority::Normal))
        .unwrap();
    let running = scheduler
        .submit(TaskSpec::new(ExecutionClass::Local, TaskPriority::Normal))
        .unwrap();

    for _ in 0..100 {
        if scheduler.status(running).unwrap().status == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(scheduler.status(running).unwrap().status, TaskStatus::Running);

    assert!(scheduler.cancel(queued).unwrap());
    assert!(scheduler.cancel(running).unwrap());
    assert!(!scheduler.cancel(running).unwrap());

    let snapshot = scheduler.wait_for_terminal(running, WAIT).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Cancelled);
    assert_eq!(
        scheduler.status(queued).unwrap().status,
        TaskStatus::Cancelled
    );

    let stats = scheduler.stats().unwrap();
    assert_eq!(stats.running_total, 0);
    assert_eq!(stats.terminal_counts.cancelled, 2);
    assert_eq!(stats.queued_by_priority[&TaskPriority::Normal], 0);

    let missing = scheduler.cancel(TaskId(9_999)).unwrap_err();
    assert_eq!(missing.kind, CoreErrorKind::NotFound);
    admission.abort();
}

#[tokio::test]
async fn submission_rejects_disabled_classes_and_zero_overrides() {
    let mut config = DispatchConfig::default();
    config
        .max_concurrent_per_class
        .set(ExecutionClass::Purple, Some(0));
    let scheduler = scheduler(config, runner(|_| async { Ok(json!({})) }), false);

    let disabled = scheduler
        .submit(TaskSpec::new(ExecutionClass::Purple, TaskPriority::Normal))
        .unwrap_err();
    assert_eq!(disabled.kind, CoreErrorKind::InvalidInput);

    let zero_retries = scheduler
        .submit(TaskSpec::new(ExecutionClass::Local, TaskPriority::Normal).max_retries(0))
        .unwrap_err();
    assert_eq!(zero_retries.kind, CoreErrorKind::InvalidInput);

    let zero_timeout = scheduler
        .submit(TaskSpec::new(ExecutionClass::Local, TaskPriority::Normal).timeout(Duration::ZERO))
        .unwrap_err();
    assert_eq!(zero_timeout.kind, CoreErrorKind::InvalidInput);

    let missing = scheduler.status(TaskId(42)).unwrap_err();
    assert_eq!(missing.kind, CoreErrorKind::NotFound);
}

#[tokio::test]
async fn terminal_tasks_are_pruned_after_retention() {
    let config = DispatchConfig {
        terminal_retention_secs: 0,
        ..DispatchConfig::default()
    };
    let scheduler = scheduler(config, runner(|_| async { Ok(json!({})) }), false)
        .with_first_task_id(TaskId(100));

    let task_id = scheduler
        .submit(TaskSpec::new(ExecutionClass::Local, TaskPriority::Normal))
        .unwrap();
    assert_eq!(task_id, TaskId(100));
    assert_eq!(scheduler.tick().unwrap(), 1);
    scheduler.wait_for_terminal(task_id, WAIT).await.unwrap();

    assert_eq!(scheduler.prune_terminal(), 1);
    assert_eq!(
        scheduler.status(task_id).unwrap_err().kind,
        CoreErrorKind::NotFound
    );
    assert_eq!(scheduler.stats().unwrap().terminal_counts.completed, 1);
}

#[tokio::test]
async fn panicking_task_body_is_an_execution_failure() {
    let body = runner(|_| async {
        if true {
            panic!("tool crashed");
        }
        Ok(json!({}))
    });
    let scheduler = scheduler(DispatchConfig::default(), body, false);
    let admission = scheduler.spawn();

    let task_id = scheduler
        .submit(TaskSpec::new(ExecutionClass::Local, TaskPriority::Normal).max_retries(1))
        .unwrap();
    let snapshot = scheduler.wait_for_terminal(task_id, WAIT).await.unwrap();
    admission.abort();

    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert!(snapshot.error.unwrap().contains("panicked"));
}
