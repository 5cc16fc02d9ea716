#![cfg(unix)]

use std::time::Duration;

use serde_json::{Value, json};
use warden_core::execution::{
    CommandSpec, ProcessRunner, ProcessSpawnRequest, TokioProcessExecutor, spawn_validated,
};
use warden_core::models::{CoreErrorKind, ExecutionClass, TaskCommand, TaskId, TaskPayload};
use warden_core::orchestration::LocalRunner;

fn command(payload: Value) -> TaskCommand {
    let payload: TaskPayload = match payload {
        Value::Object(map) => map,
        _ => TaskPayload::new(),
    };
    TaskCommand {
        task_id: TaskId(11),
        execution_class: ExecutionClass::Local,
        attempt: 1,
        payload,
        case_id: None,
        investigation_id: None,
    }
}

#[tokio::test]
async fn successful_process_reports_its_output() {
    let runner = ProcessRunner::default();
    let result = runner
        .run(command(json!({
            "program": "/bin/sh",
            "args": ["-c", "printf \"$GREETING\""],
            "env": { "GREETING": "collected" },
        })))
        .await
        .unwrap();

    assert_eq!(result["exit_code"], json!(0));
    assert_eq!(result["stdout"], json!("collected"));
}

#[tokio::test]
async fn non_zero_exit_is_an_execution_failure() {
    let runner = ProcessRunner::default();
    let error = runner
        .run(command(json!({
            "program": "/bin/sh",
            "args": ["-c", "echo missing artifact >&2; exit 3"],
        })))
        .await
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::ExecutionFailure);
    assert_eq!(error.task, Some(TaskId(11)));
    assert!(error.message.contains("status 3"));
    assert!(error.message.contains("missing artifact"));
}

#[tokio::test]
async fn malformed_payload_is_rejected_before_spawning() {
    let runner = ProcessRunner::default();

    let missing_program = runner.run(command(json!({ "args": ["x"] }))).await.unwrap_err();
    assert_eq!(missing_program.kind, CoreErrorKind::InvalidInput);

    let bad_args = runner
        .run(command(json!({ "program": "/bin/true", "args": "-v" })))
        .await
        .unwrap_err();
    assert_eq!(bad_args.kind, CoreErrorKind::InvalidInput);
}

#[tokio::test]
async fn missing_binary_is_a_process_failure() {
    let runner = ProcessRunner::default();
    let error = runner
        .run(command(json!({ "program": "/nonexistent/warden-tool" })))
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ProcessFailure);
}

#[tokio::test]
async fn spawn_request_deadline_kills_the_process() {
    let request = ProcessSpawnRequest::new(
        CommandSpec::new("/bin/sh").args(["-c", "sleep 5"]),
    )
    .task_id(TaskId(12))
    .timeout(Duration::from_millis(100));

    let process = spawn_validated(&TokioProcessExecutor, request).unwrap();
    assert!(process.pid().is_some());
    let error = process.wait().await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Timeout);
    assert_eq!(error.task, Some(TaskId(12)));
}

#[test]
fn zero_deadline_is_invalid() {
    let request = ProcessSpawnRequest::new(CommandSpec::new("/bin/true")).timeout(Duration::ZERO);
    assert_eq!(
        request.validate().unwrap_err().kind,
        CoreErrorKind::InvalidInput
    );
}

#[tokio::test]
async fn abandoning_the_wait_kills_the_process_group() {
    let marker = std::env::temp_dir().join(format!(
        "warden-abandoned-{}",
        uuid::Uuid::new_v4().simple()
    ));
    let request = ProcessSpawnRequest::new(
        CommandSpec::new("/bin/sh")
            .args(["-c", "sleep 0.4; touch \"$MARKER\""])
            .env("MARKER", marker.display().to_string()),
    );

    let process = spawn_validated(&TokioProcessExecutor, request).unwrap();
    let abandoned = tokio::time::timeout(Duration::from_millis(50), process.wait()).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!marker.exists());
}
