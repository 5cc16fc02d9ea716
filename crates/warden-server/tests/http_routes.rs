use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use warden_core::models::{
    ExecutionClass, TaskCommand, TaskId, TaskPriority, TaskSnapshot, TaskSpec, TaskStatus,
};
use warden_core::orchestration::{LocalRunner, TaskFuture};
use warden_core::persistence::TaskStore;
use warden_server::{AppState, ServerConfig, router};

fn idle_runner() -> Arc<dyn LocalRunner> {
    Arc::new(|_: TaskCommand| -> TaskFuture { Box::pin(async { Ok(json!({})) }) })
}

fn app_with(config: ServerConfig) -> (Router, AppState) {
    let state = AppState::build_with_runner(&config, idle_runner()).unwrap();
    (router(state.clone()), state)
}

fn app() -> Router {
    app_with(ServerConfig::default()).0
}

fn json_request(method: Method, uri: &str, body: Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn temp_database(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "warden-server-{name}-{}-{nanos}.sqlite3",
        std::process::id()
    ))
}

#[tokio::test]
async fn submit_then_read_back_a_task() {
    let app = app();
    let (status, created) = send(
        &app,
        json_request(
            Method::POST,
            "/tasks",
            json!({
                "execution_class": "blue",
                "priority": "high",
                "payload": { "rule": "lateral-movement" },
                "case_id": "case-41",
            }),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], json!("queued"));
    assert_eq!(created["priority"], json!("high"));
    assert_eq!(created["execution_class"], json!("blue"));

    let id = created["id"].as_u64().unwrap();
    let (status, fetched) = send(&app, get(&format!("/tasks/{id}"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["case_id"], json!("case-41"));
    assert!(fetched["created_at"].as_str().is_some());
}

#[tokio::test]
async fn unknown_class_or_priority_is_a_bad_request() {
    let app = app();
    let (status, body) = send(
        &app,
        json_request(Method::POST, "/tasks", json!({ "execution_class": "green" }), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("invalid_input"));

    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/tasks",
            json!({ "execution_class": "red", "priority": "urgent" }),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/tasks",
            json!({ "execution_class": "red", "max_retries": 0 }),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn collaborator_routes_require_the_configured_token() {
    let (app, _) = app_with(ServerConfig {
        collaborator_token: Some("collab-secret".to_string()),
        ..ServerConfig::default()
    });
    let body = json!({ "execution_class": "local" });

    let (status, rejected) =
        send(&app, json_request(Method::POST, "/tasks", body.clone(), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(rejected["error"], json!("unauthorized"));

    let (status, _) = send(
        &app,
        json_request(Method::POST, "/tasks", body.clone(), Some("wrong")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        json_request(Method::POST, "/tasks", body, Some("collab-secret")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(&app, get("/agents", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn enrollment_script_and_single_use_bundle() {
    let (app, _) = app_with(ServerConfig {
        public_url: "https://warden.example.test/".to_string(),
        ..ServerConfig::default()
    });

    let (status, enrollment) = send(
        &app,
        json_request(
            Method::POST,
            "/agents/enroll",
            json!({ "execution_class": "purple", "label": "lab-host" }),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = enrollment["download_token"].as_str().unwrap().to_string();
    let script = enrollment["script"].as_str().unwrap();
    assert!(script.starts_with("#!/bin/sh"));
    assert!(script.contains("WARDEN_URL='https://warden.example.test'"));
    assert!(script.contains(&token));
    assert_eq!(enrollment["execution_class"], json!("purple"));

    let (status, bundle) = send(
        &app,
        json_request(
            Method::POST,
            "/agents/bundle",
            json!({ "download_token": token }),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        bundle["channel_url"],
        json!("wss://warden.example.test/agents/channel")
    );
    assert!(bundle["session_token"].as_str().is_some());

    let (status, reused) = send(
        &app,
        json_request(
            Method::POST,
            "/agents/bundle",
            json!({ "download_token": token }),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(reused["error"], json!("unauthorized"));
}

#[tokio::test]
async fn local_class_enrollment_is_rejected() {
    let (status, body) = send(
        &app(),
        json_request(
            Method::POST,
            "/agents/enroll",
            json!({ "execution_class": "local" }),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("invalid_input"));
}

#[tokio::test]
async fn session_listing_and_unknown_session_actions() {
    let app = app();
    let (status, sessions) = send(&app, get("/agents", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sessions, json!([]));

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/agents/sess-missing/drain", Value::Null, None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("not_found"));
}

#[tokio::test]
async fn draining_a_session_mid_handshake_is_a_conflict() {
    let (app, state) = app_with(ServerConfig::default());
    let grant = state
        .registry
        .issue_download_token(ExecutionClass::Blue, None)
        .unwrap();
    let bundle = state.registry.enroll(&grant.download_token).await.unwrap();
    let handle = state.registry.connect(&bundle.session_token).unwrap();

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            &format!("/agents/{}/drain", handle.session_id),
            Value::Null,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], json!("conflict"));
}

#[tokio::test]
async fn channel_requires_a_bearer_before_upgrading() {
    let (status, body) = send(&app(), get("/agents/channel", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("unauthorized"));
}

#[tokio::test]
async fn unknown_task_is_not_found_and_stats_are_served() {
    let app = app();
    let (status, body) = send(&app, get("/tasks/999", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("not_found"));

    let (status, _) = send(
        &app,
        json_request(Method::POST, "/tasks/999/cancel", Value::Null, None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, stats) = send(&app, get("/tasks/stats", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["running_total"], json!(0));
    assert_eq!(stats["terminal_counts"]["completed"], json!(0));
}

#[tokio::test]
async fn cancel_reports_whether_anything_changed() {
    let app = app();
    let (_, created) = send(
        &app,
        json_request(Method::POST, "/tasks", json!({ "execution_class": "red" }), None),
    )
    .await;
    let id = created["id"].as_u64().unwrap();

    let (status, first) = send(
        &app,
        json_request(Method::POST, &format!("/tasks/{id}/cancel"), Value::Null, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, json!({ "task_id": id, "cancelled": true }));

    let (_, second) = send(
        &app,
        json_request(Method::POST, &format!("/tasks/{id}/cancel"), Value::Null, None),
    )
    .await;
    assert_eq!(second["cancelled"], json!(false));
}

#[tokio::test]
async fn pruned_task_is_served_from_the_store() {
    let path = temp_database("fallback");
    let (app, state) = app_with(ServerConfig {
        database_path: Some(path.clone()),
        ..ServerConfig::default()
    });
    let store = state.task_store.clone().unwrap();
    store
        .upsert_task(&TaskSnapshot {
            id: TaskId(77),
            execution_class: ExecutionClass::Red,
            priority: TaskPriority::Critical,
            status: TaskStatus::Failed,
            wait_reason: None,
            assigned_to: None,
            retries: 3,
            max_retries: 3,
            case_id: None,
            investigation_id: Some("inv-3".to_string()),
            created_at: UNIX_EPOCH,
            started_at: None,
            completed_at: None,
            result: None,
            error: Some("agent session closed: heartbeat timeout".to_string()),
        })
        .unwrap();

    let (status, body) = send(&app, get("/tasks/77", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("failed"));
    assert_eq!(body["investigation_id"], json!("inv-3"));

    let restarted = AppState::build_with_runner(
        &ServerConfig {
            database_path: Some(path.clone()),
            ..ServerConfig::default()
        },
        idle_runner(),
    )
    .unwrap();
    let next = restarted
        .scheduler
        .submit(TaskSpec::new(ExecutionClass::Local, TaskPriority::Low))
        .unwrap();
    assert_eq!(next, TaskId(78));
    let _ = std::fs::remove_file(path);
}
