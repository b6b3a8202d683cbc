//! Orchestrator API Integration Tests
//!
//! Tests full HTTP request/response cycles for task, workflow and session endpoints

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use orchestrator::api;
use orchestrator::config::Config;
use orchestrator::AppState;

fn test_config(root: &std::path::Path) -> Config {
    Config {
        workdir: root.join("workdir"),
        task_timeout: Duration::from_secs(5),
        max_memory_mb: 64,
        allow_network: false,
        allow_file_io: false,
        session_sweep_interval: Duration::ZERO,
        ..Config::default()
    }
}

async fn setup_with(config: impl FnOnce(&mut Config)) -> (axum::Router, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let mut cfg = test_config(temp_dir.path());
    config(&mut cfg);

    let state = AppState::new(cfg).await.expect("Failed to start orchestrator");
    (api::router(state), temp_dir)
}

async fn setup_test_app() -> (axum::Router, tempfile::TempDir) {
    setup_with(|_| {}).await
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.expect("Request failed");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let value: Value = serde_json::from_slice(&body).expect("Invalid JSON response");
    (status, value)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn task(chat_key: &str, instruction: &str) -> Value {
    json!({
        "chat_key": chat_key,
        "user_id": "alice",
        "instruction": instruction,
    })
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health() {
    let (app, _temp_dir) = setup_test_app().await;

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let (status, body) = json_response(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

// ============================================================================
// Task Execution Tests
// ============================================================================

#[tokio::test]
async fn test_execute_task_success() {
    let (app, _temp_dir) = setup_test_app().await;

    let mut body = task("group_1", "```rhai\nlet y = x * 2;\nprint(y);\n```");
    body["context"] = json!("{\"variables\": {\"x\": 21}}");
    let (status, body) = json_response(&app, post("/tasks/execute", body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["output"], "42\n");
    assert_eq!(body["variables"]["y"], 42);
    assert!(body["error"].is_null());
    assert_eq!(body["task_id"].as_str().unwrap().len(), 26);
    assert!(body["execution_time"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn test_variables_persist_between_tasks() {
    let (app, _temp_dir) = setup_test_app().await;

    let (_, first) = json_response(&app, post("/tasks/execute", task("g", "let count = 1;"))).await;
    assert_eq!(first["success"], true);

    let (_, second) =
        json_response(&app, post("/tasks/execute", task("g", "count += 1;"))).await;
    assert_eq!(second["success"], true);
    assert_eq!(second["variables"]["count"], 2);

    // Another chat has its own namespace.
    let (_, other) = json_response(
        &app,
        post("/tasks/execute", task("h", "let seen = is_def_var(\"count\");")),
    )
    .await;
    assert_eq!(other["variables"]["seen"], false);
}

#[tokio::test]
async fn test_artifacts_are_relative_to_session_dir() {
    let (app, _temp_dir) = setup_test_app().await;

    let (status, body) = json_response(
        &app,
        post(
            "/tasks/execute",
            task("g", "write_file(\"reports/summary.md\", \"# done\");"),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["artifacts"][0]["path"], "reports/summary.md");
    assert_eq!(body["artifacts"][0]["size_bytes"], 6);
    assert_eq!(body["artifacts"][0]["kind"], "text");
}

#[tokio::test]
async fn test_invalid_requests_are_400() {
    let (app, _temp_dir) = setup_test_app().await;

    let (status, body) = json_response(&app, post("/tasks/execute", task("g", "   "))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    let mut loosened = task("g", "print(1);");
    loosened["limits"] = json!({"timeout_secs": 3600.0});
    let (status, body) = json_response(&app, post("/tasks/execute", loosened)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_LIMITS");

    let mut huge = task("g", "print(1);");
    huge["limits"] = json!({"timeout_secs": 1e30});
    let (status, body) = json_response(&app, post("/tasks/execute", huge)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_LIMITS");

    let req = Request::builder()
        .method("POST")
        .uri("/tasks/execute")
        .header("content-type", "application/json")
        .body(Body::from("{\"chat_key\": "))
        .unwrap();
    let (status, body) = json_response(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_execution_failures_are_200_with_code_and_hint() {
    let (app, _temp_dir) = setup_with(|cfg| cfg.task_timeout = Duration::from_millis(300)).await;

    let (status, body) =
        json_response(&app, post("/tasks/execute", task("g", "sleep(5);"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "TIMEOUT");
    assert!(body["error"]["hint"].as_str().unwrap().contains("TASK_TIMEOUT"));

    let (status, body) = json_response(
        &app,
        post("/tasks/execute", task("g", "let a = 1;\nthrow \"broken\";")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], "RUNTIME_ERROR");
    assert_eq!(body["error"]["line"], 2);
}

#[tokio::test]
async fn test_task_limit_is_429() {
    let (app, _temp_dir) = setup_with(|cfg| cfg.max_tasks_per_session = 1).await;

    let (status, _) = json_response(&app, post("/tasks/execute", task("g", "let a = 1;"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        json_response(&app, post("/tasks/execute", task("g", "let b = 2;"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "TASK_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn test_session_limit_is_503() {
    let (app, _temp_dir) = setup_with(|cfg| {
        cfg.max_sessions = 1;
        cfg.session_eviction_grace = Duration::from_secs(60);
    })
    .await;

    let (status, _) = json_response(&app, post("/tasks/execute", task("first", "let a = 1;"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        json_response(&app, post("/tasks/execute", task("second", "let a = 1;"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "SESSION_LIMIT_EXCEEDED");
}

// ============================================================================
// Workflow Tests
// ============================================================================

#[tokio::test]
async fn test_execute_workflow() {
    let (app, _temp_dir) = setup_test_app().await;

    let body = json!({
        "chat_key": "g",
        "user_id": "alice",
        "instructions": "[\"let x = 10;\", \"let y = x * 3; print(y);\"]",
    });
    let (status, body) = json_response(&app, post("/workflows/execute", body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["steps"].as_array().unwrap().len(), 2);
    assert_eq!(body["final_output"], "30\n");
    assert_eq!(body["variables"]["y"], 30);
}

#[tokio::test]
async fn test_workflow_failure_names_the_step() {
    let (app, _temp_dir) = setup_test_app().await;

    let body = json!({
        "chat_key": "g",
        "user_id": "alice",
        "instructions": ["let x = 1;", "throw \"nope\";", "let z = 3;"],
    });
    let (status, body) = json_response(&app, post("/workflows/execute", body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["failed_step"], 2);
    assert!(body["error"]["message"].as_str().unwrap().starts_with("Step 2 failed"));
    assert_eq!(body["steps"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_workflow_over_task_limit_is_429() {
    let (app, _temp_dir) = setup_with(|cfg| cfg.max_tasks_per_session = 1).await;

    let (status, _) = json_response(&app, post("/tasks/execute", task("g", "let a = 1;"))).await;
    assert_eq!(status, StatusCode::OK);

    let body = json!({
        "chat_key": "g",
        "user_id": "alice",
        "instructions": ["let b = 2;", "let c = 3;"],
    });
    let (status, body) = json_response(&app, post("/workflows/execute", body)).await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["success"], false);
    assert_eq!(body["steps"].as_array().unwrap().len(), 1);
    assert_eq!(body["steps"][0]["error"]["code"], "TASK_LIMIT_EXCEEDED");
    assert_eq!(body["error"]["code"], "TASK_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn test_workflow_without_instructions_is_400() {
    let (app, _temp_dir) = setup_test_app().await;

    let body = json!({"chat_key": "g", "user_id": "alice", "instructions": []});
    let (status, body) = json_response(&app, post("/workflows/execute", body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

// ============================================================================
// Session Tests
// ============================================================================

#[tokio::test]
async fn test_session_stats() {
    let (app, _temp_dir) = setup_test_app().await;

    json_response(&app, post("/tasks/execute", task("g", "let a = 1; let b = 2;"))).await;
    json_response(&app, post("/tasks/execute", task("g", "throw \"x\";"))).await;

    let req = Request::builder()
        .method("GET")
        .uri("/sessions/stats")
        .body(Body::empty())
        .unwrap();
    let (status, body) = json_response(&app, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_sessions"], 1);
    assert_eq!(body["max_sessions"], 100);
    assert_eq!(body["total_tasks"], 2);
    let session = &body["per_session"][0];
    assert_eq!(session["key"], "g/alice");
    assert_eq!(session["task_count"], 2);
    assert_eq!(session["failed_tasks"], 1);
    assert_eq!(session["variable_count"], 2);
}

#[tokio::test]
async fn test_restart_session_clears_variables() {
    let (app, _temp_dir) = setup_test_app().await;
    json_response(&app, post("/tasks/execute", task("g", "let kept = 1;"))).await;

    let session = json!({"chat_key": "g", "user_id": "alice"});
    let (status, body) = json_response(&app, post("/sessions/restart", session.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = json_response(
        &app,
        post("/tasks/execute", task("g", "let seen = is_def_var(\"kept\");")),
    )
    .await;
    assert_eq!(body["variables"]["seen"], false);

    let unknown = json!({"chat_key": "nobody", "user_id": "alice"});
    let (status, body) = json_response(&app, post("/sessions/restart", unknown)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_cleanup_session_deletes_directory() {
    let (app, temp_dir) = setup_test_app().await;
    json_response(
        &app,
        post("/tasks/execute", task("g", "write_file(\"a.txt\", \"1\");")),
    )
    .await;

    let workdir = temp_dir.path().join("workdir");
    let session_dirs: Vec<_> = std::fs::read_dir(&workdir).unwrap().collect();
    assert_eq!(session_dirs.len(), 1);

    let session = json!({"chat_key": "g", "user_id": "alice"});
    let (status, body) = json_response(&app, post("/sessions/cleanup", session)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(std::fs::read_dir(&workdir).unwrap().count(), 0);

    let req = Request::builder()
        .method("GET")
        .uri("/sessions/stats")
        .body(Body::empty())
        .unwrap();
    let (_, stats) = json_response(&app, req).await;
    assert_eq!(stats["active_sessions"], 0);
}
