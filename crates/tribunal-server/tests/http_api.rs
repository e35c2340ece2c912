use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;
use tribunal_core::config::CoreConfig;
use tribunal_core::context::Role;
use tribunal_core::storage::Db;
use tribunal_server::auth::{Claims, StaticAuthorizer};
use tribunal_server::{router, AppState};

fn test_state() -> AppState {
    let mut authorizer = StaticAuthorizer::new();
    authorizer.insert(
        "admin-token",
        Claims {
            tenant_id: "t1".into(),
            role: Role::Admin,
            user_id: "ops".into(),
        },
    );
    authorizer.insert(
        "viewer-token",
        Claims {
            tenant_id: "t1".into(),
            role: Role::Viewer,
            user_id: "dash".into(),
        },
    );
    authorizer.insert(
        "other-token",
        Claims {
            tenant_id: "t2".into(),
            role: Role::Admin,
            user_id: "rival".into(),
        },
    );

    let db = Db::open_in_memory().unwrap();
    db.init_schema().unwrap();
    // no provider endpoint configured: the echo provider backs the tests
    AppState::build_with_db(&CoreConfig::default(), Arc::new(authorizer), db).unwrap()
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn suite_crud_and_error_mapping() {
    let state = test_state();
    let app = router(state);

    // no credential
    let (status, _) = call(&app, "POST", "/api/v1/evaluation/suites", None, Some(serde_json::json!({"name": "s"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // viewer cannot write
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/evaluation/suites",
        Some("viewer-token"),
        Some(serde_json::json!({"name": "s"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_kind"], "forbidden");

    let (status, suite) = call(
        &app,
        "POST",
        "/api/v1/evaluation/suites",
        Some("admin-token"),
        Some(serde_json::json!({"name": "S1", "evaluator_config": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(suite["suite_id"], 1);
    assert_eq!(suite["version"], 1);

    // duplicate name
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/evaluation/suites",
        Some("admin-token"),
        Some(serde_json::json!({"name": "S1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_kind"], "conflict");

    // validation error
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/evaluation/suites",
        Some("admin-token"),
        Some(serde_json::json!({"name": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error_kind"], "invalid");

    // case under a missing suite
    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/evaluation/suites/99/evals",
        Some("admin-token"),
        Some(serde_json::json!({"evaluator_kinds": ["answer_relevancy"], "user_input": "hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, case) = call(
        &app,
        "POST",
        "/api/v1/evaluation/suites/1/evals",
        Some("admin-token"),
        Some(serde_json::json!({
            "evaluator_kinds": ["answer_relevancy"],
            "user_input": "hi",
            "expected": {"answer_relevancy": {"min_score": 0.0}}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(case["case_id"], 1);
}

#[tokio::test]
async fn execute_poll_and_summary_flow() {
    let state = test_state();
    let app = router(state.clone());

    call(
        &app,
        "POST",
        "/api/v1/evaluation/suites",
        Some("admin-token"),
        Some(serde_json::json!({"name": "S1", "evaluator_config": {}})),
    )
    .await;
    call(
        &app,
        "POST",
        "/api/v1/evaluation/suites/1/evals",
        Some("admin-token"),
        Some(serde_json::json!({
            "evaluator_kinds": ["answer_relevancy"],
            "user_input": "hi",
            "expected": {"answer_relevancy": {"min_score": 0.0}}
        })),
    )
    .await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/evaluation/suites/1/execute",
        Some("admin-token"),
        Some(serde_json::json!({"idempotency_key": "k1"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["execution_id"], 1);
    assert_eq!(body["status"], "pending");

    // same key converges on the same execution
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/evaluation/suites/1/execute",
        Some("admin-token"),
        Some(serde_json::json!({"idempotency_key": "k1"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["execution_id"], 1);

    state.orchestrator.drain().await.unwrap();

    let (status, body) = call(
        &app,
        "GET",
        "/api/v1/evaluation/executions/1/status",
        Some("admin-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["progress_pct"], 100);

    let (status, summary) = call(
        &app,
        "GET",
        "/api/v1/evaluation/executions/1/summary",
        Some("admin-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["evaluators"]["answer_relevancy"]["pass_rate"], 1.0);

    // other tenants cannot see it
    let (status, _) = call(
        &app,
        "GET",
        "/api/v1/evaluation/executions/1/status",
        Some("other-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // cancelling a terminal execution conflicts
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/evaluation/executions/1/cancel",
        Some("admin-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_kind"], "illegal_transition");

    // the suite's execution history is listable
    let (status, list) = call(
        &app,
        "GET",
        "/api/v1/evaluation/suites/1/executions",
        Some("admin-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["status"], "completed");
}

#[tokio::test]
async fn flows_listing_filters_and_paginates() {
    let state = test_state();
    let app = router(state);

    for name in ["alpha-smoke", "beta-smoke", "gamma-full"] {
        call(
            &app,
            "POST",
            "/api/v1/evaluation/suites",
            Some("admin-token"),
            Some(serde_json::json!({"name": name})),
        )
        .await;
    }

    let (status, page) = call(
        &app,
        "GET",
        "/api/flows?name__contains=smoke&sort=name",
        Some("admin-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["items"].as_array().unwrap().len(), 2);

    let (status, first) = call(
        &app,
        "GET",
        "/api/flows?sort=name&limit=2",
        Some("admin-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["items"].as_array().unwrap().len(), 2);
    let cursor = first["next_cursor"].as_str().unwrap().to_string();

    let (status, second) = call(
        &app,
        "GET",
        &format!("/api/flows?sort=name&limit=2&cursor={}", cursor),
        Some("admin-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["items"].as_array().unwrap().len(), 1);
    assert!(second["next_cursor"].is_null());

    // the versioned mount serves the same listing
    let (status, _) = call(&app, "GET", "/api/v1/flows", Some("admin-token"), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn event_stream_for_a_terminal_execution_sends_complete() {
    let state = test_state();
    let app = router(state.clone());

    call(
        &app,
        "POST",
        "/api/v1/evaluation/suites",
        Some("admin-token"),
        Some(serde_json::json!({"name": "S1"})),
    )
    .await;
    call(
        &app,
        "POST",
        "/api/v1/evaluation/suites/1/evals",
        Some("admin-token"),
        Some(serde_json::json!({"evaluator_kinds": ["answer_relevancy"], "user_input": "hi"})),
    )
    .await;
    call(
        &app,
        "POST",
        "/api/v1/evaluation/suites/1/execute",
        Some("admin-token"),
        Some(serde_json::json!({})),
    )
    .await;
    state.orchestrator.drain().await.unwrap();

    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/evaluation/executions/1/events")
        .header(header::AUTHORIZATION, "Bearer admin-token")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("\"kind\":\"complete\""));
    assert!(text.contains("\"sequence\":1"));
}

#[tokio::test]
async fn healthz_is_public_and_reports_connector_metrics() {
    let state = test_state();
    let app = router(state);

    let (status, body) = call(&app, "GET", "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["connector"]["calls"].is_u64());
}
