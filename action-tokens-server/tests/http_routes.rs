//! HTTP-level tests for the `/_tokens` controller, driven through the router
//! with an in-memory store.

use std::sync::Arc;

use action_tokens_core::{
    BroadcastEventSink, EventSink, MemoryStore, TokenConfig, TokenOrchestrator,
};
use action_tokens_server::handlers::RequestContext;
use action_tokens_server::router::build_router;
use action_tokens_server::AppState;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

// ── Test app builder ───────────────────────────────────────────

fn build_test_app(config: TokenConfig) -> (Router, Arc<BroadcastEventSink>) {
    let events = Arc::new(BroadcastEventSink::new(64));
    let orchestrator = Arc::new(TokenOrchestrator::new(
        Arc::new(MemoryStore::new()),
        Arc::clone(&events) as Arc<dyn EventSink>,
        config,
    ));
    (build_router(AppState::new(orchestrator)), events)
}

fn app() -> Router {
    build_test_app(TokenConfig::default()).0
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> axum::response::Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or_else(
        |_| json!({ "raw": String::from_utf8_lossy(&bytes).to_string() }),
    )
}

async fn create(app: &Router, token: Value) -> String {
    let resp = send(app, "POST", "/_tokens", Some(json!({ "token": token }))).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    body_json(resp).await["token"].as_str().unwrap().to_string()
}

// ── Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_generates_id() {
    let app = app();
    let resp = send(
        &app,
        "POST",
        "/_tokens",
        Some(json!({ "token": {}, "payload": { "email": "a@example.com" } })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp).await;
    assert_eq!(body["token"].as_str().unwrap().len(), 32);
}

#[tokio::test]
async fn test_create_rejects_invalid_token() {
    let app = app();
    let resp = send(
        &app,
        "POST",
        "/_tokens",
        Some(json!({ "token": { "id": "no spaces allowed" } })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert!(body["error"].as_str().unwrap().starts_with("validation failed"));
}

#[tokio::test]
async fn test_create_with_taken_id_is_400() {
    let app = app();
    create(&app, json!({ "id": "dup" })).await;

    let resp = send(&app, "POST", "/_tokens", Some(json!({ "token": { "id": "dup" } }))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(resp).await["error"]
        .as_str()
        .unwrap()
        .contains("already in use"));
}

#[tokio::test]
async fn test_get_simple_token_executes_once() {
    let app = app();
    let id = create(&app, json!({ "id": "s1" })).await;

    let resp = send(&app, "GET", &format!("/_tokens/{id}"), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        body_json(resp).await,
        json!({ "status": "executed", "token": "s1" })
    );

    let resp = send(&app, "GET", &format!("/_tokens/{id}"), None).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(body_json(resp).await["error"]
        .as_str()
        .unwrap()
        .contains("already been executed"));
}

#[tokio::test]
async fn test_get_viewable_token_until_limit() {
    let app = app();
    create(&app, json!({ "id": "v1", "kind": "viewable", "view_limit": 2 })).await;

    let resp = send(&app, "GET", "/_tokens/v1", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        body_json(resp).await,
        json!({ "status": "viewed", "token": "v1" })
    );

    let resp = send(&app, "GET", "/_tokens/v1", None).await;
    assert_eq!(resp.status(), StatusCode::GONE);
}

#[tokio::test]
async fn test_unknown_token_is_404() {
    let app = app();
    for (method, uri) in [
        ("GET", "/_tokens/missing"),
        ("POST", "/_tokens/missing"),
        ("GET", "/_tokens/missing/execute"),
        ("POST", "/_tokens/missing/execute"),
        ("DELETE", "/_tokens/missing"),
    ] {
        let resp = send(&app, method, uri, None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{method} {uri}");
    }

    let resp = send(&app, "PATCH", "/_tokens/missing", Some(json!({}))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_composite_execute_points_at_next_member() {
    let app = app();
    create(
        &app,
        json!({ "id": "flow", "kind": "composite", "tokens": ["a", "b"] }),
    )
    .await;
    create(&app, json!({ "id": "a", "from_composite": "flow" })).await;
    create(&app, json!({ "id": "b", "from_composite": "flow" })).await;

    let resp = send(&app, "POST", "/_tokens/flow/execute", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        body_json(resp).await,
        json!({ "status": "next", "nextId": "a", "token": "flow" })
    );

    let resp = send(&app, "POST", "/_tokens/a", None).await;
    assert_eq!(
        body_json(resp).await,
        json!({ "status": "next", "nextId": "b", "token": "a" })
    );

    let resp = send(&app, "GET", "/_tokens/b/execute", None).await;
    assert_eq!(
        body_json(resp).await,
        json!({ "status": "executed", "token": "b" })
    );
}

#[tokio::test]
async fn test_patch_updates_and_validates() {
    let app = app();
    create(&app, json!({ "id": "t1" })).await;

    let resp = send(
        &app,
        "PATCH",
        "/_tokens/t1",
        Some(json!({ "payload": { "step": 2 } })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({ "token": "t1" }));

    let resp = send(
        &app,
        "PATCH",
        "/_tokens/t1",
        Some(json!({ "view_limit": "lots" })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_then_gone() {
    let app = app();
    create(&app, json!({ "id": "t1" })).await;

    let resp = send(&app, "DELETE", "/_tokens/t1", None).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = send(&app, "DELETE", "/_tokens/t1", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disabled_controller_answers_404() {
    let (app, _events) = build_test_app(TokenConfig {
        controller_enabled: false,
        ..TokenConfig::default()
    });

    let resp = send(&app, "POST", "/_tokens", Some(json!({ "token": {} }))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_execute_passes_request_as_event_context() {
    let (app, events) = build_test_app(TokenConfig::default());
    let mut rx = events.subscribe();
    create(&app, json!({ "id": "t1", "type": "email-confirm" })).await;

    let request = Request::builder()
        .method("POST")
        .uri("/_tokens/t1/execute")
        .header("x-request-id", "req-7")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let created = rx.recv().await.unwrap();
    assert_eq!(created.name, "create.email_confirm");
    assert!(created.context.is_none());

    let executed = rx.recv().await.unwrap();
    assert_eq!(executed.name, "execute.email_confirm");
    let context = executed.context.unwrap();
    let request = context.downcast_ref::<RequestContext>().unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.uri.path(), "/_tokens/t1/execute");
    assert_eq!(request.headers["x-request-id"], "req-7");
}
