//! API endpoint integration tests

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use capture_sync::api::{ApiState, router};
use tower::ServiceExt;

mod common;
use common::{Harness, gsr_node};

fn build_test_router(harness: &Harness) -> Router {
    router(Arc::new(ApiState {
        coordinator: harness.coordinator.clone(),
    }))
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, json: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = Harness::new().await;
    let app = build_test_router(&harness);

    let (status, json) = call(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_status_without_nodes() {
    let harness = Harness::new().await;
    let app = build_test_router(&harness);

    let (status, json) = call(&app, get("/api/status")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["nodes"], 0);
    assert_eq!(json["synchronizedNodes"], 0);
    assert!(json.get("session").is_none());
}

#[tokio::test]
async fn test_nodes_list_and_lookup() {
    let harness = Harness::new().await;
    let (_client, _) = harness.client(gsr_node("node-a", 0.0)).await;
    let app = build_test_router(&harness);

    let (status, json) = call(&app, get("/api/nodes")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().map(Vec::len), Some(1));
    assert_eq!(json[0]["nodeId"], "node-a");
    assert_eq!(json[0]["state"], "ACTIVE");

    let (status, json) = call(&app, get("/api/nodes/node-a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["capabilities"][0], "GSR");

    let (status, json) = call(&app, get("/api/nodes/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_node_command() {
    let harness = Harness::new().await;
    let (_client, _) = harness.client(gsr_node("node-a", 0.0)).await;
    let app = build_test_router(&harness);

    let (status, json) = call(
        &app,
        post("/api/nodes/node-a/command", &serde_json::json!({ "command": "GET_STATUS" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "acked");
    assert_eq!(json["report"]["recording"], false);

    let (status, _) = call(
        &app,
        post("/api/nodes/node-a/command", &serde_json::json!({ "command": "START" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        post("/api/nodes/nobody/command", &serde_json::json!({ "command": "GET_STATUS" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_session_lifecycle() {
    let harness = Harness::new().await;
    let (_client, _) = harness.client(gsr_node("node-a", 0.0)).await;
    let app = build_test_router(&harness);

    let (status, json) = call(
        &app,
        post("/api/session/start", &serde_json::json!({ "sessionId": "api-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["session"]["sessionId"], "api-1");
    assert_eq!(json["session"]["status"], "ALL_CONFIRMED");

    let (status, _) = call(
        &app,
        post("/api/session/start", &serde_json::json!({ "sessionId": "api-2" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, json) = call(&app, get("/api/session")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], "api-1");
    assert_eq!(json["phase"], "RECORDING");

    let (status, json) = call(
        &app,
        post("/api/session/markers", &serde_json::json!({ "description": "clap" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["kind"], "manual");
    assert!(json["observations"]["node-a"].is_object());

    let (status, json) = call(&app, post("/api/session/stop", &serde_json::json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["session"]["phase"], "CLOSED");
    assert_eq!(json["session"]["markers"], 1);

    let (status, json) = call(&app, get("/api/session")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json.is_null());

    let (status, json) = call(&app, get("/api/session/archive")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["id"], "api-1");

    let (status, _) = call(&app, get("/api/session/api-1")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_marker_requires_session() {
    let harness = Harness::new().await;
    let app = build_test_router(&harness);

    let (status, json) = call(
        &app,
        post("/api/session/markers", &serde_json::json!({ "kind": "calibration" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_stop_unknown_session_is_no_op() {
    let harness = Harness::new().await;
    let app = build_test_router(&harness);

    let (status, json) = call(
        &app,
        post("/api/session/stop", &serde_json::json!({ "sessionId": "ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["report"].is_null());
    assert_eq!(json["session"]["confirmed"], 0);

    let (status, _) = call(&app, get("/api/session/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_telemetry_streams() {
    let harness = Harness::new().await;
    let app = build_test_router(&harness);

    let (status, json) = call(&app, get("/api/telemetry/streams")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().map(Vec::len), Some(0));

    let _rx = harness.coordinator.hub().subscribe("GSR_node-a").await.unwrap();
    let (status, json) = call(&app, get("/api/telemetry/streams/GSR_node-a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["subscribers"], 1);

    let (status, _) = call(&app, get("/api/telemetry/streams/GSR_nobody")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
