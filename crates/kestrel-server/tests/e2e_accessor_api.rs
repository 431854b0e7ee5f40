//! E2E tests for the HTTP accessor over an in-memory runtime
//!
//! Run with: `cargo test -p kestrel-server --test e2e_accessor_api`

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeDelta, Utc};
use kestrel_server::app;
use kestrel_server::config::Config;
use kestrel_server::runtime::Runtime;
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct TestServer {
    _dir: TempDir,
    config: Config,
    runtime: Runtime,
}

impl TestServer {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config {
            default_namespace: Some("shop".to_string()),
            ..Default::default()
        };
        config.historical.path = dir.path().to_path_buf();
        let runtime = Runtime::build(&config).await.unwrap();
        Self {
            _dir: dir,
            config,
            runtime,
        }
    }

    fn router(&self) -> Router {
        app(self.runtime.app_state(&self.config), "/api")
    }

    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn bind(&self, fd: Value) {
        let (status, body) = self.send("POST", "/api/admin/features", Some(fd)).await;
        assert_eq!(status, StatusCode::CREATED, "bind failed: {body}");
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    let server = TestServer::new().await;

    let (status, body) = server.send("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = server.send("GET", "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["state"]["status"], "healthy");
    assert_eq!(body["checks"]["historian"]["details"]["pending_writes"], 0);
}

#[tokio::test]
async fn test_bind_set_get_roundtrip() {
    let server = TestServer::new().await;
    server
        .bind(json!({ "fqn": "shop.score", "primitive": "int", "staleness": "1h", "freshness": "1m" }))
        .await;

    let (status, body) = server
        .send(
            "POST",
            "/api/features/shop.score/u1",
            Some(json!({ "uuid": "req-1", "value": 42, "op": "set" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["uuid"], "req-1");

    let (status, body) = server.send("GET", "/api/features/shop.score/u1?uuid=req-2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uuid"], "req-2");
    assert_eq!(body["feature_value"]["value"], 42);
    assert_eq!(body["feature_value"]["entity_id"], "u1");
    assert_eq!(body["feature_value"]["fresh"], true);
    assert_eq!(body["metadata"]["primitive"], "int");

    // default namespace
    let (status, body) = server.send("GET", "/api/features/score/u1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["feature_value"]["value"], 42);
    assert_eq!(body["uuid"].as_str().unwrap().len(), 36);
}

#[tokio::test]
async fn test_missing_value_is_null() {
    let server = TestServer::new().await;
    server
        .bind(json!({ "fqn": "shop.score", "primitive": "int", "staleness": "1h" }))
        .await;

    let (status, body) = server.send("GET", "/api/features/shop.score/nobody", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["feature_value"].is_null());
}

#[tokio::test]
async fn test_incr_and_append() {
    let server = TestServer::new().await;
    server
        .bind(json!({ "fqn": "shop.visits", "primitive": "int", "staleness": "1h" }))
        .await;
    server
        .bind(json!({ "fqn": "shop.tags", "primitive": "[]string", "staleness": "1h" }))
        .await;

    for _ in 0..3 {
        let (status, _) = server
            .send("POST", "/api/features/shop.visits/u1", Some(json!({ "value": 2, "op": "incr" })))
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (_, body) = server.send("GET", "/api/features/shop.visits/u1", None).await;
    assert_eq!(body["feature_value"]["value"], 6);

    server
        .send("POST", "/api/features/shop.tags/u1", Some(json!({ "value": ["a"], "op": "append" })))
        .await;
    server
        .send("POST", "/api/features/shop.tags/u1", Some(json!({ "value": "b", "op": "append" })))
        .await;
    let (_, body) = server.send("GET", "/api/features/shop.tags/u1", None).await;
    assert_eq!(body["feature_value"]["value"], json!(["a", "b"]));
}

#[tokio::test]
async fn test_windowed_update_and_projection() {
    let server = TestServer::new().await;
    server
        .bind(json!({
            "fqn": "shop.spend",
            "primitive": "float",
            "aggr": ["sum", "count"],
            "freshness": "1m",
            "staleness": "1h"
        }))
        .await;

    for v in [10.0, 5.5] {
        let (status, body) = server
            .send("POST", "/api/features/shop.spend/u1", Some(json!({ "value": v, "op": "update" })))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    let (_, body) = server.send("GET", "/api/features/shop.spend/u1", None).await;
    assert_eq!(body["feature_value"]["value"]["sum"], 15.5);
    assert_eq!(body["feature_value"]["value"]["count"], 2.0);

    let (status, body) = server.send("GET", "/api/features/shop.spend+avg/u1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["feature_value"]["value"], 7.75);

    let (status, body) = server.send("GET", "/api/features/shop.spend+max/u1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "UNSUPPORTED_AGGREGATOR");
}

#[tokio::test]
async fn test_error_statuses() {
    let server = TestServer::new().await;
    server
        .bind(json!({ "fqn": "shop.score", "primitive": "int", "staleness": "1h" }))
        .await;

    let (status, body) = server.send("GET", "/api/features/shop.unknown/u1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "FEATURE_NOT_FOUND");

    let (status, body) = server
        .send(
            "POST",
            "/api/admin/features",
            Some(json!({ "fqn": "shop.score", "primitive": "int", "staleness": "1h" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "FEATURE_ALREADY_EXISTS");

    let (status, body) = server
        .send("POST", "/api/features/shop.score/u1", Some(json!({ "value": "x", "op": "set" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "TYPE_MISMATCH");

    let stale = Utc::now() - TimeDelta::hours(2);
    let (status, body) = server
        .send(
            "POST",
            "/api/features/shop.score/u1",
            Some(json!({ "value": 1, "op": "set", "timestamp": stale })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "STALE_WRITE");

    let (status, body) = server
        .send("POST", "/api/features/shop.score/u1", Some(json!({ "value": 1, "op": "upsert" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "UNSUPPORTED_OPERATION");

    let (status, body) = server.send("GET", "/api/features/Bad%20Name/u1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_FQN");
}

#[tokio::test]
async fn test_metadata_list_and_unbind() {
    let server = TestServer::new().await;
    server
        .bind(json!({ "fqn": "shop.score", "primitive": "int", "staleness": "1h" }))
        .await;

    let (status, body) = server.send("GET", "/api/features/shop.score?uuid=m1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uuid"], "m1");
    assert_eq!(body["metadata"]["fqn"], "shop.score");
    assert_eq!(body["metadata"]["builder"], "streaming");

    let (_, body) = server.send("GET", "/api/features", None).await;
    assert_eq!(body["features"].as_array().unwrap().len(), 1);

    let (status, _) = server.send("DELETE", "/api/admin/features/shop.score", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!server.runtime.historian.has("shop.score"));

    let (status, _) = server.send("GET", "/api/features/shop.score", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_request_id_header_is_returned() {
    let server = TestServer::new().await;
    let response = server
        .router()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "trace-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-123");
}

#[tokio::test]
async fn test_writes_reach_local_history() {
    let server = TestServer::new().await;
    server
        .bind(json!({ "fqn": "shop.score", "primitive": "int", "staleness": "1h" }))
        .await;

    let TestServer {
        _dir: dir,
        config,
        runtime,
    } = server;
    let router = app(runtime.app_state(&config), "/api");
    let cancel = CancellationToken::new();
    let manager = runtime.manager;
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.start(cancel).await })
    };

    let request = Request::builder()
        .method("POST")
        .uri("/api/features/shop.score/u1")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "value": 7, "op": "set" }).to_string()))
        .unwrap();
    assert_eq!(router.oneshot(request).await.unwrap().status(), StatusCode::OK);

    // the writer flushes once per sync period (4 minutes by default); stopping
    // the runnables runs a final drain cycle
    let day = Utc::now().format("%Y-%m-%d").to_string();
    let alive = dir.path().join("shop.score").join(day).join("alive.jsonl");
    tokio::time::timeout(Duration::from_secs(5), async {
        while runtime.historian.pending_writes() == 0 && !alive.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("collected value never reached the write queue");
    cancel.cancel();
    run.await.unwrap().unwrap();

    let contents = std::fs::read_to_string(&alive).unwrap();
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("\"u1\""));
}
