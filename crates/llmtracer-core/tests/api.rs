//! HTTP API tests against the in-memory store

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

use llmtracer::api::HttpServer;
use llmtracer::config::Config;
use llmtracer::storage::MemoryStore;

const KEY: &str = "project-demo";

const PEER: [u8; 4] = [127, 0, 0, 1];

struct TestApp {
    router: Router,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            router: HttpServer::from_config(store, &config).router(),
        }
    }

    async fn call(&self, method: &str, uri: &str, key: Option<&str>, body: Option<Value>) -> Reply {
        self.call_from(PEER, method, uri, key, body).await
    }

    async fn call_from(
        &self,
        peer: [u8; 4],
        method: &str,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> Reply {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .extension(ConnectInfo(SocketAddr::from((peer, 50_000))));
        if let Some(key) = key {
            request = request.header("x-api-key", key);
        }
        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    async fn post(&self, uri: &str, body: Value) -> Reply {
        self.call("POST", uri, Some(KEY), Some(body)).await
    }

    async fn patch(&self, uri: &str, body: Value) -> Reply {
        self.call("PATCH", uri, Some(KEY), Some(body)).await
    }

    async fn get(&self, uri: &str) -> Reply {
        self.call("GET", uri, Some(KEY), None).await
    }
}

fn error_code(reply: &Reply) -> &str {
    reply.body["error"]["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn trace_with_one_span_end_to_end() {
    let app = TestApp::new();

    let created = app.post("/traces", json!({"trace_id": "t1", "name": "user-query", "tags": ["chat"]})).await;
    assert_eq!(created.status, StatusCode::OK);
    assert_eq!(created.body, json!({"trace_id": "t1", "status": "created"}));

    let span = app
        .post(
            "/traces/t1/spans",
            json!({"span_id": "s1", "name": "answer", "span_type": "llm", "model": "gpt-4o", "input_data": {"prompt": "hi"}}),
        )
        .await;
    assert_eq!(span.status, StatusCode::OK);
    assert_eq!(span.body, json!({"span_id": "s1", "status": "created"}));

    let span_done = app
        .patch(
            "/spans/s1/complete",
            json!({"output_data": {"text": "hello"}, "tokens_input": 10, "tokens_output": 5, "cost_usd": 0.002}),
        )
        .await;
    assert_eq!(span_done.status, StatusCode::OK);
    assert_eq!(span_done.body["status"], "completed");
    assert!(span_done.body["duration_ms"].as_i64().unwrap() >= 0);

    let trace_done = app.patch("/traces/t1/complete", json!({"output": "hello"})).await;
    assert_eq!(trace_done.status, StatusCode::OK);
    assert_eq!(trace_done.body["status"], "completed");
    assert_eq!(trace_done.body["span_count"], 1);
    assert_eq!(trace_done.body["total_tokens"], 15);

    let detail = app.get("/traces/t1").await;
    assert_eq!(detail.status, StatusCode::OK);
    assert_eq!(detail.body["span_count"], 1);
    assert_eq!(detail.body["trace"]["status"], "completed");
    assert_eq!(detail.body["tree"][0]["span_id"], "s1");
    assert_eq!(detail.body["tree"][0]["children"], json!([]));

    let stats = app.get("/stats").await;
    assert_eq!(stats.body["total_traces"], 1);
    assert_eq!(stats.body["total_spans"], 1);
    assert_eq!(stats.body["total_tokens"], 15);
}

#[tokio::test]
async fn completing_twice_is_acknowledged_without_change() {
    let app = TestApp::new();
    app.post("/traces", json!({"trace_id": "t1", "name": "run"})).await;
    app.post("/traces/t1/spans", json!({"span_id": "s1", "name": "step", "span_type": "tool"}))
        .await;

    let first = app.call("PATCH", "/spans/s1/complete", Some(KEY), None).await;
    assert_eq!(first.status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = app.patch("/spans/s1/complete", json!({"error": "late failure"})).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.body["status"], "already_completed");
    assert_eq!(second.body["end_time"], first.body["end_time"]);

    let replay = app.post("/traces", json!({"trace_id": "t1", "name": "run again"})).await;
    assert_eq!(replay.body["status"], "already_exists");
    let detail = app.get("/traces/t1").await;
    assert_eq!(detail.body["trace"]["name"], "run");
    assert_eq!(detail.body["spans"][0]["status"], "completed");
}

#[tokio::test]
async fn nested_spans_form_a_tree() {
    let app = TestApp::new();
    app.post("/traces", json!({"trace_id": "t1", "name": "agent"})).await;
    app.post("/traces/t1/spans", json!({"span_id": "root", "name": "plan", "span_type": "agent"}))
        .await;
    app.post(
        "/traces/t1/spans",
        json!({"span_id": "child", "name": "search", "span_type": "retrieval", "parent_span_id": "root"}),
    )
    .await;

    let bad_parent = app
        .post(
            "/traces/t1/spans",
            json!({"span_id": "x", "name": "x", "span_type": "tool", "parent_span_id": "missing"}),
        )
        .await;
    assert_eq!(bad_parent.status, StatusCode::BAD_REQUEST);

    let detail = app.get("/traces/t1").await;
    assert_eq!(detail.body["tree"].as_array().unwrap().len(), 1);
    assert_eq!(detail.body["tree"][0]["children"][0]["span_id"], "child");
}

#[tokio::test]
async fn listing_pages_through_every_trace_once() {
    let app = TestApp::new();
    for i in 0..5 {
        app.post("/traces", json!({"trace_id": format!("t{i}"), "name": "run"})).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let mut seen = Vec::new();
    let mut sizes = Vec::new();
    let mut uri = "/traces?limit=2".to_string();
    loop {
        let page = app.get(&uri).await;
        assert_eq!(page.status, StatusCode::OK);
        let traces = page.body["traces"].as_array().unwrap();
        sizes.push(traces.len());
        seen.extend(traces.iter().map(|t| t["trace_id"].as_str().unwrap().to_string()));
        match page.body["next_cursor"].as_str() {
            Some(cursor) => {
                assert_eq!(page.body["has_more"], true);
                uri = format!("/traces?limit=2&cursor={cursor}");
            }
            None => {
                assert_eq!(page.body["has_more"], false);
                break;
            }
        }
    }

    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(seen, vec!["t4", "t3", "t2", "t1", "t0"]);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 5);

    let bad = app.get("/traces?cursor=not-a-cursor").await;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    let too_many = app.get("/traces?limit=5000").await;
    assert_eq!(error_code(&too_many), "validation_error");
}

#[tokio::test]
async fn projects_are_isolated() {
    let app = TestApp::new();
    app.post("/traces", json!({"trace_id": "t1", "name": "run"})).await;
    app.post("/traces/t1/spans", json!({"span_id": "s1", "name": "s", "span_type": "tool"}))
        .await;

    let other = Some("project-other");
    let read = app.call("GET", "/traces/t1", other, None).await;
    assert_eq!(read.status, StatusCode::NOT_FOUND);

    let complete = app.call("PATCH", "/spans/s1/complete", other, None).await;
    assert_eq!(complete.status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&complete), "forbidden");

    let listing = app.call("GET", "/traces", other, None).await;
    assert_eq!(listing.body["count"], 0);

    let mismatch = app.post("/traces", json!({"name": "run", "project_id": "other"})).await;
    assert_eq!(mismatch.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn errors_share_one_format() {
    let app = TestApp::new();

    let missing = app.get("/traces/nope").await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&missing), "not_found");
    assert!(missing.body["error"]["message"].as_str().unwrap().contains("nope"));

    let bad_type = app.post("/traces", json!({"trace_id": "t1", "name": "run"})).await;
    assert_eq!(bad_type.status, StatusCode::OK);
    let bad_type = app
        .post("/traces/t1/spans", json!({"name": "s", "span_type": "database"}))
        .await;
    assert_eq!(bad_type.status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&bad_type), "validation_error");

    let malformed = app.call("PATCH", "/traces/t1/complete", Some(KEY), None).await;
    assert_eq!(malformed.status, StatusCode::OK);

    let bad_key = app.call("GET", "/stats", Some("demo"), None).await;
    assert_eq!(bad_key.status, StatusCode::BAD_REQUEST);

    let unknown_span = app.patch("/spans/ghost/complete", json!({})).await;
    assert_eq!(error_code(&unknown_span), "not_found");
}

#[tokio::test]
async fn strict_auth_requires_known_keys() {
    let mut config = Config::default();
    config.auth.required = true;
    config.auth.api_keys = vec![KEY.to_string()];
    let app = TestApp::with_config(config);

    let anonymous = app.call("GET", "/stats", None, None).await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&anonymous), "unauthorized");

    let unknown = app.call("GET", "/stats", Some("project-intruder"), None).await;
    assert_eq!(unknown.status, StatusCode::UNAUTHORIZED);

    assert_eq!(app.get("/stats").await.status, StatusCode::OK);
}

#[tokio::test]
async fn anonymous_callers_use_the_default_project() {
    let app = TestApp::new();
    let created = app
        .call("POST", "/traces", None, Some(json!({"trace_id": "pub", "name": "run"})))
        .await;
    assert_eq!(created.status, StatusCode::OK);

    let visible = app.call("GET", "/traces/pub", Some("project-public"), None).await;
    assert_eq!(visible.status, StatusCode::OK);
    assert_eq!(visible.body["trace"]["project_id"], "public");
}

#[tokio::test]
async fn admission_control_rejects_with_retry_after() {
    let mut config = Config::default();
    config.rate_limit.requests_per_window = 3;
    config.rate_limit.window = Duration::from_secs(60);
    config.auth.api_keys = vec![KEY.to_string(), "project-other".to_string()];
    let app = TestApp::with_config(config);

    for _ in 0..3 {
        assert_eq!(app.get("/stats").await.status, StatusCode::OK);
    }
    let rejected = app.get("/stats").await;
    assert_eq!(rejected.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error_code(&rejected), "rate_limited");
    let retry_after: u64 = rejected.headers[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    // other callers and the health probe are unaffected
    assert_eq!(
        app.call("GET", "/stats", Some("project-other"), None).await.status,
        StatusCode::OK
    );
    let health = app.call("GET", "/health", Some(KEY), None).await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.body["status"], "healthy");
    assert_eq!(health.body["storage"], "memory");
}

#[tokio::test]
async fn rotating_unknown_keys_shares_the_peer_window() {
    let mut config = Config::default();
    config.rate_limit.requests_per_window = 2;
    let app = TestApp::with_config(config);

    let mut accepted = 0;
    for i in 0..20 {
        let key = format!("project-rot{i}");
        let reply = app
            .call("POST", "/traces", Some(&key), Some(json!({"name": "run"})))
            .await;
        if reply.status == StatusCode::OK {
            accepted += 1;
        } else {
            assert_eq!(error_code(&reply), "rate_limited");
        }
    }
    assert_eq!(accepted, 2);

    // a different peer still has its own window
    let elsewhere = app
        .call_from([10, 0, 0, 9], "GET", "/stats", Some("project-rot0"), None)
        .await;
    assert_eq!(elsewhere.status, StatusCode::OK);
}

#[tokio::test]
async fn oversized_output_is_stored_truncated() {
    let mut config = Config::default();
    config.ingest.max_record_bytes = 50_000;
    let app = TestApp::with_config(config);

    app.post("/traces", json!({"trace_id": "t1", "name": "run"})).await;
    app.post("/traces/t1/spans", json!({"span_id": "s1", "name": "big", "span_type": "llm"}))
        .await;
    let done = app
        .patch("/spans/s1/complete", json!({"output_data": {"text": "x".repeat(200_000)}}))
        .await;
    assert_eq!(done.status, StatusCode::OK);

    let detail = app.get("/traces/t1").await;
    let span = &detail.body["spans"][0];
    assert_eq!(span["output_data"]["_truncated"], true);
    assert!(serde_json::to_vec(span).unwrap().len() <= 50_000);
}
