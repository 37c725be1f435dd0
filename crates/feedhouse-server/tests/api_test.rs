//! Integration tests for the relay HTTP surface
//!
//! Builds the real router over a temp repository and a file destination, then
//! sends requests via tower::ServiceExt.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use feedhouse_core::{container, AttributeMap, ContainerEntry};
use feedhouse_server::{build_state, create_router, AppState, ProxyConfig};
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::BodyExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tower::ServiceExt;

const MAX_BODY: usize = 16 * 1024 * 1024;

struct TestApp {
    temp: TempDir,
    state: AppState,
}

impl TestApp {
    async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().display().to_string().replace('\\', "/");
        let config = ProxyConfig::from_toml(&format!(
            r#"
            [repository]
            data_dir = "{root}/data"
            temp_dir = "{root}/temp"
            home_dir = "{root}/home"

            [aggregator]
            close_on_pass_end = true

            [[destinations]]
            type = "file"
            name = "local"
            path = "{root}/out"
            "#
        ))
        .unwrap();

        let state = build_state(&config).await.unwrap();
        Self { temp, state }
    }

    fn router(&self) -> Router {
        create_router(self.state.clone(), MAX_BODY)
    }

    fn out_dir(&self) -> PathBuf {
        self.temp.path().join("out")
    }
}

async fn body_bytes(body: Body) -> Vec<u8> {
    body.collect().await.unwrap().to_bytes().to_vec()
}

fn post(uri: &str, headers: &[(&str, &str)], body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(body.into()).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn forwarded(out: &Path, id: u64) -> (String, Vec<ContainerEntry>) {
    let dir = feedhouse_core::dirs::id_path(out, id);
    let meta = std::fs::read_to_string(dir.join("proxy.meta")).unwrap();
    let entries = container::decode(&std::fs::read(dir.join("proxy.zip")).unwrap()).unwrap();
    (meta, entries)
}

// ---------------------------------------------------------------
// Health endpoints
// ---------------------------------------------------------------

#[tokio::test]
async fn test_health_and_liveness() {
    let app = TestApp::new().await;

    for uri in ["/health", "/live"] {
        let resp = app.router().oneshot(get(uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(resp.into_body()).await).unwrap();
        assert_eq!(json["status"], "ok");
    }
}

#[tokio::test]
async fn test_readiness_follows_lifecycle() {
    let app = TestApp::new().await;

    let resp = app.router().oneshot(get("/ready")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    app.state.lifecycle.start().await.unwrap();
    let resp = app.router().oneshot(get("/ready")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    app.state.begin_shutdown();
    let resp = app.router().oneshot(get("/ready")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(resp.into_body()).await).unwrap();
    assert_eq!(json["status"], "shutting_down");

    app.state.lifecycle.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_reports_destinations() {
    let app = TestApp::new().await;

    let resp = app.router().oneshot(get("/status")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(resp.into_body()).await).unwrap();
    assert_eq!(json["state"], "created");
    assert_eq!(json["shutting_down"], false);
    assert_eq!(json["scanner_running"], false);
    assert_eq!(json["destinations"][0]["name"], "local");
    assert_eq!(json["destinations"][0]["circuit"], "closed");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    feedhouse_observability::metrics::init();
    let app = TestApp::new().await;

    let resp = app.router().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

// ---------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------

#[tokio::test]
async fn test_missing_feed_rejected() {
    let app = TestApp::new().await;

    let resp = app
        .router()
        .oneshot(post("/datafeed", &[("Type", "Raw Events")], "payload"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE);
    assert_eq!(resp.headers()["Feed-Status"], "100");
    let body = String::from_utf8(body_bytes(resp.into_body()).await).unwrap();
    assert!(body.contains("Feed must be specified"));
    assert_eq!(app.state.receiver.store().last_id().0, 0);
}

#[tokio::test]
async fn test_unexpected_type_rejected() {
    let app = TestApp::new().await;

    let resp = app
        .router()
        .oneshot(post("/datafeed", &[("Feed", "F"), ("Type", "Spreadsheet")], "x"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE);
    assert_eq!(resp.headers()["Feed-Status"], "120");
}

#[tokio::test]
async fn test_unknown_compression_rejected() {
    let app = TestApp::new().await;

    let resp = app
        .router()
        .oneshot(post("/datafeed", &[("Feed", "F"), ("Compression", "RAR")], "x"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE);
    assert_eq!(resp.headers()["Feed-Status"], "200");
}

#[tokio::test]
async fn test_corrupt_container_rejected() {
    let app = TestApp::new().await;

    let resp = app
        .router()
        .oneshot(post(
            "/datafeed",
            &[("Feed", "F"), ("Compression", "ZIP")],
            "definitely not a zip archive",
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers()["Feed-Status"], "400");
    assert_eq!(app.state.receiver.store().last_id().0, 0);
}

#[tokio::test]
async fn test_accepted_submission_is_forwarded() {
    let app = TestApp::new().await;

    let resp = app
        .router()
        .oneshot(post(
            "/datafeed",
            &[("Feed", "TEST-FEED"), ("Type", "Raw Events"), ("System", "billing")],
            "line one\nline two\n",
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["Feed-Status"], "0");
    let body = String::from_utf8(body_bytes(resp.into_body()).await).unwrap();
    assert!(body.starts_with("ReceiptId: "));

    let report = app.state.lifecycle.trigger_pass().await.unwrap();
    assert_eq!(report.aggregates_forwarded, 1);

    let (meta, entries) = forwarded(&app.out_dir(), 1);
    assert!(meta.contains("Feed:TEST-FEED"));
    assert!(meta.contains("ItemCount:1"));
    assert_eq!(entries.len(), 1);
    assert_eq!(&entries[0].data[..], b"line one\nline two\n");
    assert_eq!(entries[0].attributes.get("System"), Some("billing"));
    assert_eq!(entries[0].attributes.get("ReceivedPath"), Some("/datafeed"));
    assert!(entries[0].attributes.get("ReceiptId").is_some());
}

#[tokio::test]
async fn test_feed_from_path() {
    let app = TestApp::new().await;

    let resp = app
        .router()
        .oneshot(post("/datafeed/PATH-FEED", &[], "x"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    app.state.lifecycle.trigger_pass().await.unwrap();
    let (meta, _) = forwarded(&app.out_dir(), 1);
    assert!(meta.contains("Feed:PATH-FEED"));
}

#[tokio::test]
async fn test_gzip_and_zip_bodies() {
    let app = TestApp::new().await;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(b"compressed payload").unwrap();
    let resp = app
        .router()
        .oneshot(post(
            "/datafeed",
            &[("Feed", "GZ-FEED"), ("Compression", "GZIP")],
            gz.finish().unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let entries: Vec<ContainerEntry> = (0..3)
        .map(|i| ContainerEntry::new(AttributeMap::new(), format!("entry {}", i).into_bytes()))
        .collect();
    let resp = app
        .router()
        .oneshot(post(
            "/datafeed",
            &[("Feed", "ZIP-FEED"), ("Compression", "zip")],
            container::encode(&entries).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let report = app.state.lifecycle.trigger_pass().await.unwrap();
    assert_eq!(report.aggregates_forwarded, 2);
    assert_eq!(report.entries_forwarded, 4);

    let mut outputs: Vec<(String, Vec<ContainerEntry>)> =
        (1..=2).map(|id| forwarded(&app.out_dir(), id)).collect();
    outputs.sort_by_key(|(meta, _)| !meta.contains("Feed:GZ-FEED"));

    assert!(outputs[0].0.contains("Feed:GZ-FEED"));
    assert_eq!(&outputs[0].1[0].data[..], b"compressed payload");
    assert!(outputs[1].0.contains("Feed:ZIP-FEED"));
    assert_eq!(outputs[1].1.len(), 3);
}

#[tokio::test]
async fn test_refused_while_shutting_down() {
    let app = TestApp::new().await;
    app.state.begin_shutdown();

    let resp = app
        .router()
        .oneshot(post("/datafeed", &[("Feed", "F")], "x"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(app.state.receiver.store().last_id().0, 0);
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let app = TestApp::new().await;
    let router = create_router(app.state.clone(), 16);

    let resp = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/datafeed")
                .header("Feed", "F")
                .header("content-length", "64")
                .body(Body::from(vec![b'x'; 64]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(app.state.receiver.store().last_id().0, 0);
}
