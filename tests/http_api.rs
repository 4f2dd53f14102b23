//! HTTP surface tests driven through the router without binding a socket.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use duckdb_exporter::{
    api::{create_router, AppState},
    config::ExporterConfig,
    db::DuckDbPool,
    scrape::Exporter,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

const DEFINITIONS: &str = r#"
[[metric]]
context = "answer"
metricsdesc = { value = "The answer." }
request = "SELECT 42 AS value"
"#;

struct Harness {
    _dir: TempDir,
    custom: std::path::PathBuf,
    state: AppState,
    fatal_rx: mpsc::Receiver<String>,
}

fn harness(scrape_interval: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let defaults = dir.path().join("defaults.toml");
    fs::write(&defaults, DEFINITIONS).unwrap();
    let custom = dir.path().join("custom.toml");
    fs::write(&custom, "").unwrap();

    let config = ExporterConfig {
        default_metrics: Some(defaults),
        custom_metrics: vec![custom.clone()],
        scrape_interval,
        ..Default::default()
    };
    let db = DuckDbPool::connect(":memory:", 2, 0).unwrap();
    let exporter = Arc::new(Exporter::new(&config, Arc::new(db)).unwrap());

    let (fatal_tx, fatal_rx) = mpsc::channel(1);
    let state = AppState::new(exporter, &config.namespace, "/metrics", fatal_tx).unwrap();

    Harness {
        _dir: dir,
        custom,
        state,
        fatal_rx,
    }
}

async fn get(state: &AppState, uri: &str) -> (StatusCode, Option<String>, String) {
    let response = create_router(state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn test_landing_page_links_telemetry_path() {
    let harness = harness(Duration::ZERO);
    let (status, _, body) = get(&harness.state, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("href=\"/metrics\""));
}

#[tokio::test]
async fn test_metrics_endpoint_runs_a_cycle() {
    let harness = harness(Duration::ZERO);
    let (status, content_type, body) = get(&harness.state, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/plain"));
    assert!(body.contains("duckdb_answer_value 42"));
    assert!(body.contains("duckdb_up 1"));
    assert!(body.contains("duckdb_exporter_scrapes_total 1"));
    assert!(body.contains("duckdb_exporter_build_info{version="));

    let (_, _, body) = get(&harness.state, "/metrics").await;
    assert!(body.contains("duckdb_exporter_scrapes_total 2"));
}

#[tokio::test]
async fn test_scheduled_mode_serves_snapshot() {
    let harness = harness(Duration::from_secs(3600));
    harness.state.exporter.scheduled_scrape().await.unwrap();

    let (_, _, first) = get(&harness.state, "/metrics").await;
    let (_, _, second) = get(&harness.state, "/metrics").await;
    assert!(first.contains("duckdb_answer_value 42"));
    assert!(second.contains("duckdb_exporter_scrapes_total 1"));
    assert_eq!(harness.state.exporter.stats().scrapes(), 1);
}

#[tokio::test]
async fn test_healthz_reports_scrape_state() {
    let harness = harness(Duration::ZERO);
    get(&harness.state, "/metrics").await;

    let (status, _, body) = get(&harness.state, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["up"], true);
    assert_eq!(json["last_scrape_error"], false);
    assert_eq!(json["scrapes_total"], 1);
}

#[tokio::test]
async fn test_broken_definition_file_is_fatal() {
    let mut harness = harness(Duration::ZERO);
    let (status, _, _) = get(&harness.state, "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    fs::write(&harness.custom, "[[metric]\nbroken").unwrap();
    let (status, _, body) = get(&harness.state, "/metrics").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Cannot load metric definitions"));

    let reason = harness.fatal_rx.try_recv().unwrap();
    assert!(reason.contains("custom.toml"));
}
