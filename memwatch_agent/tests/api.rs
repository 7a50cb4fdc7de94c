//! HTTP surface driven in-process through the router.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use common::*;
use memwatch_agent::api::router;
use memwatch_agent::hotspots::{AllocationProfiler, HotspotTracker, ProfilerConfig};
use memwatch_agent::state::AppState;

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let resp = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn pending_until_first_publication() {
    let (_agg, q) = healthy_aggregator();
    let app = router(AppState::new(q, None));

    let (status, body) = get(&app, "/memory-usage/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "pending");

    let (status, body) = get(&app, "/memory-usage/history/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn memory_usage_reports_latest_snapshot() {
    let (mut agg, q) = healthy_aggregator();
    let app = router(AppState::new(q, None));
    agg.tick().await;
    agg.tick().await;

    for uri in ["/memory-usage/", "/memory-usage"] {
        let (status, body) = get(&app, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["seq"], 2);
        assert_eq!(body["memory_usage"], 64.0);
        assert_eq!(body["total_system_memory"], 16000.0);
        assert_eq!(body["available_memory"], 4000.0);
        assert_eq!(body["memory_percent"], 75.0);
        assert_eq!(body["system_stale"], false);
        assert_eq!(body["celery"], 150.0);
        assert_eq!(body["processes"].as_array().map(Vec::len), Some(10));
        assert_eq!(body["processes"][0]["name"], "memwatch_agent");
        assert_eq!(body["top_views"].as_array().map(Vec::len), Some(3));
        assert_eq!(body["top_views"][0]["filename"], "src/cache.rs");
        assert_eq!(body["celery_workers"].as_array().map(Vec::len), Some(2));
        assert_eq!(body["python_processes"].as_array().map(Vec::len), Some(9));
    }
}

#[tokio::test]
async fn history_is_bounded_and_oldest_first() {
    let (mut agg, q) = healthy_aggregator();
    let app = router(AppState::new(q, None));
    for _ in 0..7 {
        agg.tick().await;
    }
    let (status, body) = get(&app, "/memory-usage/history/").await;
    assert_eq!(status, StatusCode::OK);
    let seqs: Vec<u64> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, vec![3, 4, 5, 6, 7]);
}

#[tokio::test]
async fn samples_flatten_every_available_reading() {
    let (mut agg, q) = healthy_aggregator();
    let app = router(AppState::new(q, None));

    let (status, _) = get(&app, "/memory-usage/samples/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    agg.tick().await;
    let (status, body) = get(&app, "/memory-usage/samples/").await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    // self + total/available + top 10 + 2 workers + 3 hotspots
    assert_eq!(rows.len(), 18);
    assert_eq!(rows[0]["source"], "process");
    assert_eq!(rows[0]["name"], "self");
    assert_eq!(rows[0]["bytes"], 64 * MB);
    assert!(rows.iter().any(|r| r["source"] == "workers" && r["name"] == "celery@a"));
    assert!(rows.iter().any(|r| r["source"] == "hotspots" && r["name"] == "src/cache.rs:10"));
}

#[tokio::test]
async fn health_turns_unavailable_after_shutdown() {
    let (agg, q) = healthy_aggregator();
    let app = router(AppState::new(q, None));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(agg.run(cancel.clone()));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let (status, body) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["aggregator"]["last_seq"].as_u64().unwrap() >= 1);
    assert_eq!(body["aggregator"]["history_capacity"], 5);
    assert!(body["profiler"].is_null());
    assert!(body["hostname"].is_string());

    cancel.cancel();
    handle.await.unwrap();
    let (status, body) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "shutting_down");

    // the last publication stays readable
    let (status, _) = get(&app, "/memory-usage/").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_reports_profiler_only_when_attached() {
    let (mut agg, q) = healthy_aggregator();
    agg.tick().await;

    let (_, body) = get(&router(AppState::new(q.clone(), None)), "/healthz").await;
    assert!(body["profiler"].is_null());

    let profiler: &'static AllocationProfiler =
        Box::leak(Box::new(AllocationProfiler::new(&ProfilerConfig::default())));
    let tracker = std::sync::Arc::new(HotspotTracker::with_profiler(profiler));
    tracker.start();
    let (status, body) = get(&router(AppState::new(q, Some(tracker))), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["profiler"]["recording"], true);
    assert_eq!(body["profiler"]["sample_rate"], 64);
}
