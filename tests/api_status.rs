// tests/api_status.rs
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, Router};
use http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt; // for `oneshot`

use moodle_courier::metrics::Metrics;
use moodle_courier::notify::{Dispatcher, MockBehavior, MockProvider};
use moodle_courier::pipeline::{Pipeline, PipelineConfig};
use moodle_courier::router;
use moodle_courier::source::{Notification, ScriptedSource};
use moodle_courier::state::{LoadedState, PipelineState, StateStore};

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let res = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// A pipeline that has delivered ids 11..=13 to a `chat` provider.
async fn pipeline_after_one_cycle(dir: &tempfile::TempDir) -> Pipeline {
    let source = Arc::new(ScriptedSource::new());
    source.push_batch(
        [13, 12, 11]
            .into_iter()
            .map(|id| Notification::new(id, format!("Item {id}"), "<p>body</p>"))
            .collect(),
    );
    let loaded = LoadedState {
        state: PipelineState {
            last_notification_id: Some(10),
            ..PipelineState::default()
        },
        first_run: false,
    };
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let mut p = Pipeline::new(
        source,
        Arc::new(Dispatcher::new(vec![chat], Duration::from_secs(1))),
        StateStore::new(dir.path().join("state.json"), 10),
        loaded,
        PipelineConfig::default(),
    );
    assert!(p.run_once().await.is_success());
    p
}

#[tokio::test]
async fn health_reports_watermark_and_providers() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline_after_one_cycle(&dir).await;
    let app = router(p.subscribe(), &Metrics::detached());

    let (status, body) = get_json(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["last_notification_id"], 13);
    assert_eq!(body["consecutive_failures"], 0);
    assert_eq!(body["providers"], serde_json::json!(["chat"]));
    assert!(body["last_cycle_at"].is_string());
}

#[tokio::test]
async fn history_is_newest_first_and_honours_limit() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline_after_one_cycle(&dir).await;

    let (_, all) = get_json(router(p.subscribe(), &Metrics::detached()), "/history").await;
    let ids: Vec<i64> = all
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![13, 12, 11]);
    assert_eq!(all[0]["providers"], serde_json::json!(["chat"]));

    let (_, one) = get_json(router(p.subscribe(), &Metrics::detached()), "/history?limit=1").await;
    assert_eq!(one.as_array().unwrap().len(), 1);
    assert_eq!(one[0]["subject"], "Item 13");
}

#[tokio::test]
async fn metrics_endpoint_and_cors_are_mounted() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline_after_one_cycle(&dir).await;
    let app = router(p.subscribe(), &Metrics::detached());

    let res = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .header("origin", "https://dashboard.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn unknown_route_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline_after_one_cycle(&dir).await;
    let res = router(p.subscribe(), &Metrics::detached())
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
