// tests/pipeline_cycle.rs
//
// End-to-end orchestrator behaviour against a scripted source and mock
// providers. No network; state lives in a temp dir.
//
// Covered:
// - dedup across cycles and across a restart
// - newest-first batches dispatched oldest-first
// - first-run seeding by initial_fetch_count
// - filtered items advance the watermark without delivery
// - provider isolation, summarization timeout, payload trimming
// - failure escalation: one alert per streak, then one recovery notice
// - heartbeats from the run loop reach only the health target

use std::sync::Arc;
use std::time::Duration;

use moodle_courier::config::HealthSettings;
use moodle_courier::error::SourceError;
use moodle_courier::filter::FilterRules;
use moodle_courier::notify::{Dispatcher, MockBehavior, MockProvider, Provider};
use moodle_courier::pipeline::health::{ALERT_SUBJECT, HEARTBEAT_SUBJECT, RECOVERY_SUBJECT};
use moodle_courier::pipeline::{HealthMonitor, Pipeline, PipelineConfig, Shutdown, NO_SUBJECT};
use moodle_courier::source::{Notification, ScriptedSource};
use moodle_courier::state::{CorruptStatePolicy, LoadedState, PipelineState, StateStore};
use moodle_courier::transform::summarize::{MockSummarizer, Summarizer};

fn note(id: i64) -> Notification {
    Notification::new(id, format!("Notification {id}"), format!("<p>Body of {id}</p>"))
}

/// Newest first, like Moodle returns them.
fn batch(ids: &[i64]) -> Vec<Notification> {
    ids.iter().copied().map(note).collect()
}

struct Harness {
    _dir: tempfile::TempDir,
    store: StateStore,
    source: Arc<ScriptedSource>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), 50);
        Self {
            _dir: dir,
            store,
            source: Arc::new(ScriptedSource::new()),
        }
    }

    fn pipeline(
        &self,
        providers: Vec<Arc<dyn Provider>>,
        loaded: LoadedState,
        config: PipelineConfig,
    ) -> Pipeline {
        Pipeline::new(
            self.source.clone(),
            Arc::new(Dispatcher::new(providers, Duration::from_secs(2))),
            self.store.clone(),
            loaded,
            config,
        )
    }

    fn resumed_at(last: i64) -> LoadedState {
        LoadedState {
            state: PipelineState {
                last_notification_id: Some(last),
                ..PipelineState::default()
            },
            first_run: false,
        }
    }
}

#[tokio::test]
async fn newest_first_batch_is_dispatched_oldest_first() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let mut p = h.pipeline(vec![chat.clone()], Harness::resumed_at(4), PipelineConfig::default());

    h.source.push_batch(batch(&[7, 6, 5, 4, 3]));
    let report = p.run_once().await;

    assert!(report.is_success());
    assert_eq!(report.dispatched, 3);
    assert_eq!(
        chat.subjects(),
        vec!["Notification 5", "Notification 6", "Notification 7"]
    );
    assert_eq!(p.state().last_notification_id, Some(7));
    let history: Vec<i64> = p.state().history.iter().map(|e| e.id).collect();
    assert_eq!(history, vec![7, 6, 5]);
}

#[tokio::test]
async fn already_seen_ids_are_never_redelivered() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let mut p = h.pipeline(vec![chat.clone()], Harness::resumed_at(4), PipelineConfig::default());

    h.source.push_batch(batch(&[7, 6, 5]));
    h.source.push_batch(batch(&[8, 7, 6, 5]));
    h.source.push_batch(batch(&[8, 8, 7]));
    p.run_once().await;
    p.run_once().await;
    let third = p.run_once().await;

    assert_eq!(third.new, 0);
    let subjects = chat.subjects();
    assert_eq!(subjects.len(), 4);
    assert_eq!(subjects.last().map(String::as_str), Some("Notification 8"));

    // A restart resumes from the persisted watermark.
    let reopened = h.store.open(CorruptStatePolicy::Fail).unwrap();
    assert!(!reopened.first_run);
    let again = MockProvider::new("chat", MockBehavior::Succeed);
    let mut p2 = h.pipeline(vec![again.clone()], reopened, PipelineConfig::default());
    h.source.push_batch(batch(&[8, 7, 6, 5]));
    p2.run_once().await;
    assert!(again.calls().is_empty());
}

#[tokio::test]
async fn first_run_delivers_only_the_newest_items() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let loaded = h.store.open(CorruptStatePolicy::Fail).unwrap();
    assert!(loaded.first_run);
    let config = PipelineConfig {
        initial_fetch_count: 2,
        ..PipelineConfig::default()
    };
    let mut p = h.pipeline(vec![chat.clone()], loaded, config);

    h.source.push_batch(batch(&[10, 9, 8, 7, 6, 5, 4, 3, 2, 1]));
    let report = p.run_once().await;

    assert_eq!(report.seeded, 8);
    assert_eq!(report.dispatched, 2);
    assert_eq!(chat.subjects(), vec!["Notification 9", "Notification 10"]);
    assert_eq!(p.state().last_notification_id, Some(10));
    assert!(!p.is_first_run());

    let persisted = h.store.load().unwrap().unwrap();
    assert_eq!(persisted.last_notification_id, Some(10));
    assert_eq!(persisted.history.len(), 2);
}

#[tokio::test]
async fn empty_first_fetch_keeps_first_run_pending() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let loaded = h.store.open(CorruptStatePolicy::Fail).unwrap();
    let mut p = h.pipeline(vec![chat.clone()], loaded, PipelineConfig::default());

    h.source.push_batch(vec![]);
    h.source.push_batch(batch(&[3, 2, 1]));
    p.run_once().await;
    assert!(p.is_first_run());
    p.run_once().await;

    assert_eq!(chat.subjects(), vec!["Notification 3"]);
}

#[tokio::test]
async fn filtered_item_advances_watermark_without_delivery() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let mut filters = FilterRules {
        ignore_subjects_containing: vec!["Forum".into()],
        ignore_courses_by_id: vec![42],
    };
    filters.normalize();
    let config = PipelineConfig {
        filters,
        ..PipelineConfig::default()
    };
    let mut p = h.pipeline(vec![chat.clone()], Harness::resumed_at(4), config);

    h.source.push_batch(vec![
        Notification::new(8, "New FORUM post", "<p>x</p>"),
        note(7).with_course(42),
        note(6),
    ]);
    let report = p.run_once().await;

    assert_eq!(report.filtered, 2);
    assert_eq!(report.dispatched, 1);
    assert_eq!(chat.subjects(), vec!["Notification 6"]);
    assert_eq!(p.state().last_notification_id, Some(8));
    assert_eq!(p.state().history.len(), 1);
}

#[tokio::test]
async fn failing_provider_does_not_block_the_others() {
    let h = Harness::new();
    let good = MockProvider::new("good", MockBehavior::Succeed);
    let bad = MockProvider::new("bad", MockBehavior::Fail);
    let mut p = h.pipeline(
        vec![bad.clone(), good.clone()],
        Harness::resumed_at(0),
        PipelineConfig::default(),
    );

    h.source.push_batch(batch(&[1]));
    let report = p.run_once().await;

    assert!(report.is_success());
    assert_eq!(bad.calls().len(), 1);
    assert_eq!(good.calls().len(), 1);
    assert_eq!(p.state().history[0].providers, vec!["good".to_string()]);
    assert_eq!(p.state().last_notification_id, Some(1));
    assert_eq!(p.state().consecutive_failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_summarizer_still_delivers_without_summary() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let config = PipelineConfig {
        summary_timeout: Duration::from_millis(100),
        ..PipelineConfig::default()
    };
    let stalled: Arc<dyn Summarizer> = Arc::new(MockSummarizer::stalled(Duration::from_secs(600)));
    let mut p = h
        .pipeline(vec![chat.clone()], Harness::resumed_at(0), config)
        .with_summarizer(Some(stalled));

    h.source.push_batch(batch(&[1]));
    p.run_once().await;

    let calls = chat.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, "Body of 1");
    assert_eq!(calls[0].2, None);
}

#[tokio::test]
async fn summary_is_attached_when_available() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let ai: Arc<dyn Summarizer> = Arc::new(MockSummarizer::fixed("Essay due Friday"));
    let mut p = h
        .pipeline(vec![chat.clone()], Harness::resumed_at(0), PipelineConfig::default())
        .with_summarizer(Some(ai));

    h.source.push_batch(batch(&[1]));
    p.run_once().await;

    assert_eq!(chat.calls()[0].2.as_deref(), Some("Essay due Friday"));
    assert_eq!(p.state().history[0].summary.as_deref(), Some("Essay due Friday"));
}

#[tokio::test]
async fn empty_content_and_oversized_bodies_are_still_delivered() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let config = PipelineConfig {
        max_payload_bytes: 16,
        ..PipelineConfig::default()
    };
    let mut p = h.pipeline(vec![chat.clone()], Harness::resumed_at(0), config);

    h.source.push_batch(vec![
        Notification::new(2, "Long", format!("<p>{}</p>", "a".repeat(100))),
        Notification::new(1, "  ", ""),
    ]);
    p.run_once().await;

    let calls = chat.calls();
    assert_eq!(calls[0].0, NO_SUBJECT);
    assert_eq!(calls[0].1, NO_SUBJECT);
    assert_eq!(calls[1].1, "a".repeat(16));
}

#[tokio::test]
async fn failure_alert_fires_once_and_recovery_once() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let ops = MockProvider::new("ops", MockBehavior::Succeed);
    let health = HealthMonitor::new(
        &HealthSettings {
            enabled: true,
            heartbeat_interval_hours: None,
            failure_alert_threshold: Some(3),
            target_provider: Some("ops".into()),
        },
        0,
    );
    let mut p = h
        .pipeline(
            vec![chat.clone(), ops.clone()],
            Harness::resumed_at(10),
            PipelineConfig::default(),
        )
        .with_health(health);

    for _ in 0..5 {
        h.source
            .push_error(SourceError::Connection("connection refused".into()));
    }
    for _ in 0..5 {
        let r = p.run_once().await;
        assert!(!r.is_success());
    }
    assert_eq!(p.state().consecutive_failure_count, 5);
    assert_eq!(ops.subjects(), vec![ALERT_SUBJECT]);
    assert!(ops.calls()[0].1.contains("failed 3 consecutive cycles"));

    let persisted = h.store.load().unwrap().unwrap();
    assert_eq!(persisted.consecutive_failure_count, 5);

    h.source.push_batch(vec![]);
    assert!(p.run_once().await.is_success());
    assert_eq!(p.state().consecutive_failure_count, 0);
    assert_eq!(ops.subjects(), vec![ALERT_SUBJECT, RECOVERY_SUBJECT]);
    assert!(chat.calls().is_empty());
}

#[tokio::test]
async fn shutdown_before_the_batch_dispatches_nothing() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let mut p = h.pipeline(vec![chat.clone()], Harness::resumed_at(0), PipelineConfig::default());

    let (tx, shutdown) = Shutdown::channel();
    tx.send(true).unwrap();
    h.source.push_batch(batch(&[2, 1]));
    let report = p.run_cycle(&shutdown).await;

    assert!(report.interrupted);
    assert!(chat.calls().is_empty());
    assert_eq!(p.state().last_notification_id, Some(0));
}

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_shutdown_and_persists() {
    let h = Harness::new();
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let mut p = h.pipeline(vec![chat.clone()], Harness::resumed_at(0), PipelineConfig::default());
    h.source.push_batch(batch(&[1]));

    let (tx, shutdown) = Shutdown::channel();
    let source = h.source.clone();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(90)).await;
        tx.send(true).unwrap();
    });
    p.run(shutdown).await;
    stopper.await.unwrap();

    // One cycle at t=0, one after the 60 s interval, then shutdown during the sleep.
    assert_eq!(source.calls(), 2);
    assert_eq!(chat.subjects(), vec!["Notification 1"]);
    assert_eq!(h.store.load().unwrap().unwrap().last_notification_id, Some(1));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_reaches_only_the_target_provider() {
    let h = Harness::new();
    let ops = MockProvider::new("ops", MockBehavior::Succeed);
    let chat = MockProvider::new("chat", MockBehavior::Succeed);
    let mut config = PipelineConfig::default();
    config.notification.fetch_interval_secs = 3600;
    let health = HealthMonitor::new(
        &HealthSettings {
            enabled: true,
            heartbeat_interval_hours: Some(1),
            failure_alert_threshold: None,
            target_provider: Some("ops".into()),
        },
        0,
    );
    let mut p = h
        .pipeline(vec![ops.clone(), chat.clone()], Harness::resumed_at(0), config)
        .with_health(health);

    let (tx, shutdown) = Shutdown::channel();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(9000)).await;
        tx.send(true).unwrap();
    });
    p.run(shutdown).await;
    stopper.await.unwrap();

    // Ticks at 1 h and 2 h; none at startup, none after the 2.5 h shutdown.
    assert_eq!(ops.subjects(), vec![HEARTBEAT_SUBJECT, HEARTBEAT_SUBJECT]);
    assert!(ops.calls()[0].1.contains("Moodle Courier is running"));
    assert!(chat.calls().is_empty());
    assert_eq!(h.source.calls(), 3);
}
