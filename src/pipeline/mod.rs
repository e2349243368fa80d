// src/pipeline/mod.rs
//! The polling orchestrator.
//!
//! One sequential loop per account: fetch, select new items oldest-first,
//! filter, transform, dispatch, record, persist, sleep. Fetch errors are
//! counted and survived; only startup configuration errors are fatal.
//!
//! Delivery is at-most-once except for one window: a crash after a provider
//! accepted a notification but before the following state save redelivers
//! that single notification on restart.

pub mod health;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};

use crate::config::{NotificationSettings, Settings};
use crate::error::SourceError;
use crate::filter::FilterRules;
use crate::notify::{DispatchReport, Dispatcher};
use crate::source::{Notification, NotificationId, NotificationSource};
use crate::state::{HistoryEntry, LoadedState, PipelineState, StateStore};
use crate::transform::{self, Summarizer};

pub use health::HealthMonitor;

pub const NO_SUBJECT: &str = "(no subject)";

/// Knobs the orchestrator reads; a projection of [`Settings`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub initial_fetch_count: usize,
    pub max_payload_bytes: usize,
    pub summary_timeout: Duration,
    pub filters: FilterRules,
    pub notification: NotificationSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            initial_fetch_count: 1,
            max_payload_bytes: 65_536,
            summary_timeout: Duration::from_secs(20),
            filters: FilterRules::default(),
            notification: NotificationSettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            initial_fetch_count: s.moodle.initial_fetch_count,
            max_payload_bytes: s.notification.max_payload_bytes,
            summary_timeout: Duration::from_secs(s.ai.timeout_secs.max(1)),
            filters: s.filters.clone(),
            notification: s.notification.clone(),
        }
    }
}

/// Cooperative shutdown flag. Checked between items and between cycles.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Never fires.
    pub fn never() -> Self {
        Self::channel().1
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested; pends forever if the sender is gone.
    pub async fn requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// What the status API shows.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: &'static str,
    pub consecutive_failures: u32,
    pub last_notification_id: Option<NotificationId>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub providers: Vec<String>,
    pub history: Vec<HistoryEntry>,
}

impl StatusSnapshot {
    fn starting(state: &PipelineState, providers: Vec<String>) -> Self {
        Self {
            status: "starting",
            consecutive_failures: state.consecutive_failure_count,
            last_notification_id: state.last_notification_id,
            last_cycle_at: state.updated_at,
            last_error: None,
            providers,
            history: state.history.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub new: usize,
    pub dispatched: usize,
    pub filtered: usize,
    /// First-run backlog marked handled without dispatch.
    pub seeded: usize,
    pub error: Option<String>,
    /// Shutdown interrupted the batch.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

enum ItemOutcome {
    Dispatched,
    Filtered,
}

pub struct Pipeline {
    source: Arc<dyn NotificationSource>,
    dispatcher: Arc<Dispatcher>,
    summarizer: Option<Arc<dyn Summarizer>>,
    store: StateStore,
    state: PipelineState,
    first_run: bool,
    config: PipelineConfig,
    health: HealthMonitor,
    status: watch::Sender<StatusSnapshot>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn NotificationSource>,
        dispatcher: Arc<Dispatcher>,
        store: StateStore,
        loaded: LoadedState,
        config: PipelineConfig,
    ) -> Self {
        let LoadedState { state, first_run } = loaded;
        let (status, _) = watch::channel(StatusSnapshot::starting(&state, dispatcher.names()));
        Self {
            source,
            dispatcher,
            summarizer: None,
            store,
            health: HealthMonitor::disabled(),
            state,
            first_run,
            config,
            status,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_health(mut self, health: HealthMonitor) -> Self {
        if let Some(target) = health.target() {
            if !self.dispatcher.contains(target) {
                warn!(provider = target, "health target provider is not enabled; health messages will be skipped");
            }
        }
        self.health = health;
        self
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn is_first_run(&self) -> bool {
        self.first_run
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Exactly one cycle, no shutdown handling.
    pub async fn run_once(&mut self) -> CycleReport {
        self.run_cycle(&Shutdown::never()).await
    }

    /// Loop until shutdown. The in-flight cycle always finishes persisting first.
    pub async fn run(&mut self, mut shutdown: Shutdown) {
        info!(
            source = self.source.name(),
            providers = ?self.dispatcher.names(),
            interval_secs = self.config.notification.fetch_interval_secs,
            first_run = self.first_run,
            "pipeline started"
        );
        let mut heartbeat = self.health.heartbeat_timer();

        'outer: loop {
            if shutdown.is_requested() {
                break;
            }
            let report = self.run_cycle(&shutdown).await;
            if report.interrupted || shutdown.is_requested() {
                break;
            }

            let wait = self
                .config
                .notification
                .backoff_after(self.state.consecutive_failure_count);
            debug!(wait_secs = wait.as_secs(), "sleeping until next cycle");
            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = shutdown.requested() => break 'outer,
                    _ = next_tick(heartbeat.as_mut()) => {
                        self.health.heartbeat(&self.dispatcher, &self.state).await;
                    }
                }
            }
        }

        if let Err(e) = self.store.save(&self.state) {
            error!(error = %e, "final state save failed");
        }
        info!(last_id = ?self.state.last_notification_id, "pipeline stopped");
    }

    pub async fn run_cycle(&mut self, shutdown: &Shutdown) -> CycleReport {
        let batch = match self.source.fetch_notifications().await {
            Ok(batch) => {
                metrics::counter!("courier_fetch_total", "outcome" => "ok").increment(1);
                batch
            }
            Err(e) => return self.fail_cycle(&e).await,
        };

        let mut report = CycleReport {
            fetched: batch.len(),
            ..CycleReport::default()
        };
        let mut fresh = self.select_new(batch);
        report.new = fresh.len();

        if self.first_run && !fresh.is_empty() {
            let keep = self.config.initial_fetch_count.min(fresh.len());
            let backlog: Vec<Notification> = fresh.drain(..fresh.len() - keep).collect();
            if let Some(newest_skipped) = backlog.last() {
                self.state.advance(newest_skipped.id);
            }
            report.seeded = backlog.len();
            metrics::counter!("courier_notifications_seeded_total").increment(backlog.len() as u64);
            info!(
                seeded = backlog.len(),
                delivering = keep,
                "first run: marking backlog as handled"
            );
        }

        let mut save_error = None;
        for item in fresh {
            if shutdown.is_requested() {
                info!(next_id = item.id, "shutdown requested; stopping batch");
                report.interrupted = true;
                break;
            }
            match self.handle(item).await {
                ItemOutcome::Dispatched => report.dispatched += 1,
                ItemOutcome::Filtered => report.filtered += 1,
            }
            if let Err(e) = self.store.save(&self.state) {
                error!(error = %e, "state save failed mid-batch; stopping batch");
                save_error = Some(e.to_string());
                break;
            }
        }

        if self.state.last_notification_id.is_some() {
            self.first_run = false;
        }

        match save_error {
            Some(reason) => {
                let mut failed = self.fail_with(reason, "state").await;
                failed.fetched = report.fetched;
                failed.new = report.new;
                failed.dispatched = report.dispatched;
                failed.filtered = report.filtered;
                failed.seeded = report.seeded;
                failed
            }
            None => {
                self.succeed_cycle().await;
                report
            }
        }
    }

    /// Strictly newer than the watermark, deduplicated, oldest first.
    fn select_new(&self, batch: Vec<Notification>) -> Vec<Notification> {
        let descending = batch.windows(2).all(|w| w[0].id > w[1].id);
        if !descending && batch.len() > 1 {
            let ids: Vec<NotificationId> = batch.iter().map(|n| n.id).collect();
            warn!(?ids, "source returned ids out of newest-first order");
        }
        let mut fresh: Vec<Notification> = batch
            .into_iter()
            .filter(|n| !self.state.is_seen(n.id))
            .collect();
        fresh.sort_by_key(|n| n.id);
        fresh.dedup_by_key(|n| n.id);
        fresh
    }

    async fn handle(&mut self, mut item: Notification) -> ItemOutcome {
        if let Some(reason) = self.config.filters.ignore_reason(&item) {
            info!(id = item.id, %reason, "notification filtered");
            metrics::counter!("courier_notifications_filtered_total").increment(1);
            self.state.advance(item.id);
            return ItemOutcome::Filtered;
        }

        let subject = display_subject(&item.subject);
        let body = prepare_body(&item.raw_body, &subject);
        let summary = transform::summarize(
            self.summarizer.as_deref(),
            &body,
            self.config.summary_timeout,
        )
        .await;

        let (message, cut) = transform::trim_to_limit(&body, self.config.max_payload_bytes);
        if cut {
            warn!(id = item.id, limit = self.config.max_payload_bytes, "message trimmed to payload limit");
        }
        let summary = summary.map(|s| transform::trim_to_limit(&s, self.config.max_payload_bytes).0);

        item.normalized_body = Some(message.clone());
        item.summary = summary.clone();

        if self.dispatcher.is_empty() {
            warn!(id = item.id, "no providers enabled; notification recorded without delivery");
        }
        let report = self
            .dispatcher
            .dispatch(&subject, &message, summary.as_deref())
            .await;
        log_dispatch(item.id, &report);
        metrics::counter!("courier_notifications_dispatched_total").increment(1);

        let entry = HistoryEntry {
            id: item.id,
            subject,
            timestamp: item.created_at.unwrap_or(item.received_at),
            message,
            summary,
            providers: report.delivered(),
            course_id: item.course_id,
            context_url: item.context_url,
        };
        self.store.record(&mut self.state, entry);
        ItemOutcome::Dispatched
    }

    async fn fail_cycle(&mut self, e: &SourceError) -> CycleReport {
        metrics::counter!("courier_fetch_total", "outcome" => "error").increment(1);
        metrics::counter!("courier_fetch_failures_total", "kind" => e.kind()).increment(1);
        self.fail_with(e.to_string(), e.kind()).await
    }

    async fn fail_with(&mut self, reason: String, kind: &'static str) -> CycleReport {
        self.state.consecutive_failure_count = self.state.consecutive_failure_count.saturating_add(1);
        let count = self.state.consecutive_failure_count;
        warn!(%kind, consecutive_failures = count, error = %reason, "pipeline cycle failed");

        self.health.on_failure(count, &reason, &self.dispatcher).await;
        self.finish_cycle(Some(reason.clone()));
        CycleReport {
            error: Some(reason),
            ..CycleReport::default()
        }
    }

    async fn succeed_cycle(&mut self) {
        let previous = self.state.consecutive_failure_count;
        if previous > 0 {
            info!(after_failures = previous, "pipeline recovered");
        }
        self.state.consecutive_failure_count = 0;
        self.health.on_success(previous, &self.dispatcher).await;
        self.finish_cycle(None);
    }

    fn finish_cycle(&mut self, error: Option<String>) {
        let now = Utc::now();
        self.state.updated_at = Some(now);
        if let Err(e) = self.store.save(&self.state) {
            error!(error = %e, "state save failed");
        }

        metrics::gauge!("courier_consecutive_failures").set(self.state.consecutive_failure_count as f64);
        metrics::gauge!("courier_last_cycle_ts").set(now.timestamp() as f64);
        if let Some(id) = self.state.last_notification_id {
            metrics::gauge!("courier_last_notification_id").set(id as f64);
        }

        let status = if error.is_some() { "degraded" } else { "ok" };
        self.status.send_replace(StatusSnapshot {
            status,
            consecutive_failures: self.state.consecutive_failure_count,
            last_notification_id: self.state.last_notification_id,
            last_cycle_at: Some(now),
            last_error: error,
            providers: self.dispatcher.names(),
            history: self.state.history.iter().cloned().collect(),
        });
    }
}

/// Push the built-in test message through every provider. Touches no state.
pub async fn send_test_notification(
    dispatcher: &Dispatcher,
    summarizer: Option<&dyn Summarizer>,
    summary_timeout: Duration,
) -> DispatchReport {
    let note = Notification::test_message();
    let body = prepare_body(&note.raw_body, &note.subject);
    let summary = transform::summarize(summarizer, &body, summary_timeout).await;
    let report = dispatcher
        .dispatch(&note.subject, &body, summary.as_deref())
        .await;
    log_dispatch(note.id, &report);
    report
}

fn display_subject(subject: &str) -> String {
    let s = subject.trim();
    if s.is_empty() {
        NO_SUBJECT.to_string()
    } else {
        s.to_string()
    }
}

fn prepare_body(raw: &str, subject: &str) -> String {
    let body = transform::normalize(raw);
    if body.is_empty() {
        subject.to_string()
    } else {
        body
    }
}

fn log_dispatch(id: NotificationId, report: &DispatchReport) {
    let delivered = report.delivered();
    if report.all_failed() {
        warn!(id, attempted = report.attempted(), "no provider accepted the notification");
    } else {
        info!(id, ?delivered, attempted = report.attempted(), "notification dispatched");
    }
}

async fn next_tick(timer: Option<&mut Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_subject_and_body_get_fallbacks() {
        assert_eq!(display_subject("   "), NO_SUBJECT);
        assert_eq!(display_subject(" Quiz "), "Quiz");
        assert_eq!(prepare_body("<p> </p>", "Quiz"), "Quiz");
        assert_eq!(prepare_body("<p>Hi</p>", "Quiz"), "Hi");
    }

    #[tokio::test]
    async fn shutdown_never_is_never_requested() {
        let s = Shutdown::never();
        assert!(!s.is_requested());
        let (tx, mut s) = Shutdown::channel();
        tx.send(true).unwrap();
        assert!(s.is_requested());
        s.requested().await;
    }
}
