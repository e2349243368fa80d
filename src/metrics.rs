// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("courier_fetch_total", "Fetch attempts against the remote source, by outcome.");
        describe_counter!(
            "courier_fetch_failures_total",
            "Failed fetches, by error kind."
        );
        describe_counter!(
            "courier_notifications_dispatched_total",
            "Notifications handed to the dispatcher."
        );
        describe_counter!(
            "courier_notifications_filtered_total",
            "Notifications skipped by filter rules."
        );
        describe_counter!(
            "courier_notifications_seeded_total",
            "Backlog notifications marked handled on first run without dispatch."
        );
        describe_counter!(
            "courier_provider_sends_total",
            "Provider send attempts, by provider and outcome."
        );
        describe_counter!(
            "courier_summaries_failed_total",
            "Summaries skipped after a summarization error or timeout."
        );
        describe_counter!("courier_health_messages_total", "Heartbeats, alerts and recovery notices sent.");
        describe_gauge!(
            "courier_consecutive_failures",
            "Consecutive failed pipeline cycles."
        );
        describe_gauge!("courier_last_cycle_ts", "Unix ts when the last pipeline cycle finished.");
        describe_gauge!("courier_last_notification_id", "Current dedup watermark.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already installed.
    pub fn init() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// A handle not wired to the global recorder; renders whatever it records.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
        }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
