// src/pipeline/health.rs
//! Operator-facing health messages: failure alerts, recovery notices and
//! heartbeats. All of them go to a single target provider, never to the
//! full notification fan-out.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::HealthSettings;
use crate::notify::Dispatcher;
use crate::state::PipelineState;

pub const ALERT_SUBJECT: &str = "Failure Alert";
pub const RECOVERY_SUBJECT: &str = "Recovered";
pub const HEARTBEAT_SUBJECT: &str = "Heartbeat";

#[derive(Debug)]
pub struct HealthMonitor {
    enabled: bool,
    threshold: Option<u32>,
    heartbeat: Option<Duration>,
    target: Option<String>,
    /// An alert went out for the current failure streak.
    alert_sent: bool,
    started_at: DateTime<Utc>,
}

impl HealthMonitor {
    /// `current_failures` is the persisted streak, so a restart mid-streak
    /// neither re-alerts nor forgets to send the recovery notice.
    pub fn new(settings: &HealthSettings, current_failures: u32) -> Self {
        let threshold = settings.failure_alert_threshold.filter(|t| *t > 0);
        Self {
            enabled: settings.enabled,
            threshold,
            heartbeat: settings
                .heartbeat_interval_hours
                .filter(|h| *h > 0)
                .map(|h| Duration::from_secs(h * 3600)),
            target: settings.target_provider.clone(),
            alert_sent: settings.enabled && threshold.is_some_and(|t| current_failures >= t),
            started_at: Utc::now(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(&HealthSettings::default(), 0)
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// First tick one full period after start; no heartbeat at startup.
    pub fn heartbeat_timer(&self) -> Option<Interval> {
        if !self.enabled {
            return None;
        }
        let period = self.heartbeat?;
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(timer)
    }

    /// Called after every failed cycle. Returns whether an alert was attempted.
    pub async fn on_failure(
        &mut self,
        consecutive_failures: u32,
        last_error: &str,
        dispatcher: &Dispatcher,
    ) -> bool {
        let Some(threshold) = self.threshold.filter(|_| self.enabled) else {
            return false;
        };
        if self.alert_sent || consecutive_failures < threshold {
            return false;
        }
        self.alert_sent = true;
        let message = format!(
            "Moodle Courier has failed {consecutive_failures} consecutive cycles.\n\nLast error: {last_error}"
        );
        self.send(dispatcher, ALERT_SUBJECT, &message).await;
        true
    }

    /// Called after every successful cycle. Sends one recovery notice per alerted streak.
    pub async fn on_success(&mut self, previous_failures: u32, dispatcher: &Dispatcher) -> bool {
        if !self.alert_sent {
            return false;
        }
        self.alert_sent = false;
        let message = format!("Moodle Courier recovered after {previous_failures} failed cycles.");
        self.send(dispatcher, RECOVERY_SUBJECT, &message).await;
        true
    }

    pub async fn heartbeat(&self, dispatcher: &Dispatcher, state: &PipelineState) -> bool {
        let uptime = Utc::now().signed_duration_since(self.started_at);
        let last_id = state
            .last_notification_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".to_string());
        let message = format!(
            "Moodle Courier is running.\n\nUptime: {}h {}m\nLast notification id: {last_id}\nConsecutive failures: {}",
            uptime.num_hours(),
            uptime.num_minutes() % 60,
            state.consecutive_failure_count,
        );
        self.send(dispatcher, HEARTBEAT_SUBJECT, &message).await
    }

    async fn send(&self, dispatcher: &Dispatcher, subject: &str, message: &str) -> bool {
        let Some(target) = self.target.as_deref() else {
            warn!(%subject, "no health target_provider configured; health message skipped");
            return false;
        };
        match dispatcher.dispatch_to(target, subject, message).await {
            Some(outcome) if outcome.is_success() => {
                info!(provider = target, %subject, "health message sent");
                metrics::counter!("courier_health_messages_total", "kind" => subject.to_lowercase())
                    .increment(1);
                true
            }
            Some(outcome) => {
                warn!(provider = target, %subject, error = ?outcome.result.err(), "health message failed");
                false
            }
            None => {
                warn!(provider = target, %subject, "health target provider is not loaded");
                false
            }
        }
    }
}
