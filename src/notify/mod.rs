// src/notify/mod.rs
//! Delivery providers and the fan-out dispatcher.
//!
//! A provider is anything that can take `(subject, message, summary)` and
//! report whether it delivered. The dispatcher calls every provider
//! concurrently, each under its own timeout, and turns errors, `false`
//! returns and timeouts into a per-provider [`DispatchReport`] entry.

pub mod discord;
pub mod email;
pub mod log;
pub mod ntfy;
pub mod registry;
pub mod slack;
pub mod webhook;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use reqwest::RequestBuilder;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ProviderSendError;

pub use registry::{ParamSpec, ProviderDescriptor, ProviderParams, Registry};

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(false)` and `Err(_)` are both failed deliveries.
    async fn send(&self, subject: &str, message: &str, summary: Option<&str>) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderOutcome {
    pub provider: String,
    #[serde(with = "outcome_serde")]
    pub result: std::result::Result<(), ProviderSendError>,
    pub elapsed_ms: u64,
}

impl ProviderOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

mod outcome_serde {
    use serde::Serializer;

    use crate::error::ProviderSendError;

    pub fn serialize<S: Serializer>(
        r: &Result<(), ProviderSendError>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match r {
            Ok(()) => s.serialize_str("ok"),
            Err(e) => s.serialize_str(&e.to_string()),
        }
    }
}

/// Per-provider results for one dispatched message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub outcomes: Vec<ProviderOutcome>,
}

impl DispatchReport {
    pub fn delivered(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.is_success())
            .map(|o| o.provider.clone())
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ProviderSendError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.provider.as_str(), e)))
    }

    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| !o.is_success())
    }
}

/// Owns the instantiated providers for the process lifetime.
pub struct Dispatcher {
    providers: Vec<Arc<dyn Provider>>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(providers: Vec<Arc<dyn Provider>>, timeout: Duration) -> Self {
        Self { providers, timeout }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.iter().any(|p| p.name() == name)
    }

    /// Send to every provider; waits for all of them, never fails.
    pub async fn dispatch(
        &self,
        subject: &str,
        message: &str,
        summary: Option<&str>,
    ) -> DispatchReport {
        let calls = self
            .providers
            .iter()
            .map(|p| send_one(p.as_ref(), subject, message, summary, self.timeout));
        let outcomes = join_all(calls).await;
        DispatchReport { outcomes }
    }

    /// Send to a single named provider. `None` when no such provider is loaded.
    pub async fn dispatch_to(
        &self,
        name: &str,
        subject: &str,
        message: &str,
    ) -> Option<ProviderOutcome> {
        let provider = self.providers.iter().find(|p| p.name() == name)?;
        Some(send_one(provider.as_ref(), subject, message, None, self.timeout).await)
    }
}

async fn send_one(
    provider: &dyn Provider,
    subject: &str,
    message: &str,
    summary: Option<&str>,
    timeout: Duration,
) -> ProviderOutcome {
    let name = provider.name().to_string();
    let started = Instant::now();
    // A panicking provider is contained to its own outcome.
    let send = AssertUnwindSafe(provider.send(subject, message, summary)).catch_unwind();
    let result = match tokio::time::timeout(timeout, send).await {
        Ok(Ok(Ok(true))) => Ok(()),
        Ok(Ok(Ok(false))) => Err(ProviderSendError::Rejected),
        Ok(Ok(Err(e))) => Err(ProviderSendError::Raised(format!("{e:#}"))),
        Ok(Err(panic)) => Err(ProviderSendError::Raised(format!(
            "provider panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Err(_) => Err(ProviderSendError::TimedOut(timeout.as_millis() as u64)),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match &result {
        Ok(()) => {
            debug!(provider = %name, elapsed_ms, "delivered");
            metrics::counter!("courier_provider_sends_total", "provider" => name.clone(), "outcome" => "ok")
                .increment(1);
        }
        Err(e) => {
            warn!(provider = %name, elapsed_ms, error = %e, "delivery failed");
            metrics::counter!("courier_provider_sends_total", "provider" => name.clone(), "outcome" => "error")
                .increment(1);
        }
    }

    ProviderOutcome {
        provider: name,
        result,
        elapsed_ms,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Send an HTTP request, retrying transport errors and non-2xx answers
/// with `500ms << (attempt - 1)` backoff. `build` is called once per attempt.
pub(crate) async fn send_with_retry<F>(label: &str, max_attempts: u8, build: F) -> Result<()>
where
    F: Fn() -> RequestBuilder,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt: u8 = 0;
    loop {
        attempt += 1;
        let err = match build().send().await {
            Ok(rsp) => match rsp.error_for_status() {
                Ok(_) => return Ok(()),
                // 4xx other than rate limiting will not get better by retrying.
                Err(e) if e.status().is_some_and(|s| s.is_client_error() && s.as_u16() != 429) => {
                    return Err(anyhow!("{label} HTTP error: {e}"));
                }
                Err(e) => anyhow!("{label} HTTP error: {e}"),
            },
            Err(e) => anyhow!("{label} request failed: {e}"),
        };
        if attempt >= max_attempts {
            return Err(err);
        }
        debug!(%label, attempt, error = %err, "retrying");
        tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
    }
}

/// Cut to at most `max_chars` characters, marking the cut with an ellipsis.
pub(crate) fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

// --- Test helper ---

#[derive(Debug, Clone, Copy)]
pub enum MockBehavior {
    Succeed,
    Reject,
    Fail,
    Stall(Duration),
    Panic,
}

/// Records every call; replies according to its [`MockBehavior`].
pub struct MockProvider {
    name: String,
    behavior: MockBehavior,
    calls: Mutex<Vec<(String, String, Option<String>)>>,
}

impl MockProvider {
    pub fn new(name: &str, behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, String, Option<String>)> {
        self.calls.lock().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.calls().into_iter().map(|(s, _, _)| s).collect()
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, subject: &str, message: &str, summary: Option<&str>) -> Result<bool> {
        self.calls.lock().push((
            subject.to_string(),
            message.to_string(),
            summary.map(str::to_string),
        ));
        match self.behavior {
            MockBehavior::Succeed => Ok(true),
            MockBehavior::Reject => Ok(false),
            MockBehavior::Fail => Err(anyhow!("{} is down", self.name)),
            MockBehavior::Stall(d) => {
                tokio::time::sleep(d).await;
                Ok(true)
            }
            MockBehavior::Panic => panic!("{} crashed mid-send", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(providers: Vec<Arc<dyn Provider>>) -> Dispatcher {
        Dispatcher::new(providers, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn one_failing_provider_does_not_stop_the_others() {
        let a = MockProvider::new("a", MockBehavior::Succeed);
        let b = MockProvider::new("b", MockBehavior::Fail);
        let c = MockProvider::new("c", MockBehavior::Reject);
        let d = dispatcher(vec![a.clone(), b.clone(), c.clone()]);

        let report = d.dispatch("Subj", "Body", Some("tl;dr")).await;

        assert_eq!(report.attempted(), 3);
        assert_eq!(report.delivered(), vec!["a".to_string()]);
        let failures: Vec<_> = report.failures().map(|(n, _)| n.to_string()).collect();
        assert_eq!(failures, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(a.calls()[0].2.as_deref(), Some("tl;dr"));
        assert_eq!(b.calls().len(), 1);
    }

    #[tokio::test]
    async fn panicking_provider_is_recorded_as_raised() {
        let boom = MockProvider::new("boom", MockBehavior::Panic);
        let ok = MockProvider::new("ok", MockBehavior::Succeed);
        let d = dispatcher(vec![boom.clone(), ok.clone()]);

        let report = d.dispatch("s", "m", None).await;

        assert_eq!(report.delivered(), vec!["ok".to_string()]);
        match &report.outcomes[0].result {
            Err(ProviderSendError::Raised(reason)) => {
                assert!(reason.contains("boom crashed mid-send"), "{reason}")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(boom.calls().len(), 1);
        assert_eq!(ok.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_provider_times_out() {
        let slow = MockProvider::new("slow", MockBehavior::Stall(Duration::from_secs(60)));
        let d = dispatcher(vec![slow]);
        let report = d.dispatch("s", "m", None).await;
        assert!(report.all_failed());
        assert!(matches!(
            report.outcomes[0].result,
            Err(ProviderSendError::TimedOut(200))
        ));
    }

    #[tokio::test]
    async fn dispatch_to_targets_only_the_named_provider() {
        let a = MockProvider::new("a", MockBehavior::Succeed);
        let b = MockProvider::new("b", MockBehavior::Succeed);
        let d = dispatcher(vec![a.clone(), b.clone()]);

        let outcome = d.dispatch_to("b", "Heartbeat", "alive").await.unwrap();
        assert!(outcome.is_success());
        assert!(a.calls().is_empty());
        assert_eq!(b.subjects(), vec!["Heartbeat".to_string()]);
        assert!(d.dispatch_to("nope", "x", "y").await.is_none());
    }

    #[tokio::test]
    async fn empty_dispatcher_reports_nothing() {
        let report = dispatcher(vec![]).dispatch("s", "m", None).await;
        assert_eq!(report.attempted(), 0);
        assert!(!report.all_failed());
    }

    #[test]
    fn clip_marks_the_cut() {
        assert_eq!(clip("short", 10), "short");
        assert_eq!(clip("abcdef", 4), "abc…");
    }
}
