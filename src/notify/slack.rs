// src/notify/slack.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;

use super::registry::{ParamSpec, ProviderDescriptor, ProviderParams};
use super::{send_with_retry, Provider};
use crate::error::ProviderConfigError;

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required("webhook_url", "Slack incoming-webhook URL").secret(),
    ParamSpec::optional("timeout_secs", Some("4"), "HTTP timeout per attempt"),
    ParamSpec::optional("retries", Some("3"), "Attempts before giving up"),
];

pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        name: "slack",
        description: "Posts mrkdwn text to a Slack incoming webhook",
        params: PARAMS,
        build,
    }
}

fn build(p: &ProviderParams) -> Result<Arc<dyn Provider>, ProviderConfigError> {
    let retries = u8::try_from(p.u64_or("retries", 3)?).map_err(|_| p.invalid("retries", "too large"))?;
    Ok(Arc::new(
        SlackNotifier::new(p.require("webhook_url")?.to_string())
            .with_timeout(p.u64_or("timeout_secs", 4)?)
            .with_retries(retries),
    ))
}

pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
    timeout: Duration,
    retries: u8,
}

impl SlackNotifier {
    pub fn new(url: String) -> Self {
        Self {
            webhook_url: url,
            client: Client::new(),
            timeout: Duration::from_secs(4),
            retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs.max(1));
        self
    }

    pub fn with_retries(mut self, n: u8) -> Self {
        self.retries = n;
        self
    }
}

/// Slack treats `&`, `<` and `>` as control characters in mrkdwn.
fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn render(subject: &str, message: &str, summary: Option<&str>) -> String {
    let mut text = format!("*{}*\n{}", escape(subject), escape(message));
    if let Some(s) = summary {
        text.push_str(&format!("\n\n> _Summary:_ {}", escape(s)));
    }
    text
}

#[async_trait::async_trait]
impl Provider for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, subject: &str, message: &str, summary: Option<&str>) -> Result<bool> {
        let body = serde_json::json!({ "text": render(subject, message, summary) });
        send_with_retry("Slack webhook", self.retries, || {
            self.client
                .post(&self.webhook_url)
                .timeout(self.timeout)
                .json(&body)
        })
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_escapes_and_quotes_summary() {
        let t = render("A & B", "x < y", Some("tl;dr"));
        assert_eq!(t, "*A &amp; B*\nx &lt; y\n\n> _Summary:_ tl;dr");
        assert_eq!(render("S", "M", None), "*S*\nM");
    }
}
