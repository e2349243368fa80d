// src/notify/ntfy.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;

use super::registry::{ParamSpec, ProviderDescriptor, ProviderParams};
use super::{send_with_retry, Provider};
use crate::error::ProviderConfigError;

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required("topic", "ntfy topic name"),
    ParamSpec::optional("server", Some("https://ntfy.sh"), "ntfy server base URL"),
    ParamSpec::optional("token", None, "Access token for protected topics").secret(),
    ParamSpec::optional("priority", Some("default"), "min | low | default | high | urgent"),
    ParamSpec::optional("timeout_secs", Some("4"), "HTTP timeout per attempt"),
];

const PRIORITIES: &[&str] = &["min", "low", "default", "high", "urgent"];

pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        name: "ntfy",
        description: "Publishes to an ntfy topic",
        params: PARAMS,
        build,
    }
}

fn build(p: &ProviderParams) -> Result<Arc<dyn Provider>, ProviderConfigError> {
    let topic = p.require("topic")?.trim_matches('/');
    let server = p.get("server").unwrap_or("https://ntfy.sh").trim_end_matches('/');
    let priority = p.get("priority").unwrap_or("default").to_ascii_lowercase();
    if !PRIORITIES.contains(&priority.as_str()) {
        return Err(p.invalid("priority", format!("expected one of {}", PRIORITIES.join(", "))));
    }
    Ok(Arc::new(NtfyNotifier {
        url: format!("{server}/{topic}"),
        token: p.get("token").map(str::to_string),
        priority,
        client: Client::new(),
        timeout: Duration::from_secs(p.u64_or("timeout_secs", 4)?.max(1)),
    }))
}

pub struct NtfyNotifier {
    url: String,
    token: Option<String>,
    priority: String,
    client: Client,
    timeout: Duration,
}

fn body(message: &str, summary: Option<&str>) -> String {
    match summary {
        Some(s) => format!("{s}\n\n---\n\n{message}"),
        None => message.to_string(),
    }
}

/// Header values must be visible ASCII.
fn header_safe(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .collect()
}

#[async_trait::async_trait]
impl Provider for NtfyNotifier {
    fn name(&self) -> &str {
        "ntfy"
    }

    async fn send(&self, subject: &str, message: &str, summary: Option<&str>) -> Result<bool> {
        let text = body(message, summary);
        let title = header_safe(subject);
        send_with_retry("ntfy", 2, || {
            let req = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .header("Title", title.as_str())
                .header("Priority", self.priority.as_str())
                .header("Markdown", "yes")
                .body(text.clone());
            match &self.token {
                Some(t) => req.bearer_auth(t),
                None => req,
            }
        })
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_goes_first() {
        assert_eq!(body("full", Some("short")), "short\n\n---\n\nfull");
        assert_eq!(body("full", None), "full");
    }

    #[test]
    fn titles_are_header_safe() {
        assert_eq!(header_safe("Note é\n"), "Note ??");
    }

    #[test]
    fn bad_priority_is_rejected() {
        let p = ProviderParams::new("ntfy", [("topic", "t"), ("priority", "loud")]);
        assert!(build(&p).is_err());
    }
}
