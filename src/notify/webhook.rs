// src/notify/webhook.rs
//! Generic JSON webhook: `{"subject", "message", "summary", "source", "sent_at"}`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;

use super::registry::{ParamSpec, ProviderDescriptor, ProviderParams};
use super::{send_with_retry, Provider};
use crate::error::ProviderConfigError;

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required("url", "Endpoint receiving the JSON POST"),
    ParamSpec::optional("authorization", None, "Value for the Authorization header").secret(),
    ParamSpec::optional("timeout_secs", Some("4"), "HTTP timeout per attempt"),
    ParamSpec::optional("retries", Some("3"), "Attempts before giving up"),
];

pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        name: "webhook",
        description: "POSTs each notification as JSON to a URL",
        params: PARAMS,
        build,
    }
}

fn build(p: &ProviderParams) -> Result<Arc<dyn Provider>, ProviderConfigError> {
    let url = p.require("url")?;
    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(p.invalid("url", "must be an http(s) URL"));
    }
    let retries = u8::try_from(p.u64_or("retries", 3)?).map_err(|_| p.invalid("retries", "too large"))?;
    Ok(Arc::new(WebhookNotifier {
        url: url.to_string(),
        authorization: p.get("authorization").map(str::to_string),
        client: Client::new(),
        timeout: Duration::from_secs(p.u64_or("timeout_secs", 4)?.max(1)),
        retries,
    }))
}

pub struct WebhookNotifier {
    url: String,
    authorization: Option<String>,
    client: Client,
    timeout: Duration,
    retries: u8,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    subject: &'a str,
    message: &'a str,
    summary: Option<&'a str>,
    source: &'static str,
    sent_at: String,
}

#[async_trait::async_trait]
impl Provider for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, subject: &str, message: &str, summary: Option<&str>) -> Result<bool> {
        let body = WebhookBody {
            subject,
            message,
            summary,
            source: "moodle-courier",
            sent_at: Utc::now().to_rfc3339(),
        };
        send_with_retry("webhook", self.retries, || {
            let req = self.client.post(&self.url).timeout(self.timeout).json(&body);
            match &self.authorization {
                Some(auth) => req.header(reqwest::header::AUTHORIZATION, auth),
                None => req,
            }
        })
        .await?;
        Ok(true)
    }
}
