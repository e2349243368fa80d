// src/notify/discord.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use serde::Serialize;

use super::registry::{ParamSpec, ProviderDescriptor, ProviderParams};
use super::{clip, send_with_retry, Provider};
use crate::error::ProviderConfigError;

// Discord embed limits.
const TITLE_MAX: usize = 256;
const DESCRIPTION_MAX: usize = 4096;
const FIELD_MAX: usize = 1024;
const EMBED_COLOR: u32 = 0xF98012;

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required("webhook_url", "Discord channel webhook URL").secret(),
    ParamSpec::optional("username", Some("Moodle"), "Display name for the webhook"),
    ParamSpec::optional("timeout_secs", Some("4"), "HTTP timeout per attempt"),
    ParamSpec::optional("retries", Some("3"), "Attempts before giving up"),
];

pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        name: "discord",
        description: "Posts an embed to a Discord webhook",
        params: PARAMS,
        build,
    }
}

fn build(p: &ProviderParams) -> Result<Arc<dyn Provider>, ProviderConfigError> {
    let webhook = p.require("webhook_url")?.to_string();
    if !webhook.starts_with("https://") && !webhook.starts_with("http://") {
        return Err(p.invalid("webhook_url", "must be an http(s) URL"));
    }
    let retries = u8::try_from(p.u64_or("retries", 3)?).map_err(|_| p.invalid("retries", "too large"))?;
    Ok(Arc::new(
        DiscordNotifier::new(webhook)
            .with_username(p.get("username").map(str::to_string))
            .with_timeout(p.u64_or("timeout_secs", 4)?)
            .with_retries(retries),
    ))
}

#[derive(Clone)]
pub struct DiscordNotifier {
    webhook: String,
    username: Option<String>,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl DiscordNotifier {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            username: None,
            client: Client::new(),
            timeout: Duration::from_secs(4),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs.max(1));
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }
}

#[async_trait::async_trait]
impl Provider for DiscordNotifier {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, subject: &str, message: &str, summary: Option<&str>) -> Result<bool> {
        let payload = DiscordWebhookPayload::new(self.username.clone(), subject, message, summary);
        send_with_retry("Discord webhook", self.max_retries, || {
            self.client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(&payload)
        })
        .await?;
        Ok(true)
    }
}

#[derive(Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<DiscordField>,
}

#[derive(Serialize)]
struct DiscordWebhookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn new(username: Option<String>, subject: &str, message: &str, summary: Option<&str>) -> Self {
        let fields = summary
            .map(|s| DiscordField {
                name: "Summary".to_string(),
                value: clip(s, FIELD_MAX),
                inline: false,
            })
            .into_iter()
            .collect();
        Self {
            username,
            content: None,
            embeds: vec![DiscordEmbed {
                title: clip(subject, TITLE_MAX),
                description: clip(message, DESCRIPTION_MAX),
                color: EMBED_COLOR,
                fields,
            }],
        }
    }
}
