// src/transform/summarize.rs
//! Best-effort AI digests. Every failure mode collapses to "no summary".

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AiConfig;
use crate::error::SummarizationError;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String, SummarizationError>;
    fn name(&self) -> &'static str;
}

/// Run `summarizer` under `timeout`. Returns `None` on any error, logging why.
pub async fn summarize(
    summarizer: Option<&dyn Summarizer>,
    text: &str,
    timeout: Duration,
) -> Option<String> {
    let summarizer = summarizer?;
    if text.trim().is_empty() {
        return None;
    }
    let outcome = match tokio::time::timeout(timeout, summarizer.summarize(text)).await {
        Ok(res) => res,
        Err(_) => Err(SummarizationError::Timeout(timeout.as_millis() as u64)),
    };
    match outcome {
        Ok(s) => {
            debug!(provider = summarizer.name(), len = s.len(), "summary generated");
            Some(s)
        }
        Err(e) => {
            warn!(provider = summarizer.name(), error = %e, "summarization skipped");
            metrics::counter!("courier_summaries_failed_total").increment(1);
            None
        }
    }
}

/// Chat Completions client; works with any OpenAI-compatible endpoint.
pub struct OpenAiSummarizer {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiSummarizer {
    pub fn from_config(cfg: &AiConfig) -> Result<Self, SummarizationError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("moodle-courier/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| SummarizationError::Provider(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: cfg
                .endpoint
                .clone()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| OPENAI_CHAT_URL.to_string()),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            system_prompt: cfg.system_prompt.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        })
    }
}

#[async_trait::async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, SummarizationError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &self.system_prompt,
                },
                Msg {
                    role: "user",
                    content: text,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut builder = self.http.post(&self.endpoint).json(&req);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| SummarizationError::Provider(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SummarizationError::RateLimited);
        }
        if !status.is_success() {
            return Err(SummarizationError::Provider(format!("http {status}")));
        }
        let body: Resp = resp
            .json()
            .await
            .map_err(|e| SummarizationError::Provider(e.to_string()))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            Err(SummarizationError::Empty)
        } else {
            Ok(content)
        }
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Build the configured summarizer, or `None` when AI is disabled.
pub fn build_summarizer(cfg: &AiConfig) -> Option<Arc<dyn Summarizer>> {
    if !cfg.enabled {
        return None;
    }
    match OpenAiSummarizer::from_config(cfg) {
        Ok(s) => Some(Arc::new(s)),
        Err(e) => {
            warn!(error = %e, "could not build summarizer; summaries disabled");
            None
        }
    }
}

// --- Test helper ---

/// Returns a fixed digest after an optional delay, or a fixed error.
pub struct MockSummarizer {
    pub reply: Result<String, String>,
    pub delay: Duration,
}

impl MockSummarizer {
    pub fn fixed(s: &str) -> Self {
        Self {
            reply: Ok(s.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            reply: Err(reason.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub fn stalled(delay: Duration) -> Self {
        Self {
            reply: Ok("too late".to_string()),
            delay,
        }
    }
}

#[async_trait::async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, _text: &str) -> Result<String, SummarizationError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.clone().map_err(SummarizationError::Provider)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
