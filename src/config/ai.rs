// src/config/ai.rs
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    150
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_system_prompt() -> String {
    "Summarize the message concisely with appropriate emojis, excluding links. \
     Write in the language of the notification."
        .to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Only "openai" (or any OpenAI-compatible endpoint) is supported.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Usually `env:OPENAI_API_KEY`. May be empty for keyless local endpoints.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Overrides the chat completions URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Hard cap on a single summarization call, independent of provider timeouts.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            api_key: String::new(),
            model: default_model(),
            endpoint: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiConfig")
            .field("enabled", &self.enabled)
            .field("provider", &self.provider)
            .field("api_key_len", &self.api_key.len())
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl AiConfig {
    /// Normalize provider name and clamp numeric knobs into their usable range.
    pub(crate) fn sanitize(&mut self) -> Result<(), ConfigError> {
        self.provider = self.provider.trim().to_lowercase();
        if self.enabled && self.provider != "openai" {
            return Err(ConfigError::invalid(
                "ai.provider",
                format!("unsupported provider `{}`", self.provider),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            self.temperature = default_temperature();
        }
        if self.max_tokens == 0 {
            self.max_tokens = default_max_tokens();
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = default_timeout_secs();
        }
        if self.enabled && self.api_key.trim().is_empty() {
            tracing::warn!(
                "AI enabled without API key; only valid for endpoints that do not require one"
            );
        }
        Ok(())
    }
}
