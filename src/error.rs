//! Error taxonomy shared by the pipeline components.
//!
//! Only [`ConfigError`] is fatal. Everything else is a steady-state
//! condition the polling loop survives.

use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the remote notification source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Bad credentials, or a session refresh that was rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Network or timeout failure before the remote answered.
    #[error("connection to remote source failed: {0}")]
    Connection(String),
    /// The remote answered, but not with something usable.
    #[error("remote source unavailable: {0}")]
    Unavailable(String),
    /// The remote signalled that the cached session token is no longer valid.
    #[error("session expired ({0})")]
    SessionExpired(String),
}

impl SourceError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Authentication(_) => "authentication",
            SourceError::Connection(_) => "connection",
            SourceError::Unavailable(_) => "unavailable",
            SourceError::SessionExpired(_) => "session_expired",
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SourceError::Unavailable(format!("unreadable response: {e}"))
        } else if e.is_status() {
            SourceError::Unavailable(e.to_string())
        } else {
            SourceError::Connection(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("state i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProviderConfigError {
    #[error("provider `{provider}` is missing required parameter `{param}`")]
    MissingParam { provider: String, param: String },
    #[error("provider `{provider}` has invalid parameter `{param}`: {reason}")]
    InvalidParam {
        provider: String,
        param: String,
        reason: String,
    },
    #[error("no provider named `{0}` is registered")]
    UnknownProvider(String),
}

/// A single provider's failed delivery attempt. Recorded, never propagated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderSendError {
    #[error("provider reported the message as not delivered")]
    Rejected,
    #[error("provider raised: {0}")]
    Raised(String),
    #[error("provider timed out after {0} ms")]
    TimedOut(u64),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("unterminated tag at byte {0}")]
    UnterminatedTag(usize),
    #[error("markup rendered to empty text")]
    EmptyRender,
}

#[derive(Debug, Error)]
pub enum SummarizationError {
    #[error("summarization timed out after {0} ms")]
    Timeout(u64),
    #[error("summarization rate limited")]
    RateLimited,
    #[error("summarization provider error: {0}")]
    Provider(String),
    #[error("summarization returned no text")]
    Empty,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: String, reason: String },
    #[error("setting `{key}` refers to unset environment variable `{var}`")]
    MissingEnv { key: String, var: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
