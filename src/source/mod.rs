// src/source/mod.rs
//! Remote notification source: the item type and the fetch contract.

pub mod moodle;
pub mod session;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

pub use moodle::MoodleClient;

/// Source-assigned identifier. Moodle uses increasing integers.
pub type NotificationId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub subject: String,
    /// Original HTML as delivered by the source.
    pub raw_body: String,
    /// Filled in by the transformer.
    #[serde(default)]
    pub normalized_body: Option<String>,
    /// Optional AI digest, filled in by the transformer.
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub course_id: Option<i64>,
    /// When the pipeline observed the item.
    pub received_at: DateTime<Utc>,
    /// Creation time reported by the source, if any.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context_url: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    /// Account that triggered the notification; negative ids are system senders.
    #[serde(default)]
    pub sender_id: Option<i64>,
}

impl Notification {
    pub fn new(id: NotificationId, subject: impl Into<String>, raw_body: impl Into<String>) -> Self {
        Self {
            id,
            subject: subject.into(),
            raw_body: raw_body.into(),
            normalized_body: None,
            summary: None,
            course_id: None,
            received_at: Utc::now(),
            created_at: None,
            context_url: None,
            component: None,
            event_type: None,
            sender_id: None,
        }
    }

    pub fn with_course(mut self, course_id: i64) -> Self {
        self.course_id = Some(course_id);
        self
    }

    /// Synthetic item used by the `test-notification` command.
    pub fn test_message() -> Self {
        Self::new(
            0,
            "Moodle Courier Test Notification",
            "<p>This is a test notification from <strong>Moodle Courier</strong>. \
             If you received this, your notification providers are configured correctly!</p>",
        )
    }
}

/// Fetch contract for the remote source.
#[async_trait::async_trait]
pub trait NotificationSource: Send + Sync {
    /// Current notification list for the configured account, newest first.
    /// No filtering or deduplication happens here.
    async fn fetch_notifications(&self) -> Result<Vec<Notification>, SourceError>;
    fn name(&self) -> &'static str;
}

// --- Test helper ---

/// Replays queued fetch results in order; once drained, returns empty batches.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<Notification>, SourceError>>>,
    calls: Mutex<usize>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
        }
    }

    pub fn push_batch(&self, batch: Vec<Notification>) {
        self.script.lock().push_back(Ok(batch));
    }

    pub fn push_error(&self, err: SourceError) {
        self.script.lock().push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NotificationSource for ScriptedSource {
    async fn fetch_notifications(&self) -> Result<Vec<Notification>, SourceError> {
        *self.calls.lock() += 1;
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
