// src/state.rs
//! Durable pipeline progress: the dedup watermark, a bounded history and the
//! consecutive-failure counter.
//!
//! Invariant: every notification with `id <= last_notification_id` has been
//! dispatched or deliberately skipped. The watermark only moves forward.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::StateSettings;
use crate::error::StateError;
use crate::persist::{sibling, write_atomic};
use crate::source::NotificationId;

const STATE_VERSION: u32 = 1;

fn state_version() -> u32 {
    STATE_VERSION
}

/// What to do when the state file exists but cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptStatePolicy {
    /// Refuse to start.
    #[default]
    Fail,
    /// Move the bad file aside and start as a first run.
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub id: NotificationId,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    /// Body as delivered to providers.
    pub message: String,
    #[serde(default)]
    pub summary: Option<String>,
    /// Providers that accepted the message.
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub course_id: Option<i64>,
    #[serde(default)]
    pub context_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineState {
    #[serde(default = "state_version")]
    pub version: u32,
    pub last_notification_id: Option<NotificationId>,
    /// Most recent first.
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
    #[serde(default)]
    pub consecutive_failure_count: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_notification_id: None,
            history: VecDeque::new(),
            consecutive_failure_count: 0,
            updated_at: None,
        }
    }
}

impl PipelineState {
    /// Same-id repeats count as seen.
    pub fn is_seen(&self, id: NotificationId) -> bool {
        self.last_notification_id.is_some_and(|last| id <= last)
    }

    /// Move the watermark to `id` if it is strictly newer. Returns whether it moved.
    pub fn advance(&mut self, id: NotificationId) -> bool {
        if self.is_seen(id) {
            return false;
        }
        self.last_notification_id = Some(id);
        true
    }
}

/// Result of opening the store at startup.
#[derive(Debug)]
pub struct LoadedState {
    pub state: PipelineState,
    /// No usable state existed; the pipeline must seed instead of replaying the backlog.
    pub first_run: bool,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    history_capacity: usize,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, history_capacity: usize) -> Self {
        Self {
            path: path.into(),
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn from_settings(settings: &StateSettings) -> Self {
        Self::new(settings.path.clone(), settings.history_size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    /// `Ok(None)` when no state has ever been written.
    pub fn load(&self) -> Result<Option<PipelineState>, StateError> {
        let raw = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let mut state: PipelineState =
            serde_json::from_slice(&raw).map_err(|e| StateError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if state.version > STATE_VERSION {
            return Err(StateError::Corrupt {
                path: self.path.clone(),
                reason: format!("written by a newer version ({})", state.version),
            });
        }
        state.history.truncate(self.history_capacity);
        Ok(Some(state))
    }

    /// Atomic replace: a crash mid-save keeps the previous valid file.
    pub fn save(&self, state: &PipelineState) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| StateError::Io {
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        write_atomic(&self.path, &bytes).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Prepend to the bounded history and advance the watermark.
    pub fn record(&self, state: &mut PipelineState, entry: HistoryEntry) {
        if state.is_seen(entry.id) {
            warn!(
                id = entry.id,
                last = ?state.last_notification_id,
                "recording an id at or below the watermark"
            );
        }
        state.advance(entry.id);
        state.history.push_front(entry);
        state.history.truncate(self.history_capacity);
    }

    /// Load at startup, applying `policy` to an unreadable file.
    pub fn open(&self, policy: CorruptStatePolicy) -> Result<LoadedState, StateError> {
        match self.load() {
            Ok(Some(state)) => {
                info!(
                    path = %self.path.display(),
                    last_id = ?state.last_notification_id,
                    history = state.history.len(),
                    "loaded pipeline state"
                );
                let first_run = state.last_notification_id.is_none();
                Ok(LoadedState { state, first_run })
            }
            Ok(None) => {
                info!(path = %self.path.display(), "no state file; starting fresh");
                Ok(LoadedState {
                    state: PipelineState::default(),
                    first_run: true,
                })
            }
            Err(e @ StateError::Corrupt { .. }) => match policy {
                CorruptStatePolicy::Fail => Err(e),
                CorruptStatePolicy::Reset => {
                    let backup = sibling(&self.path, ".corrupt");
                    error!(error = %e, backup = %backup.display(), "state unreadable; resetting to first run");
                    if let Err(err) = fs::rename(&self.path, &backup) {
                        warn!(error = %err, "could not move corrupt state aside");
                    }
                    Ok(LoadedState {
                        state: PipelineState::default(),
                        first_run: true,
                    })
                }
            },
            Err(e) => Err(e),
        }
    }
}
