// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod metrics;
pub mod notify;
pub mod persist;
pub mod pipeline;
pub mod source;
pub mod state;
pub mod transform;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::Settings;
pub use crate::notify::{Dispatcher, Provider, Registry};
pub use crate::pipeline::{Pipeline, PipelineConfig, Shutdown};
pub use crate::source::{Notification, NotificationSource};
pub use crate::state::{PipelineState, StateStore};
