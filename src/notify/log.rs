// src/notify/log.rs
//! Writes deliveries to the tracing log. Useful for dry runs and as a health target.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use super::registry::{ParamSpec, ProviderDescriptor, ProviderParams};
use super::Provider;
use crate::error::ProviderConfigError;

const PARAMS: &[ParamSpec] = &[
    ParamSpec::optional("level", Some("info"), "info | warn"),
    ParamSpec::optional("include_body", Some("false"), "Log the full message, not just its length"),
];

pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        name: "log",
        description: "Logs each notification instead of delivering it",
        params: PARAMS,
        build,
    }
}

fn build(p: &ProviderParams) -> Result<Arc<dyn Provider>, ProviderConfigError> {
    let warn_level = match p.get("level").unwrap_or("info").to_ascii_lowercase().as_str() {
        "info" => false,
        "warn" => true,
        _ => return Err(p.invalid("level", "expected info or warn")),
    };
    Ok(Arc::new(LogNotifier {
        warn_level,
        include_body: p.bool_or("include_body", false)?,
    }))
}

pub struct LogNotifier {
    warn_level: bool,
    include_body: bool,
}

#[async_trait::async_trait]
impl Provider for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, subject: &str, message: &str, summary: Option<&str>) -> Result<bool> {
        let body = if self.include_body { message } else { "" };
        if self.warn_level {
            warn!(target: "moodle_courier::delivery", %subject, len = message.len(), summary = ?summary, body, "notification");
        } else {
            info!(target: "moodle_courier::delivery", %subject, len = message.len(), summary = ?summary, body, "notification");
        }
        Ok(true)
    }
}
