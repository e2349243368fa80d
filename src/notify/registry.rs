// src/notify/registry.rs
//! Static registry of provider factories.
//!
//! Each descriptor declares its parameters (required/optional, default,
//! secret). `[providers.<name>]` sections are resolved against those
//! declarations; a provider that fails to resolve is reported on its own and
//! never blocks the others.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::{discord, email, log, ntfy, slack, webhook, Provider};
use crate::config::{env_reference, ProviderSection};
use crate::error::ProviderConfigError;

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub required: bool,
    pub default: Option<&'static str>,
    /// Never printed in listings or logs.
    pub secret: bool,
    pub help: &'static str,
}

impl ParamSpec {
    pub const fn required(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            required: true,
            default: None,
            secret: false,
            help,
        }
    }

    pub const fn optional(name: &'static str, default: Option<&'static str>, help: &'static str) -> Self {
        Self {
            name,
            required: false,
            default,
            secret: false,
            help,
        }
    }

    pub const fn secret(self) -> Self {
        Self {
            secret: true,
            ..self
        }
    }
}

pub type BuildFn = fn(&ProviderParams) -> Result<Arc<dyn Provider>, ProviderConfigError>;

#[derive(Clone)]
pub struct ProviderDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    pub build: BuildFn,
}

impl std::fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Parameters for one provider after defaults were applied.
#[derive(Clone, Default)]
pub struct ProviderParams {
    provider: String,
    values: BTreeMap<String, String>,
}

impl std::fmt::Debug for ProviderParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderParams")
            .field("provider", &self.provider)
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderParams {
    pub fn new<I, K, V>(provider: &str, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            provider: provider.to_string(),
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str, ProviderConfigError> {
        self.get(key).ok_or_else(|| ProviderConfigError::MissingParam {
            provider: self.provider.clone(),
            param: key.to_string(),
        })
    }

    pub fn u64_or(&self, key: &str, fallback: u64) -> Result<u64, ProviderConfigError> {
        match self.get(key) {
            None => Ok(fallback),
            Some(v) => v.trim().parse().map_err(|_| self.invalid(key, "expected an integer")),
        }
    }

    pub fn bool_or(&self, key: &str, fallback: bool) -> Result<bool, ProviderConfigError> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(fallback),
            Some(v) => match v.as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                _ => Err(self.invalid(key, "expected a boolean")),
            },
        }
    }

    /// Comma-separated list, trimmed, empties dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn invalid(&self, key: &str, reason: impl Into<String>) -> ProviderConfigError {
        ProviderConfigError::InvalidParam {
            provider: self.provider.clone(),
            param: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Providers that loaded, plus the ones that did not and why.
#[derive(Default)]
pub struct LoadReport {
    pub providers: Vec<Arc<dyn Provider>>,
    pub errors: Vec<ProviderConfigError>,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    descriptors: BTreeMap<&'static str, ProviderDescriptor>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// All providers shipped with the crate.
    pub fn builtin() -> Self {
        let mut r = Self::empty();
        r.register(discord::descriptor());
        r.register(slack::descriptor());
        r.register(webhook::descriptor());
        r.register(ntfy::descriptor());
        r.register(email::descriptor());
        r.register(log::descriptor());
        r
    }

    /// Later registrations replace earlier ones with the same name.
    pub fn register(&mut self, descriptor: ProviderDescriptor) {
        self.descriptors.insert(descriptor.name, descriptor);
    }

    /// Every registered descriptor, sorted by name.
    pub fn discover(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.descriptors.values()
    }

    pub fn descriptor(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.descriptors.get(name)
    }

    /// Apply declared defaults, resolve `env:` references from the process
    /// environment and check required parameters.
    pub fn resolve(
        &self,
        descriptor: &ProviderDescriptor,
        section: &ProviderSection,
    ) -> Result<ProviderParams, ProviderConfigError> {
        self.resolve_with(descriptor, section, &process_env)
    }

    pub fn resolve_with(
        &self,
        descriptor: &ProviderDescriptor,
        section: &ProviderSection,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<ProviderParams, ProviderConfigError> {
        for key in section.params.keys() {
            if !descriptor.params.iter().any(|p| p.name == key.as_str()) {
                warn!(provider = descriptor.name, param = %key, "ignoring undeclared provider parameter");
            }
        }

        let invalid = |param: &str, reason: String| ProviderConfigError::InvalidParam {
            provider: descriptor.name.to_string(),
            param: param.to_string(),
            reason,
        };
        let text = |param: &str, raw: &str| -> Result<String, ProviderConfigError> {
            match env_reference(raw) {
                None => Ok(raw.to_string()),
                Some(var) => lookup(var).ok_or_else(|| {
                    invalid(param, format!("environment variable `{var}` is not set"))
                }),
            }
        };

        let mut values = BTreeMap::new();
        for spec in descriptor.params {
            let configured = match section.params.get(spec.name) {
                None => None,
                Some(toml::Value::String(s)) => Some(text(spec.name, s.as_str())?),
                Some(toml::Value::Array(items)) => Some(
                    items
                        .iter()
                        .map(|v| match v {
                            toml::Value::String(s) => text(spec.name, s.as_str()),
                            other => Ok(other.to_string()),
                        })
                        .collect::<Result<Vec<_>, _>>()?
                        .join(","),
                ),
                Some(toml::Value::Table(_)) => {
                    return Err(invalid(spec.name, "tables are not supported".into()))
                }
                Some(other) => Some(other.to_string()),
            };
            let value = configured
                .filter(|v| !v.trim().is_empty())
                .or_else(|| spec.default.map(str::to_string));
            match value {
                Some(v) => {
                    values.insert(spec.name.to_string(), v);
                }
                None if spec.required => {
                    return Err(ProviderConfigError::MissingParam {
                        provider: descriptor.name.to_string(),
                        param: spec.name.to_string(),
                    })
                }
                None => {}
            }
        }
        Ok(ProviderParams {
            provider: descriptor.name.to_string(),
            values,
        })
    }

    pub fn instantiate(
        &self,
        name: &str,
        section: &ProviderSection,
    ) -> Result<Arc<dyn Provider>, ProviderConfigError> {
        self.instantiate_with(name, section, &process_env)
    }

    pub fn instantiate_with(
        &self,
        name: &str,
        section: &ProviderSection,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Arc<dyn Provider>, ProviderConfigError> {
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| ProviderConfigError::UnknownProvider(name.to_string()))?;
        let params = self.resolve_with(descriptor, section, lookup)?;
        (descriptor.build)(&params)
    }

    /// Instantiate every enabled section. Failures are collected per provider.
    pub fn load_enabled(&self, sections: &BTreeMap<String, ProviderSection>) -> LoadReport {
        self.load_enabled_with(sections, &process_env)
    }

    /// Disabled sections are skipped before any `env:` reference is looked up.
    pub fn load_enabled_with(
        &self,
        sections: &BTreeMap<String, ProviderSection>,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> LoadReport {
        let mut report = LoadReport::default();
        for (name, section) in sections {
            if !section.enabled {
                continue;
            }
            match self.instantiate_with(name, section, lookup) {
                Ok(p) => {
                    info!(provider = %name, "provider enabled");
                    report.providers.push(p);
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "provider not loaded");
                    report.errors.push(e);
                }
            }
        }
        report
    }
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
