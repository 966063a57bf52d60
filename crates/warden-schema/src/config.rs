use crate::types::{ContainerId, NetworkName};
use crate::DecodeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Self-describing configuration attached to every container record.
///
/// The engine only reads `id`, `network`, and `services`; the remaining fields
/// describe the workload for whoever created the container and are carried
/// through untouched.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    pub id: ContainerId,
    pub network: NetworkName,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceDef {
    pub port: u16,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<HealthCheck>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Http,
    Tcp,
    Grpc,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HealthCheck {
    #[serde(rename = "type")]
    pub kind: CheckKind,
    #[serde(default = "default_check_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
    /// Path or full URL for `http` checks; ignored by the other kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn default_check_interval() -> u64 {
    10
}

fn default_check_timeout() -> u64 {
    5
}

impl Configuration {
    pub fn new(id: impl Into<ContainerId>, network: impl Into<NetworkName>) -> Self {
        Self {
            id: id.into(),
            network: network.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_service(mut self, name: &str, def: ServiceDef) -> Self {
        self.services.insert(name.to_owned(), def);
        self
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.id.is_empty() {
            return Err(DecodeError::Invalid("id must not be empty".to_owned()));
        }
        if self.network.is_empty() {
            return Err(DecodeError::Invalid(format!(
                "container '{}' does not name a network",
                self.id
            )));
        }
        if let Some(name) = self.services.keys().find(|name| name.trim().is_empty()) {
            return Err(DecodeError::Invalid(format!(
                "container '{}' has a service with an empty name ('{name}')",
                self.id
            )));
        }
        for (name, def) in &self.services {
            if let Some(check) = &def.check {
                if check.kind == CheckKind::Http && check.url.is_none() {
                    return Err(DecodeError::Invalid(format!(
                        "service '{name}': http check requires a url"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl ServiceDef {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}

/// Parse a hand-written TOML configuration, as authored by operators before
/// it is attached to a container record.
pub fn parse_config_str(input: &str) -> Result<Configuration, DecodeError> {
    let config: Configuration = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<Configuration, DecodeError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
