//! Container configuration codec for Warden.
//!
//! This crate defines the schema layer: the `Configuration` a container carries
//! (its network, identity, and named service definitions), the `Extension`
//! envelope under which that configuration travels in the runtime's container
//! metadata, and the decode path the lifecycle engine uses to recover it.

pub mod config;
pub mod extension;
pub mod types;

pub use config::{
    parse_config_file, parse_config_str, CheckKind, Configuration, HealthCheck, ServiceDef,
};
pub use extension::{decode_config, encode_config, Extension, CONFIG_EXTENSION, CONFIG_TYPE_URL};
pub use types::{ContainerId, NetworkName};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("container '{0}' carries no configuration extension")]
    MissingExtension(String),
    #[error("configuration extension has type '{actual}', expected '{expected}'")]
    TypeMismatch { expected: String, actual: String },
    #[error("malformed configuration payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration id '{config}' does not match container '{container}'")]
    IdMismatch { container: String, config: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
