//! Lifecycle reconciliation core for Warden containers.
//!
//! This crate turns a lifecycle intent into runtime operations. A `Change`
//! (`StopChange`, `StartChange`, `DeleteChange`) is bound to one container and
//! applied against a runtime client; it sequences the graceful terminator, the
//! configuration codec, the container's network binder, and the service
//! registrar so that every step is safe to retry after a partial failure.
//!
//! The engine does not serialize changes per container. Embedding drivers must
//! run at most one change per container at a time, for example by holding a
//! `ContainerLock` around `apply` (see `Controller::apply_exclusive`).

pub mod change;
pub mod concurrency;
pub mod context;
pub mod controller;
pub mod network;
pub mod registry;
pub mod terminate;

pub use change::{
    Change, ChangeKind, DeleteChange, StartChange, StopChange, STOP_MAINTENANCE_REASON,
};
pub use concurrency::{install_signal_handler, ContainerLock};
pub use context::Context;
pub use controller::{Controller, ControllerConfig};
pub use network::{HostNetwork, Network, NetworkError, Networks};
pub use registry::{MemoryRegistry, Registrar, RegistryEntry, RegistryError, RegistrySnapshot};
pub use terminate::{GracefulTerminator, Termination, DEFAULT_STOP_TIMEOUT};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Decode(#[from] warden_schema::DecodeError),
    #[error("runtime error: {0}")]
    Runtime(#[from] warden_runtime::RuntimeError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("container id '{0}' is not a valid state directory name")]
    InvalidContainerId(String),
    #[error("no network binder named '{0}'")]
    UnknownNetwork(String),
    #[error("task for container '{id}' still alive {waited:?} after SIGKILL")]
    Unkillable { id: String, waited: Duration },
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("controller config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
