//! Runtime task adapter for Warden containers.
//!
//! The lifecycle engine never talks to a container runtime directly; it goes
//! through the `RuntimeClient`, `Container`, and `Task` traits defined here.
//! Two implementations ship with the crate: `MockRuntime`, an in-memory runtime
//! with fault injection used to exercise partial-failure paths, and
//! `ProcessRuntime`, which runs each task as a host process group.

pub mod backend;
pub mod mock;
pub mod process;

pub use backend::{
    select_runtime, Container, ContainerInfo, DeleteOpts, ExitStatus, ExitWatch, IoSpec,
    RuntimeClient, Signal, Task,
};
pub use mock::{MockEvent, MockFaults, MockRuntime, MockTaskStatus};
pub use process::ProcessRuntime;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime '{0}' is not available on this system")]
    RuntimeUnavailable(String),
    #[error("container '{0}' not found")]
    ContainerNotFound(String),
    #[error("container '{0}' already exists")]
    ContainerExists(String),
    #[error("no task for container '{0}'")]
    TaskNotFound(String),
    #[error("container '{0}' already has a task")]
    TaskExists(String),
    #[error("task for container '{0}' is not running")]
    NotRunning(String),
    #[error("task for container '{0}' is still running")]
    StillRunning(String),
    #[error("failed to signal task '{id}' with {signal}: {reason}")]
    SignalFailed {
        id: String,
        signal: Signal,
        reason: String,
    },
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("container record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}
