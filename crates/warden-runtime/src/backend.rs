use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use warden_schema::Extension;

/// Container record as stored by the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub extensions: BTreeMap<String, Extension>,
}

/// Where a new task's standard streams go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IoSpec {
    /// Inherit the caller's stdio.
    #[default]
    Stdio,
    Null,
    /// Append stdout and stderr to a file.
    Log(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Graceful termination (`SIGTERM`).
    Term,
    /// Forceful kill (`SIGKILL`).
    Kill,
}

impl Signal {
    pub fn as_raw(self) -> i32 {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Term => write!(f, "SIGTERM"),
            Signal::Kill => write!(f, "SIGKILL"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal.as_raw()),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Exit notification for one task. Receives exactly one status when the task
/// exits; disconnects without a value if the task record goes away first.
pub type ExitWatch = Receiver<ExitStatus>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOpts {
    /// Also remove the container's snapshot/rootfs storage.
    pub cleanup_snapshot: bool,
}

/// Entry point into a container runtime.
pub trait RuntimeClient: Send + Sync {
    fn name(&self) -> &str;

    fn load_container(&self, id: &str) -> Result<Arc<dyn Container>, RuntimeError>;

    fn containers(&self) -> Result<Vec<Arc<dyn Container>>, RuntimeError>;
}

/// Handle on one container record.
pub trait Container: Send + Sync {
    fn id(&self) -> &str;

    fn info(&self) -> Result<ContainerInfo, RuntimeError>;

    /// Current task, or `Ok(None)` when the container has none.
    fn task(&self) -> Result<Option<Arc<dyn Task>>, RuntimeError>;

    /// Create (but do not start) the container's task.
    fn new_task(&self, io: &IoSpec) -> Result<Arc<dyn Task>, RuntimeError>;

    /// Remove the container record. Fails if a task is still attached.
    fn delete(&self, opts: DeleteOpts) -> Result<(), RuntimeError>;
}

/// Running (or created) process of a container.
pub trait Task: Send + Sync {
    /// Id of the owning container.
    fn id(&self) -> &str;

    fn pid(&self) -> Option<u32>;

    fn start(&self) -> Result<(), RuntimeError>;

    /// Send `signal` to the task; with `all` set, to every process in its group.
    fn kill(&self, signal: Signal, all: bool) -> Result<(), RuntimeError>;

    /// Arm an exit notification. Must be called before signalling so the exit
    /// cannot be missed.
    fn wait(&self) -> Result<ExitWatch, RuntimeError>;

    /// Release the task. With `kill` set a still-running task is killed first;
    /// otherwise deleting a running task fails.
    fn delete(&self, kill: bool) -> Result<Option<ExitStatus>, RuntimeError>;
}

/// Runtime by name. `root` holds container records for runtimes that persist them.
pub fn select_runtime(name: &str, root: &Path) -> Result<Arc<dyn RuntimeClient>, RuntimeError> {
    match name {
        "process" => Ok(Arc::new(crate::process::ProcessRuntime::new(root))),
        "mock" => Ok(Arc::new(crate::mock::MockRuntime::new())),
        other => Err(RuntimeError::RuntimeUnavailable(other.to_owned())),
    }
}
