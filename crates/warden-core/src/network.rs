use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use warden_runtime::{Container, Task};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network '{network}' could not attach '{container}': {reason}")]
    Attach {
        network: String,
        container: String,
        reason: String,
    },
    #[error("network '{network}' could not detach '{container}': {reason}")]
    Detach {
        network: String,
        container: String,
        reason: String,
    },
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Attaches tasks to one named network.
///
/// Implementations are shared by every container on the network and must be
/// safe to call concurrently for different containers.
pub trait Network: Send + Sync {
    fn name(&self) -> &str;

    /// Attach the task's network namespace and return its address. An empty
    /// address means no interface was set up (e.g. host networking).
    fn create(&self, task: &dyn Task) -> Result<String, NetworkError>;

    fn remove(&self, container: &dyn Container) -> Result<(), NetworkError>;
}

/// Network binders by name, handed to the controller at construction.
#[derive(Clone, Default)]
pub struct Networks {
    by_name: BTreeMap<String, Arc<dyn Network>>,
}

impl Networks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the host network.
    pub fn with_host() -> Self {
        Self::new().with(Arc::new(HostNetwork))
    }

    #[must_use]
    pub fn with(mut self, network: Arc<dyn Network>) -> Self {
        self.insert(network);
        self
    }

    /// Add or replace the binder registered under `network.name()`.
    pub fn insert(&mut self, network: Arc<dyn Network>) {
        self.by_name.insert(network.name().to_owned(), network);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Network>> {
        self.by_name.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for Networks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.by_name.keys()).finish()
    }
}

/// Shares the host's network stack: nothing to attach, no address to report.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostNetwork;

impl Network for HostNetwork {
    fn name(&self) -> &'static str {
        "host"
    }

    fn create(&self, _task: &dyn Task) -> Result<String, NetworkError> {
        Ok(String::new())
    }

    fn remove(&self, _container: &dyn Container) -> Result<(), NetworkError> {
        Ok(())
    }
}
