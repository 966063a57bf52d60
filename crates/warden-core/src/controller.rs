use crate::change::{Change, ChangeKind, DeleteChange, StartChange, StopChange};
use crate::concurrency::{ContainerLock, LOCK_DIR};
use crate::context::Context;
use crate::network::{Network, Networks};
use crate::registry::Registrar;
use crate::terminate::GracefulTerminator;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use warden_runtime::{Container, RuntimeClient};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Per-container state directories live under here, one per container id.
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    /// Patience after each termination signal.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_state_root() -> PathBuf {
    PathBuf::from("/var/lib/warden")
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl ControllerConfig {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, CoreError> {
        toml::from_str(input).map_err(|e| CoreError::Config(format!("invalid config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// `id` as exactly one normal path component.
pub(crate) fn state_dir_name(id: &str) -> Result<&str, CoreError> {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name.len() == id.len() && id != LOCK_DIR => {
            Ok(id)
        }
        _ => Err(CoreError::InvalidContainerId(id.to_owned())),
    }
}

/// Holds the collaborators shared by every change: network binders, the
/// service registrar, and the termination policy.
pub struct Controller {
    config: ControllerConfig,
    networks: Networks,
    registrar: Arc<dyn Registrar>,
    terminator: GracefulTerminator,
}

impl Controller {
    pub fn new(config: ControllerConfig, networks: Networks, registrar: Arc<dyn Registrar>) -> Self {
        let terminator = GracefulTerminator::new(config.stop_timeout());
        Self {
            config,
            networks,
            registrar,
            terminator,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registrar(&self) -> &dyn Registrar {
        self.registrar.as_ref()
    }

    pub fn terminator(&self) -> &GracefulTerminator {
        &self.terminator
    }

    pub fn network(&self, name: &str) -> Result<Arc<dyn Network>, CoreError> {
        self.networks
            .get(name)
            .ok_or_else(|| CoreError::UnknownNetwork(name.to_owned()))
    }

    /// Per-container state directory. Fails for ids that would resolve
    /// outside the state root or onto the lock directory.
    pub fn state_dir(&self, id: &str) -> Result<PathBuf, CoreError> {
        Ok(self.config.state_root.join(state_dir_name(id)?))
    }

    pub fn stop(self: &Arc<Self>, container: Arc<dyn Container>) -> StopChange {
        StopChange::new(container, Arc::clone(self))
    }

    pub fn start(self: &Arc<Self>, container: Arc<dyn Container>) -> StartChange {
        StartChange::new(container, Arc::clone(self))
    }

    pub fn delete(self: &Arc<Self>, container: Arc<dyn Container>) -> DeleteChange {
        DeleteChange::new(container, Arc::clone(self))
    }

    pub fn change(self: &Arc<Self>, kind: ChangeKind, container: Arc<dyn Container>) -> Box<dyn Change> {
        match kind {
            ChangeKind::Stop => Box::new(self.stop(container)),
            ChangeKind::Start => Box::new(self.start(container)),
            ChangeKind::Delete => Box::new(self.delete(container)),
        }
    }

    /// Apply `change` while holding the container's lock, so concurrent
    /// drivers cannot interleave two changes on the same container.
    pub fn apply_exclusive(
        &self,
        ctx: &Context,
        client: &dyn RuntimeClient,
        change: &dyn Change,
    ) -> Result<(), CoreError> {
        let _lock = ContainerLock::acquire(&self.config.state_root, change.container_id())?;
        debug!(
            "holding lock for {} while applying {}",
            change.container_id(),
            change.kind()
        );
        change.apply(ctx, client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HostNetwork;
    use crate::registry::MemoryRegistry;

    #[test]
    fn config_defaults() {
        let config = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(config.state_root, PathBuf::from("/var/lib/warden"));
        assert_eq!(config.stop_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/warden.toml");
        let config = ControllerConfig::new(dir.path().join("state"))
            .with_stop_timeout(Duration::from_millis(250));
        config.save(&path).unwrap();
        assert_eq!(ControllerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn config_rejects_unknown_keys() {
        assert!(matches!(
            ControllerConfig::from_toml_str("stop_grace = 3"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn unknown_network_is_an_error() {
        let controller = Controller::new(
            ControllerConfig::default(),
            Networks::new().with(Arc::new(HostNetwork)),
            Arc::new(MemoryRegistry::new()),
        );
        assert!(controller.network("host").is_ok());
        assert!(matches!(
            controller.network("bridge0"),
            Err(CoreError::UnknownNetwork(name)) if name == "bridge0"
        ));
    }

    #[test]
    fn terminator_uses_configured_timeout() {
        let controller = Controller::new(
            ControllerConfig::default().with_stop_timeout(Duration::from_millis(300)),
            Networks::with_host(),
            Arc::new(MemoryRegistry::new()),
        );
        assert_eq!(
            controller.terminator().patience(),
            Duration::from_millis(300)
        );
        assert_eq!(
            controller.state_dir("web1").unwrap(),
            PathBuf::from("/var/lib/warden/web1")
        );
    }

    #[test]
    fn state_dir_stays_under_state_root() {
        let controller = Controller::new(
            ControllerConfig::default(),
            Networks::with_host(),
            Arc::new(MemoryRegistry::new()),
        );
        for id in ["", ".", "..", ".locks", "a/b", "../web1", "/etc", "web1/"] {
            assert!(
                matches!(controller.state_dir(id), Err(CoreError::InvalidContainerId(_))),
                "accepted {id:?}"
            );
        }
        assert!(controller.state_dir("web-1.blue").is_ok());
    }
}
