use super::{load_config, Change, ChangeKind};
use crate::context::Context;
use crate::controller::Controller;
use crate::CoreError;
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::{error, info};
use warden_runtime::{Container, DeleteOpts, RuntimeClient};

/// Remove everything a container owns: state directory, registrations,
/// network attachment, and finally the runtime record itself.
///
/// The task must already be stopped. Deleting the record fails while a task
/// is attached, which surfaces a missing stop instead of killing the task.
pub struct DeleteChange {
    container: Arc<dyn Container>,
    controller: Arc<Controller>,
}

impl DeleteChange {
    pub fn new(container: Arc<dyn Container>, controller: Arc<Controller>) -> Self {
        Self {
            container,
            controller,
        }
    }
}

impl Change for DeleteChange {
    fn kind(&self) -> ChangeKind {
        ChangeKind::Delete
    }

    fn container_id(&self) -> &str {
        self.container.id()
    }

    fn apply(&self, ctx: &Context, _client: &dyn RuntimeClient) -> Result<(), CoreError> {
        ctx.check()?;
        let id = self.container.id();
        info!("deleting container {id}");

        match self.controller.state_dir(id) {
            Ok(path) => match std::fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => error!(path = %path.display(), "delete root dir: {e}"),
            },
            Err(e) => error!(container = %id, "skipping root dir removal: {e}"),
        }

        let config = load_config(self.container.as_ref())?;
        // Resolve before touching the registry: without the binder the
        // attachment could never be released once the record is gone.
        let network = self.controller.network(&config.network)?;

        ctx.check()?;
        if let Err(e) = self.controller.registrar().deregister(id) {
            error!(container = %id, "deregister services: {e}");
        }
        if let Err(e) = network.remove(self.container.as_ref()) {
            error!(container = %id, network = %config.network, "remove network: {e}");
        }

        self.container.delete(DeleteOpts {
            cleanup_snapshot: true,
        })?;
        info!("deleted container {id}");
        Ok(())
    }
}
