use super::{load_config, Change, ChangeKind};
use crate::context::Context;
use crate::controller::Controller;
use crate::CoreError;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use warden_runtime::{Container, IoSpec, RuntimeClient, Task};

/// Bring a container up with exactly one task, attached to its network and
/// registered under each of its services.
pub struct StartChange {
    container: Arc<dyn Container>,
    controller: Arc<Controller>,
}

impl StartChange {
    pub fn new(container: Arc<dyn Container>, controller: Arc<Controller>) -> Self {
        Self {
            container,
            controller,
        }
    }

    fn discard_task(&self, task: &dyn Task, why: &str) {
        if let Err(e) = task.delete(true) {
            error!(container = %self.container.id(), "delete task on {why}: {e}");
        }
    }
}

impl Change for StartChange {
    fn kind(&self) -> ChangeKind {
        ChangeKind::Start
    }

    fn container_id(&self) -> &str {
        self.container.id()
    }

    fn apply(&self, ctx: &Context, _client: &dyn RuntimeClient) -> Result<(), CoreError> {
        ctx.check()?;
        let id = self.container.id();
        info!("starting container {id}");

        // Clear out any task left by an earlier run; having none is the normal case.
        if let Err(e) = self
            .controller
            .terminator()
            .terminate(ctx, self.container.as_ref())
        {
            warn!("clearing previous task of {id}: {e}");
        }

        let config = load_config(self.container.as_ref())?;
        let network = self.controller.network(&config.network)?;

        ctx.check()?;
        let task = self.container.new_task(&IoSpec::Stdio)?;

        if let Err(e) = ctx.check() {
            self.discard_task(task.as_ref(), "cancelled start");
            return Err(e);
        }
        let address = match network.create(task.as_ref()) {
            Ok(address) => address,
            Err(e) => {
                self.discard_task(task.as_ref(), "failed network setup");
                return Err(e.into());
            }
        };

        if address.is_empty() {
            debug!("network {} assigned no address to {id}", config.network);
        } else {
            info!(container = %config.id, ip = %address, "setup network interface");
            let registrar = self.controller.registrar();
            for (name, service) in &config.services {
                if let Err(e) = registrar.register(&config.id, name, &address, service) {
                    error!(container = %config.id, service = %name, "register service: {e}");
                }
            }
        }

        task.start()?;
        info!("started container {id} (pid {:?})", task.pid());

        if let Err(e) = self.controller.registrar().disable_maintenance(&config.id) {
            error!(container = %config.id, "disable service maintenance: {e}");
        }
        Ok(())
    }
}
