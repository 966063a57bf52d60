use super::{Change, ChangeKind};
use crate::context::Context;
use crate::controller::Controller;
use crate::CoreError;
use std::sync::Arc;
use tracing::{error, info};
use warden_runtime::{Container, RuntimeClient};

pub const STOP_MAINTENANCE_REASON: &str = "manual stop";

/// Quiesce a container: drain its registrations, then terminate its task.
///
/// Network attachment and registry entries stay in place so a later start can
/// bring the container back.
pub struct StopChange {
    container: Arc<dyn Container>,
    controller: Arc<Controller>,
}

impl StopChange {
    pub fn new(container: Arc<dyn Container>, controller: Arc<Controller>) -> Self {
        Self {
            container,
            controller,
        }
    }
}

impl Change for StopChange {
    fn kind(&self) -> ChangeKind {
        ChangeKind::Stop
    }

    fn container_id(&self) -> &str {
        self.container.id()
    }

    fn apply(&self, ctx: &Context, _client: &dyn RuntimeClient) -> Result<(), CoreError> {
        ctx.check()?;
        let id = self.container.id();
        info!("stopping container {id}");

        if let Err(e) = self
            .controller
            .registrar()
            .enable_maintenance(id, STOP_MAINTENANCE_REASON)
        {
            error!(container = %id, "setting service maintenance: {e}");
        }

        let outcome = self
            .controller
            .terminator()
            .terminate(ctx, self.container.as_ref())?;
        info!("stopped container {id}: {outcome:?}");
        Ok(())
    }
}
