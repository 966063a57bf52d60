//! Lifecycle changes.
//!
//! Each intent is its own type implementing [`Change`], so the step order and
//! failure policy of one protocol can be read (and tested) without the others.

mod delete;
mod start;
mod stop;

pub use delete::DeleteChange;
pub use start::StartChange;
pub use stop::{StopChange, STOP_MAINTENANCE_REASON};

use crate::context::Context;
use crate::CoreError;
use std::fmt;
use warden_runtime::{Container, RuntimeClient};
use warden_schema::{decode_config, Configuration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Stop,
    Start,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Stop => write!(f, "stop"),
            ChangeKind::Start => write!(f, "start"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// A lifecycle intent bound to one container.
///
/// `apply` runs to completion on the calling thread. It is safe to call again
/// after a failure; each variant reconciles whatever a previous attempt left behind.
pub trait Change: Send + Sync {
    fn kind(&self) -> ChangeKind;

    fn container_id(&self) -> &str;

    fn apply(&self, ctx: &Context, client: &dyn RuntimeClient) -> Result<(), CoreError>;
}

/// Read the container's configuration from its record.
fn load_config(container: &dyn Container) -> Result<Configuration, CoreError> {
    let info = container.info()?;
    Ok(decode_config(container.id(), &info.extensions)?)
}
