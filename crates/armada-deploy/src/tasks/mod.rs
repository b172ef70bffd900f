//! Top-level task bodies.
//!
//! One handler per task kind, each composing the engine's pieces under
//! the appropriate lock. Registered into the task worker at daemon
//! startup.

pub mod deployment;
pub mod release;
pub mod stemcell;

use std::sync::Arc;
use std::time::Duration;

use armada_state::TaskKind;
use armada_tasks::HandlerRegistry;

use crate::context::DeployContext;

pub use deployment::{DeleteDeploymentJob, UpdateDeploymentJob};
pub use release::{DeleteReleaseJob, UpdateReleaseJob};
pub use stemcell::{DeleteStemcellJob, UpdateStemcellJob};

/// How long a freshly created VM's agent gets to answer its first ping.
pub const AGENT_BOOT_DEADLINE: Duration = Duration::from_secs(60);

/// Build the full handler registry for the task workers.
pub fn register_handlers(ctx: DeployContext) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.insert(
        TaskKind::UpdateDeployment,
        Arc::new(UpdateDeploymentJob { ctx: ctx.clone() }) as _,
    );
    registry.insert(
        TaskKind::DeleteDeployment,
        Arc::new(DeleteDeploymentJob { ctx: ctx.clone() }) as _,
    );
    registry.insert(
        TaskKind::UpdateRelease,
        Arc::new(UpdateReleaseJob { ctx: ctx.clone() }) as _,
    );
    registry.insert(
        TaskKind::DeleteRelease,
        Arc::new(DeleteReleaseJob { ctx: ctx.clone() }) as _,
    );
    registry.insert(
        TaskKind::UpdateStemcell,
        Arc::new(UpdateStemcellJob { ctx: ctx.clone() }) as _,
    );
    registry.insert(
        TaskKind::DeleteStemcell,
        Arc::new(DeleteStemcellJob { ctx }) as _,
    );
    registry
}
