//! armada-deploy — the deployment reconciliation engine.
//!
//! Task bodies compose the pieces in this crate under a deployment lock:
//! the binder reconciles a validated plan against database state, the
//! package compiler builds missing artifacts on transient VMs, the
//! resource pool updater keeps idle VM sets at target, and the job updater
//! walks jobs canary-first, driving each instance through the update state
//! machine.
//!
//! All collaborators travel in a `DeployContext` value; nothing reaches
//! for process-wide state.

pub mod binder;
pub mod bundle;
pub mod compile;
pub mod context;
pub mod instance;
pub mod jobs;
pub mod pools;
pub mod spec;
pub mod tasks;

pub use binder::{bind, Binding};
pub use compile::{compile_packages, CompiledMap};
pub use context::{DeployContext, SharedNets};
pub use tasks::register_handlers;
