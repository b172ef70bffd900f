//! The context value carried through every task body.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use armada_bus::AgentClient;
use armada_cloud::Cloud;
use armada_core::Blobstore;
use armada_lock::LockOptions;
use armada_plan::Network;
use armada_state::StateStore;

/// Collaborators the reconciliation engine needs, constructed once at
/// daemon startup and passed explicitly.
#[derive(Clone)]
pub struct DeployContext {
    pub store: StateStore,
    pub agents: AgentClient,
    pub cloud: Arc<dyn Cloud>,
    pub blobstore: Arc<dyn Blobstore>,
    /// TTL and acquisition timeout for every lock taken by task bodies.
    pub locks: LockOptions,
}

/// Network pools shared between the compiler, pool updater and instance
/// updaters once binding is done. Locked only for short allocation and
/// settings lookups, never across awaits.
pub type SharedNets = Arc<Mutex<HashMap<String, Network>>>;
