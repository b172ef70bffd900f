//! armada-cloud — uniform operations over infrastructure providers.
//!
//! The director drives VMs, disks and stemcells through the `Cloud`
//! capability trait. Three backends: `vsphere` (vCenter REST), `esx`
//! (single host), and `dummy` (in-memory, spawns a bus-connected agent per
//! VM; used by tests and local development). Selection is by configuration.
//!
//! All operations are synchronous from the caller's perspective; backends
//! translate to their own async primitives internally. Failures map to
//! `cloud_error` carrying the provider message.

pub mod agent;
pub mod dummy;
pub mod esx;
mod rest;
pub mod vsphere;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use armada_bus::Bus;
use armada_core::DirectorError;

pub use agent::{DummyAgent, DummyAgentBehavior};
pub use dummy::{CloudOp, DummyCloud};
pub use esx::{EsxCloud, EsxConfig};
pub use vsphere::{VSphereCloud, VSphereConfig};

pub type CloudResult<T> = Result<T, CloudError>;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct CloudError(pub String);

impl From<CloudError> for DirectorError {
    fn from(e: CloudError) -> Self {
        DirectorError::CloudError(e.0)
    }
}

/// Infrastructure capability set.
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Register a stemcell image with the provider; returns its cloud id.
    async fn create_stemcell(&self, image_path: &Path, properties: &Value) -> CloudResult<String>;

    async fn delete_stemcell(&self, cid: &str) -> CloudResult<()>;

    /// Create a VM from a stemcell and boot its agent.
    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        resource_pool: &Value,
        networks: &Value,
        env: &Value,
    ) -> CloudResult<String>;

    async fn delete_vm(&self, cid: &str) -> CloudResult<()>;

    async fn reboot_vm(&self, cid: &str) -> CloudResult<()>;

    async fn configure_networks(&self, cid: &str, networks: &Value) -> CloudResult<()>;

    /// Create a persistent disk near the given VM; returns its cloud id.
    async fn create_disk(&self, size_mb: u64, vm_cid: &str) -> CloudResult<String>;

    async fn delete_disk(&self, cid: &str) -> CloudResult<()>;

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()>;

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()>;

    async fn get_disks(&self, vm_cid: &str) -> CloudResult<Vec<String>>;

    async fn snapshot_disk(&self, disk_cid: &str) -> CloudResult<String>;
}

/// Provider selection, parsed from the daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum CloudConfig {
    Vsphere(VSphereConfig),
    Esx(EsxConfig),
    Dummy,
}

/// Construct the configured backend. The bus is only used by the dummy
/// provider, which runs its agents in-process.
pub fn from_config(config: &CloudConfig, bus: Arc<dyn Bus>) -> Arc<dyn Cloud> {
    match config {
        CloudConfig::Vsphere(cfg) => Arc::new(VSphereCloud::new(cfg.clone())),
        CloudConfig::Esx(cfg) => Arc::new(EsxCloud::new(cfg.clone())),
        CloudConfig::Dummy => Arc::new(DummyCloud::new(bus)),
    }
}
