//! Dummy cloud — in-memory provider for tests and local development.
//!
//! Creating a VM spawns a `DummyAgent` on the bus, so the full RPC path is
//! exercised without any infrastructure. Every call is recorded in an op
//! log that tests assert against (an idempotent redeploy performs zero
//! cloud calls).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use armada_bus::Bus;

use crate::agent::{DummyAgent, DummyAgentBehavior};
use crate::{Cloud, CloudError, CloudResult};

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudOp {
    CreateStemcell { cid: String },
    DeleteStemcell { cid: String },
    CreateVm { cid: String, agent_id: String, stemcell_cid: String },
    DeleteVm { cid: String },
    RebootVm { cid: String },
    ConfigureNetworks { cid: String },
    CreateDisk { cid: String, size_mb: u64 },
    DeleteDisk { cid: String },
    AttachDisk { vm_cid: String, disk_cid: String },
    DetachDisk { vm_cid: String, disk_cid: String },
    SnapshotDisk { disk_cid: String, snapshot_cid: String },
}

struct DummyVm {
    agent_id: String,
    agent: JoinHandle<()>,
}

#[derive(Default)]
struct DummyState {
    stemcells: HashMap<String, Value>,
    vms: HashMap<String, DummyVm>,
    disks: HashMap<String, u64>,
    attachments: HashMap<String, Vec<String>>,
}

pub struct DummyCloud {
    bus: Arc<dyn Bus>,
    state: Mutex<DummyState>,
    ops: Mutex<Vec<CloudOp>>,
    behavior: DummyAgentBehavior,
}

impl DummyCloud {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            state: Mutex::new(DummyState::default()),
            ops: Mutex::new(Vec::new()),
            behavior: DummyAgentBehavior::default(),
        }
    }

    /// Configure failure injection for agents of subsequently created VMs.
    pub fn with_agent_behavior(mut self, behavior: DummyAgentBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Snapshot of the op log.
    pub fn ops(&self) -> Vec<CloudOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Clear the op log (to scope assertions to one phase).
    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub fn vm_count(&self) -> usize {
        self.state.lock().unwrap().vms.len()
    }

    pub fn disk_count(&self) -> usize {
        self.state.lock().unwrap().disks.len()
    }

    fn record(&self, op: CloudOp) {
        debug!(?op, "dummy cloud op");
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Cloud for DummyCloud {
    async fn create_stemcell(&self, image_path: &Path, properties: &Value) -> CloudResult<String> {
        if !image_path.exists() {
            return Err(CloudError(format!("stemcell image missing: {image_path:?}")));
        }
        let cid = format!("sc-{}", Uuid::new_v4());
        self.state
            .lock()
            .unwrap()
            .stemcells
            .insert(cid.clone(), properties.clone());
        self.record(CloudOp::CreateStemcell { cid: cid.clone() });
        Ok(cid)
    }

    async fn delete_stemcell(&self, cid: &str) -> CloudResult<()> {
        let removed = self.state.lock().unwrap().stemcells.remove(cid).is_some();
        if !removed {
            return Err(CloudError(format!("unknown stemcell: {cid}")));
        }
        self.record(CloudOp::DeleteStemcell { cid: cid.to_string() });
        Ok(())
    }

    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        _resource_pool: &Value,
        _networks: &Value,
        _env: &Value,
    ) -> CloudResult<String> {
        let cid = format!("vm-{}", Uuid::new_v4());
        {
            let mut state = self.state.lock().unwrap();
            if !state.stemcells.contains_key(stemcell_cid) {
                return Err(CloudError(format!("unknown stemcell: {stemcell_cid}")));
            }
            let agent = DummyAgent::spawn(
                Arc::clone(&self.bus),
                agent_id.to_string(),
                self.behavior.clone(),
            );
            state.vms.insert(
                cid.clone(),
                DummyVm {
                    agent_id: agent_id.to_string(),
                    agent,
                },
            );
        }
        self.record(CloudOp::CreateVm {
            cid: cid.clone(),
            agent_id: agent_id.to_string(),
            stemcell_cid: stemcell_cid.to_string(),
        });
        Ok(cid)
    }

    async fn delete_vm(&self, cid: &str) -> CloudResult<()> {
        let vm = self.state.lock().unwrap().vms.remove(cid);
        match vm {
            Some(vm) => {
                vm.agent.abort();
                debug!(%cid, agent_id = %vm.agent_id, "dummy vm deleted, agent stopped");
                self.state.lock().unwrap().attachments.remove(cid);
                self.record(CloudOp::DeleteVm { cid: cid.to_string() });
                Ok(())
            }
            None => Err(CloudError(format!("unknown vm: {cid}"))),
        }
    }

    async fn reboot_vm(&self, cid: &str) -> CloudResult<()> {
        if !self.state.lock().unwrap().vms.contains_key(cid) {
            return Err(CloudError(format!("unknown vm: {cid}")));
        }
        self.record(CloudOp::RebootVm { cid: cid.to_string() });
        Ok(())
    }

    async fn configure_networks(&self, cid: &str, _networks: &Value) -> CloudResult<()> {
        if !self.state.lock().unwrap().vms.contains_key(cid) {
            return Err(CloudError(format!("unknown vm: {cid}")));
        }
        self.record(CloudOp::ConfigureNetworks { cid: cid.to_string() });
        Ok(())
    }

    async fn create_disk(&self, size_mb: u64, vm_cid: &str) -> CloudResult<String> {
        if !self.state.lock().unwrap().vms.contains_key(vm_cid) {
            return Err(CloudError(format!("unknown vm: {vm_cid}")));
        }
        let cid = format!("disk-{}", Uuid::new_v4());
        self.state.lock().unwrap().disks.insert(cid.clone(), size_mb);
        self.record(CloudOp::CreateDisk {
            cid: cid.clone(),
            size_mb,
        });
        Ok(cid)
    }

    async fn delete_disk(&self, cid: &str) -> CloudResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.attachments.values().any(|disks| disks.iter().any(|d| d == cid)) {
            return Err(CloudError(format!("disk still attached: {cid}")));
        }
        if state.disks.remove(cid).is_none() {
            return Err(CloudError(format!("unknown disk: {cid}")));
        }
        drop(state);
        self.record(CloudOp::DeleteDisk { cid: cid.to_string() });
        Ok(())
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.vms.contains_key(vm_cid) {
                return Err(CloudError(format!("unknown vm: {vm_cid}")));
            }
            if !state.disks.contains_key(disk_cid) {
                return Err(CloudError(format!("unknown disk: {disk_cid}")));
            }
            let attached = state.attachments.entry(vm_cid.to_string()).or_default();
            if !attached.iter().any(|d| d == disk_cid) {
                attached.push(disk_cid.to_string());
            }
        }
        self.record(CloudOp::AttachDisk {
            vm_cid: vm_cid.to_string(),
            disk_cid: disk_cid.to_string(),
        });
        Ok(())
    }

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let attached = state
                .attachments
                .get_mut(vm_cid)
                .ok_or_else(|| CloudError(format!("no disks attached to {vm_cid}")))?;
            let before = attached.len();
            attached.retain(|d| d != disk_cid);
            if attached.len() == before {
                return Err(CloudError(format!("disk {disk_cid} not attached to {vm_cid}")));
            }
        }
        self.record(CloudOp::DetachDisk {
            vm_cid: vm_cid.to_string(),
            disk_cid: disk_cid.to_string(),
        });
        Ok(())
    }

    async fn get_disks(&self, vm_cid: &str) -> CloudResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .attachments
            .get(vm_cid)
            .cloned()
            .unwrap_or_default())
    }

    async fn snapshot_disk(&self, disk_cid: &str) -> CloudResult<String> {
        if !self.state.lock().unwrap().disks.contains_key(disk_cid) {
            return Err(CloudError(format!("unknown disk: {disk_cid}")));
        }
        let snapshot_cid = format!("snap-{}", Uuid::new_v4());
        self.record(CloudOp::SnapshotDisk {
            disk_cid: disk_cid.to_string(),
            snapshot_cid: snapshot_cid.clone(),
        });
        Ok(snapshot_cid)
    }
}
