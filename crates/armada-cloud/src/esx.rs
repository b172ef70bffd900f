//! ESX backend — drives a single ESXi host without a vCenter.
//!
//! The host API is flatter than vCenter's: no datacenters or folders, VMs
//! are created directly from an uploaded stemcell image, and disks are
//! plain VMDKs on the configured datastore.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rest::RestClient;
use crate::{Cloud, CloudError, CloudResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsxConfig {
    /// Host base URL, e.g. `https://esx-1.example.com`.
    pub host: String,
    pub username: String,
    pub password: String,
    pub datastore: String,
    /// Accept the host's self-signed certificate.
    #[serde(default)]
    pub insecure: bool,
}

pub struct EsxCloud {
    config: EsxConfig,
    rest: RestClient,
}

impl EsxCloud {
    pub fn new(config: EsxConfig) -> Self {
        let rest = RestClient::new(
            &config.host,
            &config.username,
            &config.password,
            "/api/session",
            "vmware-api-session-id",
            config.insecure,
        );
        Self { config, rest }
    }

    fn id_of(value: Value, what: &str) -> CloudResult<String> {
        value
            .as_str()
            .map(str::to_string)
            .or_else(|| value.get("id").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| CloudError(format!("{what}: response carried no id")))
    }
}

#[async_trait]
impl Cloud for EsxCloud {
    async fn create_stemcell(&self, image_path: &Path, properties: &Value) -> CloudResult<String> {
        let name = format!("sc-{}", Uuid::new_v4());
        let upload = format!(
            "/folder/armada-stemcells/{name}.ova?dsName={}",
            self.config.datastore
        );
        self.rest.upload_file(&upload, image_path).await?;

        let registered = self
            .rest
            .post(
                "/api/host/stemcells",
                &json!({
                    "name": name,
                    "datastore": self.config.datastore,
                    "path": format!("armada-stemcells/{name}.ova"),
                    "cloud_properties": properties,
                }),
            )
            .await?;
        let cid = Self::id_of(registered, "register stemcell")?;
        debug!(%cid, "stemcell registered on host");
        Ok(cid)
    }

    async fn delete_stemcell(&self, cid: &str) -> CloudResult<()> {
        self.rest.delete(&format!("/api/host/stemcells/{cid}")).await?;
        Ok(())
    }

    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        resource_pool: &Value,
        networks: &Value,
        env: &Value,
    ) -> CloudResult<String> {
        let created = self
            .rest
            .post(
                "/api/host/vms",
                &json!({
                    "name": format!("vm-{agent_id}"),
                    "stemcell": stemcell_cid,
                    "datastore": self.config.datastore,
                    "hardware": resource_pool,
                    "guestinfo": {
                        "armada.agent_id": agent_id,
                        "armada.networks": networks,
                        "armada.env": env,
                    },
                }),
            )
            .await?;
        let cid = Self::id_of(created, "create vm")?;
        self.rest
            .post(&format!("/api/host/vms/{cid}/power/on"), &json!({}))
            .await?;
        Ok(cid)
    }

    async fn delete_vm(&self, cid: &str) -> CloudResult<()> {
        // Power-off of an already-off VM is not fatal.
        if let Err(e) = self
            .rest
            .post(&format!("/api/host/vms/{cid}/power/off"), &json!({}))
            .await
        {
            warn!(%cid, error = %e, "power off before delete failed");
        }
        self.rest.delete(&format!("/api/host/vms/{cid}")).await?;
        Ok(())
    }

    async fn reboot_vm(&self, cid: &str) -> CloudResult<()> {
        self.rest
            .post(&format!("/api/host/vms/{cid}/power/reset"), &json!({}))
            .await?;
        Ok(())
    }

    async fn configure_networks(&self, cid: &str, networks: &Value) -> CloudResult<()> {
        self.rest
            .post(&format!("/api/host/vms/{cid}/networks"), networks)
            .await?;
        Ok(())
    }

    async fn create_disk(&self, size_mb: u64, vm_cid: &str) -> CloudResult<String> {
        let created = self
            .rest
            .post(
                "/api/host/disks",
                &json!({
                    "capacity_mb": size_mb,
                    "datastore": self.config.datastore,
                    "near_vm": vm_cid,
                }),
            )
            .await?;
        Self::id_of(created, "create disk")
    }

    async fn delete_disk(&self, cid: &str) -> CloudResult<()> {
        self.rest.delete(&format!("/api/host/disks/{cid}")).await?;
        Ok(())
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        self.rest
            .post(
                &format!("/api/host/vms/{vm_cid}/disks"),
                &json!({ "disk": disk_cid }),
            )
            .await?;
        Ok(())
    }

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        self.rest
            .delete(&format!("/api/host/vms/{vm_cid}/disks/{disk_cid}"))
            .await?;
        Ok(())
    }

    async fn get_disks(&self, vm_cid: &str) -> CloudResult<Vec<String>> {
        let listed = self.rest.get(&format!("/api/host/vms/{vm_cid}/disks")).await?;
        Ok(listed
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| {
                        e.as_str()
                            .or_else(|| e.get("disk").and_then(Value::as_str))
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn snapshot_disk(&self, disk_cid: &str) -> CloudResult<String> {
        let created = self
            .rest
            .post(&format!("/api/host/disks/{disk_cid}/snapshots"), &json!({}))
            .await?;
        Self::id_of(created, "snapshot disk")
    }
}
