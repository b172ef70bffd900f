//! vSphere backend — drives a vCenter through its REST automation API.
//!
//! Stemcells become VM templates in a dedicated folder; VMs are clones of
//! those templates; persistent disks are first-class disks attached and
//! detached by id. The agent environment (agent id, networks, env) travels
//! in the VM's extra config.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rest::RestClient;
use crate::{Cloud, CloudError, CloudResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VSphereConfig {
    /// vCenter base URL, e.g. `https://vcenter.example.com`.
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub datacenter: String,
    pub datastore: String,
    /// Folder holding director-managed VMs.
    #[serde(default = "default_vm_folder")]
    pub vm_folder: String,
    /// Accept self-signed vCenter certificates.
    #[serde(default)]
    pub insecure: bool,
}

fn default_vm_folder() -> String {
    "armada-vms".to_string()
}

pub struct VSphereCloud {
    config: VSphereConfig,
    rest: RestClient,
}

impl VSphereCloud {
    pub fn new(config: VSphereConfig) -> Self {
        let rest = RestClient::new(
            &config.endpoint,
            &config.username,
            &config.password,
            "/api/session",
            "vmware-api-session-id",
            config.insecure,
        );
        Self { config, rest }
    }

    fn placement(&self) -> Value {
        json!({
            "datacenter": self.config.datacenter,
            "datastore": self.config.datastore,
            "folder": self.config.vm_folder,
        })
    }

    fn expect_id(value: Value, what: &str) -> CloudResult<String> {
        value
            .as_str()
            .map(str::to_string)
            .or_else(|| value.get("value").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| CloudError(format!("{what}: response carried no id")))
    }
}

#[async_trait]
impl Cloud for VSphereCloud {
    async fn create_stemcell(&self, image_path: &Path, properties: &Value) -> CloudResult<String> {
        let name = format!("sc-{}", Uuid::new_v4());
        let upload = format!(
            "/folder/armada-stemcells/{name}.ova?dcPath={}&dsName={}",
            self.config.datacenter, self.config.datastore
        );
        self.rest.upload_file(&upload, image_path).await?;

        let body = json!({
            "name": name,
            "source": format!("[{}] armada-stemcells/{name}.ova", self.config.datastore),
            "placement": self.placement(),
            "mark_as_template": true,
            "cloud_properties": properties,
        });
        let created = self.rest.post("/api/vcenter/vm/register", &body).await?;
        let cid = Self::expect_id(created, "register stemcell")?;
        debug!(%cid, "stemcell template registered");
        Ok(cid)
    }

    async fn delete_stemcell(&self, cid: &str) -> CloudResult<()> {
        self.rest.delete(&format!("/api/vcenter/vm/{cid}")).await?;
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
        let body = json!({
            "name": format!("vm-{agent_id}"),
            "placement": self.placement(),
            "hardware": resource_pool,
            "extra_config": {
                "armada.agent_id": agent_id,
                "armada.networks": networks,
                "armada.env": env,
            },
        });
        let cloned = self
            .rest
            .post(&format!("/api/vcenter/vm/{stemcell_cid}?action=clone"), &body)
            .await?;
        let cid = Self::expect_id(cloned, "clone vm")?;

        self.rest
            .post(&format!("/api/vcenter/vm/{cid}/power?action=start"), &json!({}))
            .await?;
        debug!(%cid, %agent_id, "vm cloned and powered on");
        Ok(cid)
    }

    async fn delete_vm(&self, cid: &str) -> CloudResult<()> {
        // Power-off of an already-off VM is not fatal.
        if let Err(e) = self
            .rest
            .post(&format!("/api/vcenter/vm/{cid}/power?action=stop"), &json!({}))
            .await
        {
            warn!(%cid, error = %e, "power off before delete failed");
        }
        self.rest.delete(&format!("/api/vcenter/vm/{cid}")).await?;
        Ok(())
    }

    async fn reboot_vm(&self, cid: &str) -> CloudResult<()> {
        self.rest
            .post(&format!("/api/vcenter/vm/{cid}/power?action=reset"), &json!({}))
            .await?;
        Ok(())
    }

    async fn configure_networks(&self, cid: &str, networks: &Value) -> CloudResult<()> {
        self.rest
            .post(
                &format!("/api/vcenter/vm/{cid}/hardware/ethernet?action=update"),
                networks,
            )
            .await?;
        Ok(())
    }

    async fn create_disk(&self, size_mb: u64, vm_cid: &str) -> CloudResult<String> {
        let body = json!({
            "capacity_mb": size_mb,
            "datastore": self.config.datastore,
            "near_vm": vm_cid,
        });
        let created = self.rest.post("/api/vcenter/disk", &body).await?;
        Self::expect_id(created, "create disk")
    }

    async fn delete_disk(&self, cid: &str) -> CloudResult<()> {
        self.rest.delete(&format!("/api/vcenter/disk/{cid}")).await?;
        Ok(())
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        self.rest
            .post(
                &format!("/api/vcenter/vm/{vm_cid}/hardware/disk"),
                &json!({ "disk": disk_cid }),
            )
            .await?;
        Ok(())
    }

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        self.rest
            .delete(&format!("/api/vcenter/vm/{vm_cid}/hardware/disk/{disk_cid}"))
            .await?;
        Ok(())
    }

    async fn get_disks(&self, vm_cid: &str) -> CloudResult<Vec<String>> {
        let listed = self
            .rest
            .get(&format!("/api/vcenter/vm/{vm_cid}/hardware/disk"))
            .await?;
        let disks = listed
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
            .unwrap_or_default();
        Ok(disks)
    }

    async fn snapshot_disk(&self, disk_cid: &str) -> CloudResult<String> {
        let created = self
            .rest
            .post(&format!("/api/vcenter/disk/{disk_cid}?action=snapshot"), &json!({}))
            .await?;
        Self::expect_id(created, "snapshot disk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: VSphereConfig = serde_json::from_value(json!({
            "endpoint": "https://vcenter.example.com",
            "username": "admin",
            "password": "secret",
            "datacenter": "dc-1",
            "datastore": "ds-1",
        }))
        .unwrap();
        assert_eq!(config.vm_folder, "armada-vms");
        assert!(!config.insecure);
    }

    #[test]
    fn expect_id_accepts_both_shapes() {
        assert_eq!(
            VSphereCloud::expect_id(json!("vm-17"), "x").unwrap(),
            "vm-17"
        );
        assert_eq!(
            VSphereCloud::expect_id(json!({"value": "vm-18"}), "x").unwrap(),
            "vm-18"
        );
        assert!(VSphereCloud::expect_id(json!({"other": 1}), "x").is_err());
    }
}
