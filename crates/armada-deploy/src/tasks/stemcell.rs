//! Stemcell upload and deletion task bodies.

use async_trait::async_trait;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use armada_core::{digest_file, DirectorError};
use armada_lock::{names as lock_names, LockGuard};
use armada_state::StemcellRecord;
use armada_tasks::{TaskContext, TaskHandler};

use crate::bundle::StemcellBundle;
use crate::context::DeployContext;

/// `update_stemcell`: register an uploaded image with the provider.
pub struct UpdateStemcellJob {
    pub ctx: DeployContext,
}

#[async_trait]
impl TaskHandler for UpdateStemcellJob {
    async fn run(&self, tc: TaskContext) -> anyhow::Result<String> {
        let bundle_path = tc.payload["bundle_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("update_stemcell payload missing bundle_path"))?;
        let bundle = StemcellBundle::open(Path::new(bundle_path))?;
        let name = bundle.manifest.name.clone();
        let version = bundle.manifest.version.clone();
        tc.logger
            .debug(&format!("uploading stemcell {name}/{version}"));

        let _lock = LockGuard::acquire(
            &self.ctx.store,
            &lock_names::stemcells(),
            self.ctx.locks.clone(),
        )
        .await?;

        if self.ctx.store.get_stemcell(&name, &version)?.is_some() {
            return Err(DirectorError::ValidationFailed(vec![format!(
                "stemcell {name}/{version} already exists"
            )])
            .into());
        }

        let image_path = std::env::temp_dir().join(format!("stemcell-image-{}", Uuid::new_v4()));
        bundle.extract_image(&image_path)?;
        let digest = digest_file(&image_path)?;
        tc.cancel.check()?;

        tc.logger.event("Uploading stemcell", &name, 0, 1, "started");
        let result = self
            .ctx
            .cloud
            .create_stemcell(&image_path, &bundle.manifest.cloud_properties)
            .await;
        let _ = std::fs::remove_file(&image_path);
        let cid = result.map_err(DirectorError::from)?;
        tc.logger.event("Uploading stemcell", &name, 0, 1, "finished");

        self.ctx.store.put_stemcell(&StemcellRecord {
            name: name.clone(),
            version: version.clone(),
            cid,
            digest,
        })?;

        info!(stemcell = %name, %version, "stemcell created");
        Ok(format!("/stemcells/{name}/{version}"))
    }
}

/// `delete_stemcell`: drop the image unless a deployment references it.
pub struct DeleteStemcellJob {
    pub ctx: DeployContext,
}

#[async_trait]
impl TaskHandler for DeleteStemcellJob {
    async fn run(&self, tc: TaskContext) -> anyhow::Result<String> {
        let name = tc.payload["name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("delete_stemcell payload missing name"))?
            .to_string();
        let version = tc.payload["version"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("delete_stemcell payload missing version"))?
            .to_string();

        let _lock = LockGuard::acquire(
            &self.ctx.store,
            &lock_names::stemcells(),
            self.ctx.locks.clone(),
        )
        .await?;

        let store = &self.ctx.store;
        let key = format!("{name}/{version}");
        let Some(record) = store.get_stemcell(&name, &version)? else {
            return Err(DirectorError::not_found("stemcell", &key).into());
        };

        let in_use = store
            .list_deployments()?
            .iter()
            .any(|d| d.stemcells.iter().any(|s| s == &key));
        if in_use {
            return Err(DirectorError::StemcellInUse { name, version }.into());
        }

        tc.cancel.check()?;
        self.ctx
            .cloud
            .delete_stemcell(&record.cid)
            .await
            .map_err(DirectorError::from)?;
        store.delete_stemcell(&name, &version)?;

        info!(stemcell = %key, "stemcell deleted");
        Ok(format!("deleted stemcell {key}"))
    }
}
