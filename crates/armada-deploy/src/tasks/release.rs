//! Release upload and deletion task bodies.

use async_trait::async_trait;
use std::path::Path;
use tracing::info;

use armada_core::{hex_digest, DirectorError};
use armada_lock::{names as lock_names, LockGuard};
use armada_state::{PackageRecord, ReleaseRecord, ReleaseVersionRecord, TemplateRecord};
use armada_tasks::{TaskContext, TaskHandler};

use crate::bundle::ReleaseBundle;
use crate::context::DeployContext;

/// `update_release`: ingest an uploaded release bundle.
pub struct UpdateReleaseJob {
    pub ctx: DeployContext,
}

#[async_trait]
impl TaskHandler for UpdateReleaseJob {
    async fn run(&self, tc: TaskContext) -> anyhow::Result<String> {
        let bundle_path = tc.payload["bundle_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("update_release payload missing bundle_path"))?;
        let bundle = ReleaseBundle::open(Path::new(bundle_path))?;
        let name = bundle.manifest.name.clone();
        let version = bundle.manifest.version.clone();
        tc.logger
            .debug(&format!("ingesting release {name}/{version} from {bundle_path}"));

        let _lock =
            LockGuard::acquire(&self.ctx.store, &lock_names::release(), self.ctx.locks.clone())
                .await?;

        let store = &self.ctx.store;
        if store.get_release_version(&name, &version)?.is_some() {
            return Err(DirectorError::ValidationFailed(vec![format!(
                "release {name}/{version} already exists"
            )])
            .into());
        }
        store.put_release(&ReleaseRecord { name: name.clone() })?;

        let total = bundle.manifest.packages.len() + bundle.manifest.jobs.len();
        let mut position = 0;
        for package in &bundle.manifest.packages {
            tc.cancel.check()?;
            tc.logger
                .event("Uploading packages", &package.name, position, total, "started");
            let blob = bundle.package_blob(&package.name)?;
            let digest = hex_digest(&blob);
            let blob_id = self.ctx.blobstore.create_bytes(&blob).await?;
            store.put_package(&PackageRecord {
                release: name.clone(),
                release_version: version.clone(),
                name: package.name.clone(),
                version: package.version.clone(),
                fingerprint: package.fingerprint.clone(),
                blob_id,
                digest,
                dependencies: package.dependencies.clone(),
            })?;
            tc.logger
                .event("Uploading packages", &package.name, position, total, "finished");
            position += 1;
        }

        for job in &bundle.manifest.jobs {
            tc.cancel.check()?;
            tc.logger
                .event("Uploading templates", &job.name, position, total, "started");
            let blob = bundle.job_blob(&job.name)?;
            let digest = hex_digest(&blob);
            let blob_id = self.ctx.blobstore.create_bytes(&blob).await?;
            store.put_template(&TemplateRecord {
                release: name.clone(),
                release_version: version.clone(),
                name: job.name.clone(),
                version: job.version.clone(),
                blob_id,
                digest,
                packages: job.packages.clone(),
            })?;
            tc.logger
                .event("Uploading templates", &job.name, position, total, "finished");
            position += 1;
        }

        store.put_release_version(&ReleaseVersionRecord {
            release: name.clone(),
            version: version.clone(),
        })?;

        info!(release = %name, %version, "release created");
        Ok(format!("created release {name}/{version}"))
    }
}

/// `delete_release`: remove a release and its blobs, unless in use.
pub struct DeleteReleaseJob {
    pub ctx: DeployContext,
}

#[async_trait]
impl TaskHandler for DeleteReleaseJob {
    async fn run(&self, tc: TaskContext) -> anyhow::Result<String> {
        let name = tc.payload["name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("delete_release payload missing name"))?
            .to_string();
        let force = tc.payload["force"].as_bool().unwrap_or(false);

        // The in-use re-check happens inside this critical section, so a
        // concurrent deployment cannot slip a reference in under us.
        let _lock =
            LockGuard::acquire(&self.ctx.store, &lock_names::release(), self.ctx.locks.clone())
                .await?;

        let store = &self.ctx.store;
        if store.get_release(&name)?.is_none() {
            return Err(DirectorError::not_found("release", &name).into());
        }

        let prefix = format!("{name}/");
        let users: Vec<String> = store
            .list_deployments()?
            .into_iter()
            .filter(|d| d.releases.iter().any(|r| r.starts_with(&prefix)))
            .map(|d| d.name)
            .collect();
        if !users.is_empty() {
            if !force {
                return Err(DirectorError::ReleaseInUse(format!(
                    "{name} (used by {})",
                    users.join(", ")
                ))
                .into());
            }
            tc.logger.debug(&format!(
                "force-deleting {name} despite references from {}",
                users.join(", ")
            ));
        }

        for release_version in store.list_release_versions(&name)? {
            tc.cancel.check()?;
            let version = &release_version.version;
            for package in store.list_packages(&name, version)? {
                let _ = self.ctx.blobstore.delete(&package.blob_id).await;
            }
            for template in store.list_templates(&name, version)? {
                let _ = self.ctx.blobstore.delete(&template.blob_id).await;
            }
            store.delete_release_version_content(&name, version)?;
            store.delete_release_version(&name, version)?;
        }
        store.delete_release(&name)?;

        info!(release = %name, "release deleted");
        Ok(format!("deleted release {name}"))
    }
}
