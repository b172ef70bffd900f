//! Deployment update and deletion task bodies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use armada_core::DirectorError;
use armada_lock::{names as lock_names, LockGuard};
use armada_plan::{Manifest, Plan, ReleaseContent, ReleaseRef};
use armada_state::{DeploymentRecord, StateStore, StemcellRecord};
use armada_tasks::{TaskContext, TaskHandler};

use crate::binder::bind;
use crate::compile::compile_packages;
use crate::context::{DeployContext, SharedNets};
use crate::instance::{delete_instance, InstanceUpdater};
use crate::jobs::update_job;
use crate::pools::{grow, shrink, IdleVms};

/// `update_deployment`: manifest in, reconciled deployment out.
pub struct UpdateDeploymentJob {
    pub ctx: DeployContext,
}

#[async_trait]
impl TaskHandler for UpdateDeploymentJob {
    async fn run(&self, tc: TaskContext) -> anyhow::Result<String> {
        let manifest_path = tc.payload["manifest_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("update_deployment payload missing manifest_path"))?;
        let manifest_text = std::fs::read_to_string(manifest_path)?;
        let manifest = Manifest::from_yaml(&manifest_text)?;

        tc.logger
            .debug(&format!("deploying {} from {manifest_path}", manifest.name));
        let _lock = LockGuard::acquire(
            &self.ctx.store,
            &lock_names::deployment(&manifest.name),
            self.ctx.locks.clone(),
        )
        .await?;

        self.deploy(&manifest, &manifest_text, &tc).await
    }
}

impl UpdateDeploymentJob {
    async fn deploy(
        &self,
        manifest: &Manifest,
        manifest_text: &str,
        tc: &TaskContext,
    ) -> anyhow::Result<String> {
        let ctx = &self.ctx;

        // Desired state, from pure values.
        let release = load_release_content(&ctx.store, &manifest.release)?;
        let stemcells = load_stemcells(&ctx.store, manifest)?;
        let mut plan = Plan::build(manifest, manifest_text, &release, &stemcells)?;
        tc.cancel.check()?;

        // Bind against the database; all decisions land on the plan.
        tc.logger.event("Preparing deployment", "binding", 0, 1, "started");
        let mut binding = bind(ctx, &mut plan)?;
        tc.logger.event("Preparing deployment", "binding", 0, 1, "finished");
        tc.cancel.check()?;

        // From here the pools are shared with concurrent workers.
        let nets: SharedNets = Arc::new(Mutex::new(std::mem::take(&mut plan.networks)));

        tc.logger.event("Compiling packages", "all", 0, 1, "started");
        let compiled = compile_packages(ctx, &plan, &nets, &tc.cancel).await?;
        tc.logger.event("Compiling packages", "all", 0, 1, "finished");
        tc.cancel.check()?;

        let idle = Arc::new(IdleVms::new(std::mem::take(&mut binding.idle_vms)));
        grow(ctx, &plan, &nets, &idle, &binding.vm_demand).await?;

        let updater = InstanceUpdater::new(
            ctx.clone(),
            plan.name.clone(),
            nets.clone(),
            Arc::clone(&idle),
            Arc::clone(&tc.logger),
        );

        // Jobs in manifest order; instances canary-first inside each.
        for job in &plan.jobs {
            tc.cancel.check()?;
            let pool = plan
                .resource_pools
                .get(&job.resource_pool)
                .expect("validated pool reference");
            update_job(
                &updater, &plan.name, job, pool, &compiled, &nets, &tc.cancel, &tc.logger,
            )
            .await?;
        }

        // Obsolete instances and surplus idle VMs go last.
        tc.cancel.check()?;
        for record in &binding.obsolete {
            delete_instance(ctx, Some(&nets), &plan.name, record).await?;
        }
        shrink(ctx, &plan, &nets, &idle, &binding.idle_target).await?;

        ctx.store.put_deployment(&DeploymentRecord {
            name: plan.name.clone(),
            manifest: manifest_text.to_string(),
            releases: vec![plan.release.table_key()],
            stemcells: stemcells.keys().cloned().collect(),
        })?;

        info!(deployment = %plan.name, "deployment updated");
        Ok(format!("/deployments/{}", plan.name))
    }
}

/// `delete_deployment`: tear everything down under the deployment lock.
pub struct DeleteDeploymentJob {
    pub ctx: DeployContext,
}

#[async_trait]
impl TaskHandler for DeleteDeploymentJob {
    async fn run(&self, tc: TaskContext) -> anyhow::Result<String> {
        let name = tc.payload["name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("delete_deployment payload missing name"))?
            .to_string();

        let _lock = LockGuard::acquire(
            &self.ctx.store,
            &lock_names::deployment(&name),
            self.ctx.locks.clone(),
        )
        .await?;

        let ctx = &self.ctx;
        if ctx.store.get_deployment(&name)?.is_none() {
            return Err(DirectorError::not_found("deployment", &name).into());
        }

        let instances = ctx.store.list_instances(&name)?;
        let total = instances.len();
        for (position, record) in instances.iter().enumerate() {
            tc.cancel.check()?;
            tc.logger.event(
                "Deleting instances",
                &format!("{}/{}", record.job, record.index),
                position,
                total,
                "started",
            );
            delete_instance(ctx, None, &name, record).await?;
        }

        // Idle VMs (and any compilation leftovers).
        for vm in ctx.store.list_vms(&name)? {
            tc.cancel.check()?;
            ctx.cloud.delete_vm(&vm.cid).await.map_err(DirectorError::from)?;
            ctx.store.delete_vm(&name, &vm.cid)?;
        }
        // Orphaned disks.
        for disk in ctx.store.list_disks(&name)? {
            if let Err(e) = ctx.cloud.delete_disk(&disk.cid).await {
                tc.logger.debug(&format!("orphan disk {} not deleted: {e}", disk.cid));
            }
            ctx.store.delete_disk(&name, &disk.cid)?;
        }

        ctx.store.delete_deployment(&name)?;
        info!(deployment = %name, "deployment deleted");
        Ok(format!("deleted deployment {name}"))
    }
}

/// Load a release version with its content as pure values.
pub(crate) fn load_release_content(
    store: &StateStore,
    release: &ReleaseRef,
) -> anyhow::Result<ReleaseContent> {
    let version = store
        .get_release_version(&release.name, &release.version)?
        .ok_or_else(|| {
            DirectorError::not_found("release", format!("{}/{}", release.name, release.version))
        })?;
    let packages = store.list_packages(&release.name, &release.version)?;
    let templates = store.list_templates(&release.name, &release.version)?;
    Ok(ReleaseContent {
        version,
        packages,
        templates,
    })
}

/// Stemcells for every pool reference that exists; missing ones surface
/// through plan validation.
fn load_stemcells(
    store: &StateStore,
    manifest: &Manifest,
) -> anyhow::Result<HashMap<String, StemcellRecord>> {
    let mut stemcells = HashMap::new();
    for pool in &manifest.resource_pools {
        let key = format!("{}/{}", pool.stemcell.name, pool.stemcell.version);
        if let Some(record) = store.get_stemcell(&pool.stemcell.name, &pool.stemcell.version)? {
            stemcells.insert(key, record);
        }
    }
    Ok(stemcells)
}

