//! Instance updater — drives one VM from its current configuration to the
//! target.
//!
//! The path through the machine is chosen by the binder's change flag:
//! `restart` keeps the VM (stop → apply → start → watch), `recreate`
//! replaces it (stop → detach disk → delete VM → new VM → attach disk →
//! apply → start → watch), `new` is recreate without the teardown
//! prologue. Persistent disk resizes migrate data to a fresh disk and
//! keep the old one on any failure.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use armada_core::DirectorError;
use armada_plan::{ChangeKind, InstancePlan, JobPlan, ResourcePoolPlan, UpdatePolicy};
use armada_state::{DiskRecord, InstanceRecord, VmRecord};
use armada_tasks::TaskLogger;

use crate::context::{DeployContext, SharedNets};
use crate::pools::{release_ip, IdleVms};
use crate::spec;
use crate::tasks::AGENT_BOOT_DEADLINE;

#[derive(Clone)]
pub struct InstanceUpdater {
    ctx: DeployContext,
    deployment: String,
    nets: SharedNets,
    idle: Arc<IdleVms>,
    logger: Arc<TaskLogger>,
}

impl InstanceUpdater {
    pub fn new(
        ctx: DeployContext,
        deployment: String,
        nets: SharedNets,
        idle: Arc<IdleVms>,
        logger: Arc<TaskLogger>,
    ) -> Self {
        Self {
            ctx,
            deployment,
            nets,
            idle,
            logger,
        }
    }

    /// Run the state machine for one instance. Failures surface as
    /// `instance_update_failed` carrying job name and index; cancellation
    /// passes through untouched.
    pub async fn update(
        &self,
        job: &JobPlan,
        pool: &ResourcePoolPlan,
        inst: &InstancePlan,
        target: Value,
        canary: bool,
    ) -> anyhow::Result<()> {
        if inst.change == ChangeKind::NoChange {
            return Ok(());
        }
        self.logger.debug(&format!(
            "updating instance {}/{} ({:?})",
            job.name, inst.index, inst.change
        ));

        let outcome = match inst.change {
            ChangeKind::NoChange => unreachable!(),
            ChangeKind::Restart => self.restart(job, inst, &target, canary).await,
            ChangeKind::Recreate => self.recreate(job, pool, inst, &target, canary).await,
            ChangeKind::New => self.create(job, pool, inst, &target, canary).await,
        };
        match outcome {
            Ok(()) => {
                info!(job = %job.name, index = inst.index, "instance updated");
                Ok(())
            }
            Err(e) => match e.downcast::<DirectorError>() {
                Ok(DirectorError::Cancelled) => Err(DirectorError::Cancelled.into()),
                Ok(DirectorError::InstanceUpdateFailed { job, index, detail }) => {
                    Err(DirectorError::InstanceUpdateFailed { job, index, detail }.into())
                }
                Ok(domain) => Err(DirectorError::InstanceUpdateFailed {
                    job: job.name.clone(),
                    index: inst.index,
                    detail: domain.to_string(),
                }
                .into()),
                Err(other) => Err(DirectorError::InstanceUpdateFailed {
                    job: job.name.clone(),
                    index: inst.index,
                    detail: other.to_string(),
                }
                .into()),
            },
        }
    }

    // ── Paths ──────────────────────────────────────────────────────

    async fn restart(
        &self,
        job: &JobPlan,
        inst: &InstancePlan,
        target: &Value,
        canary: bool,
    ) -> anyhow::Result<()> {
        let rec = inst.existing.as_ref().expect("restart without record");
        let vm_cid = rec.vm_cid.clone().expect("restart without vm");
        let vm = self
            .ctx
            .store
            .get_vm(&self.deployment, &vm_cid)?
            .ok_or_else(|| anyhow::anyhow!("vm row missing for {vm_cid}"))?;

        self.ctx.agents.call(&vm.agent_id, "stop", vec![]).await?;
        let disk_cid = self
            .transition_disk(&vm, rec.disk_cid.clone(), job.persistent_disk_mb)
            .await?;
        self.apply_and_watch(&vm, job, inst, target, canary).await?;
        self.persist(job, inst, target, vm.cid.clone(), disk_cid)?;
        Ok(())
    }

    async fn recreate(
        &self,
        job: &JobPlan,
        pool: &ResourcePoolPlan,
        inst: &InstancePlan,
        target: &Value,
        canary: bool,
    ) -> anyhow::Result<()> {
        let rec = inst.existing.as_ref().expect("recreate without record");
        let old_cid = rec.vm_cid.clone().expect("recreate without vm");
        let old_vm = self.ctx.store.get_vm(&self.deployment, &old_cid)?;

        // Teardown prologue.
        if let Some(old_vm) = &old_vm {
            self.ctx.agents.call(&old_vm.agent_id, "stop", vec![]).await?;
            if let Some(disk) = &rec.disk_cid {
                self.ctx
                    .agents
                    .call(&old_vm.agent_id, "unmount_disk", vec![json!(disk)])
                    .await?;
                self.ctx
                    .cloud
                    .detach_disk(&old_vm.cid, disk)
                    .await
                    .map_err(DirectorError::from)?;
            }
            self.ctx
                .cloud
                .delete_vm(&old_vm.cid)
                .await
                .map_err(DirectorError::from)?;
            self.ctx.store.delete_vm(&self.deployment, &old_vm.cid)?;
            // The old address goes back to the pool unless this instance
            // still owns it.
            if let Some(ip) = old_vm.ip.as_deref().and_then(|s| s.parse().ok()) {
                if !inst.ips.values().any(|held| *held == ip) {
                    release_ip(&self.nets, &pool.network, Some(ip));
                }
            }
        }

        self.place_on_new_vm(job, pool, inst, target, rec.disk_cid.clone(), canary)
            .await
    }

    async fn create(
        &self,
        job: &JobPlan,
        pool: &ResourcePoolPlan,
        inst: &InstancePlan,
        target: &Value,
        canary: bool,
    ) -> anyhow::Result<()> {
        let existing_disk = inst.existing.as_ref().and_then(|r| r.disk_cid.clone());
        self.place_on_new_vm(job, pool, inst, target, existing_disk, canary)
            .await
    }

    /// Shared tail of `recreate` and `new`: acquire a VM, settle the
    /// persistent disk, apply, start, watch, persist.
    async fn place_on_new_vm(
        &self,
        job: &JobPlan,
        pool: &ResourcePoolPlan,
        inst: &InstancePlan,
        target: &Value,
        existing_disk: Option<String>,
        canary: bool,
    ) -> anyhow::Result<()> {
        let vm = self.acquire_vm(job, pool, inst).await?;

        let disk_cid = match (existing_disk, job.persistent_disk_mb) {
            (Some(disk), Some(_)) => {
                self.ctx
                    .cloud
                    .attach_disk(&vm.cid, &disk)
                    .await
                    .map_err(DirectorError::from)?;
                self.ctx
                    .agents
                    .call(&vm.agent_id, "mount_disk", vec![json!(disk)])
                    .await?;
                // Migrate on the new VM when the size changed too.
                self.transition_disk(&vm, Some(disk), job.persistent_disk_mb)
                    .await?
            }
            // The disk is already detached (or was never attached); no
            // target means it goes away entirely.
            (Some(disk), None) => {
                self.ctx
                    .cloud
                    .delete_disk(&disk)
                    .await
                    .map_err(DirectorError::from)?;
                self.ctx.store.delete_disk(&self.deployment, &disk)?;
                None
            }
            (None, wanted) => self.transition_disk(&vm, None, wanted).await?,
        };

        self.apply_and_watch(&vm, job, inst, target, canary).await?;
        self.persist(job, inst, target, vm.cid.clone(), disk_cid)?;
        Ok(())
    }

    // ── Steps ──────────────────────────────────────────────────────

    /// Take an idle VM from the pool (re-pointing its network) or create
    /// one directly with the instance's settings.
    async fn acquire_vm(
        &self,
        job: &JobPlan,
        pool: &ResourcePoolPlan,
        inst: &InstancePlan,
    ) -> anyhow::Result<VmRecord> {
        let networks_spec = {
            let nets = self.nets.lock().unwrap();
            spec::networks_section(job, inst, &nets)
        };
        let primary_ip = inst.ips.get(job.primary_network()).copied();

        if let Some(mut vm) = self.idle.take(&pool.name) {
            self.ctx
                .cloud
                .configure_networks(&vm.cid, &networks_spec)
                .await
                .map_err(DirectorError::from)?;
            let old_ip = vm.ip.as_deref().and_then(|s| s.parse().ok());
            if old_ip != primary_ip {
                release_ip(&self.nets, &pool.network, old_ip);
            }
            vm.ip = primary_ip.map(|ip| ip.to_string());
            self.ctx.store.put_vm(&vm)?;
            debug!(cid = %vm.cid, job = %job.name, index = inst.index, "idle vm assigned");
            return Ok(vm);
        }

        // Pool dry (a concurrent updater took the spare): create directly
        // with the instance's own settings.
        let agent_id = Uuid::new_v4().to_string();
        let cid = self
            .ctx
            .cloud
            .create_vm(
                &agent_id,
                &pool.stemcell.cid,
                &pool.cloud_properties,
                &networks_spec,
                &pool.env,
            )
            .await
            .map_err(DirectorError::from)?;
        let vm = VmRecord {
            cid: cid.clone(),
            agent_id: agent_id.clone(),
            deployment: self.deployment.clone(),
            resource_pool: pool.name.clone(),
            ip: primary_ip.map(|ip| ip.to_string()),
        };
        self.ctx.store.put_vm(&vm)?;

        if let Err(e) = self.ctx.agents.ping_within(&agent_id, AGENT_BOOT_DEADLINE).await {
            let _ = self.ctx.cloud.delete_vm(&cid).await;
            let _ = self.ctx.store.delete_vm(&self.deployment, &cid);
            return Err(e.into());
        }
        debug!(%cid, job = %job.name, index = inst.index, "fresh vm created");
        Ok(vm)
    }

    /// Settle the persistent disk on a VM whose disk (if any) is attached
    /// and mounted. Returns the disk the instance ends up with.
    async fn transition_disk(
        &self,
        vm: &VmRecord,
        current: Option<String>,
        target_mb: Option<u64>,
    ) -> anyhow::Result<Option<String>> {
        match (current, target_mb) {
            (None, None) => Ok(None),

            // Grow a disk out of nothing.
            (None, Some(size)) => {
                let disk = self
                    .ctx
                    .cloud
                    .create_disk(size, &vm.cid)
                    .await
                    .map_err(DirectorError::from)?;
                self.ctx
                    .cloud
                    .attach_disk(&vm.cid, &disk)
                    .await
                    .map_err(DirectorError::from)?;
                self.ctx
                    .agents
                    .call(&vm.agent_id, "mount_disk", vec![json!(disk)])
                    .await?;
                self.ctx.store.put_disk(&DiskRecord {
                    cid: disk.clone(),
                    deployment: self.deployment.clone(),
                    size_mb: size,
                })?;
                Ok(Some(disk))
            }

            // Drop the disk entirely.
            (Some(disk), None) => {
                self.ctx
                    .agents
                    .call(&vm.agent_id, "unmount_disk", vec![json!(disk)])
                    .await?;
                self.ctx
                    .cloud
                    .detach_disk(&vm.cid, &disk)
                    .await
                    .map_err(DirectorError::from)?;
                self.ctx
                    .cloud
                    .delete_disk(&disk)
                    .await
                    .map_err(DirectorError::from)?;
                self.ctx.store.delete_disk(&self.deployment, &disk)?;
                Ok(None)
            }

            (Some(disk), Some(size)) => {
                let known = self.ctx.store.get_disk(&self.deployment, &disk)?;
                match known {
                    Some(record) if record.size_mb != size => {
                        self.migrate_disk(vm, &disk, size).await.map(Some)
                    }
                    _ => Ok(Some(disk)),
                }
            }
        }
    }

    /// Create a bigger disk, attach both, migrate, drop the old one. On
    /// any failure the new disk is removed and the old one stays.
    async fn migrate_disk(&self, vm: &VmRecord, old: &str, size: u64) -> anyhow::Result<String> {
        let mounted = self.ctx.agents.call(&vm.agent_id, "list_disk", vec![]).await?;
        if !mounted
            .as_array()
            .is_some_and(|disks| disks.iter().any(|d| d.as_str() == Some(old)))
        {
            warn!(%old, "old disk not reported mounted before migration");
        }

        let new = self
            .ctx
            .cloud
            .create_disk(size, &vm.cid)
            .await
            .map_err(DirectorError::from)?;
        info!(old, new = %new, size, "migrating persistent disk");

        let migrated: anyhow::Result<()> = async {
            self.ctx
                .cloud
                .attach_disk(&vm.cid, &new)
                .await
                .map_err(DirectorError::from)?;
            self.ctx
                .agents
                .call(&vm.agent_id, "mount_disk", vec![json!(new)])
                .await?;
            self.ctx
                .agents
                .call(&vm.agent_id, "migrate_disk", vec![json!(old), json!(new)])
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = migrated {
            warn!(error = %e, "disk migration failed, keeping old disk");
            let _ = self
                .ctx
                .agents
                .call(&vm.agent_id, "unmount_disk", vec![json!(new)])
                .await;
            let _ = self.ctx.cloud.detach_disk(&vm.cid, &new).await;
            let _ = self.ctx.cloud.delete_disk(&new).await;
            return Err(e);
        }

        // Old disk out, new disk in.
        self.ctx
            .agents
            .call(&vm.agent_id, "unmount_disk", vec![json!(old)])
            .await?;
        self.ctx
            .cloud
            .detach_disk(&vm.cid, old)
            .await
            .map_err(DirectorError::from)?;
        self.ctx
            .cloud
            .delete_disk(old)
            .await
            .map_err(DirectorError::from)?;
        self.ctx.store.delete_disk(&self.deployment, old)?;
        self.ctx.store.put_disk(&DiskRecord {
            cid: new.clone(),
            deployment: self.deployment.clone(),
            size_mb: size,
        })?;
        Ok(new)
    }

    async fn apply_and_watch(
        &self,
        vm: &VmRecord,
        job: &JobPlan,
        inst: &InstancePlan,
        target: &Value,
        canary: bool,
    ) -> anyhow::Result<()> {
        self.ctx
            .agents
            .call(&vm.agent_id, "apply", vec![target.clone()])
            .await?;
        self.ctx.agents.call(&vm.agent_id, "start", vec![]).await?;
        self.watch(&vm.agent_id, job, inst, &job.update, canary).await
    }

    /// Let at least the watch window elapse, then require `running`
    /// within a second window of the same length.
    async fn watch(
        &self,
        agent_id: &str,
        job: &JobPlan,
        inst: &InstancePlan,
        policy: &UpdatePolicy,
        canary: bool,
    ) -> anyhow::Result<()> {
        let window = if canary {
            policy.canary_watch_time
        } else {
            policy.update_watch_time
        };
        tokio::time::sleep(window).await;

        let deadline = Instant::now() + window.max(Duration::from_millis(10));
        let interval = (window / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        loop {
            let state = self.ctx.agents.call(agent_id, "get_state", vec![]).await?;
            let job_state = state["job_state"].as_str().unwrap_or("unknown");
            if job_state == "running" {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DirectorError::InstanceUpdateFailed {
                    job: job.name.clone(),
                    index: inst.index,
                    detail: format!("job state is {job_state} after watch window"),
                }
                .into());
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn persist(
        &self,
        job: &JobPlan,
        inst: &InstancePlan,
        target: &Value,
        vm_cid: String,
        disk_cid: Option<String>,
    ) -> anyhow::Result<()> {
        self.ctx.store.put_instance(&InstanceRecord {
            deployment: self.deployment.clone(),
            job: job.name.clone(),
            index: inst.index,
            state: target.clone(),
            vm_cid: Some(vm_cid),
            disk_cid,
            ips: inst.ips.values().map(|ip| ip.to_string()).collect(),
        })?;
        Ok(())
    }
}

/// Tear one instance down completely: stop, detach and delete its disk,
/// delete its VM, release its addresses, drop the rows. Agent failures
/// are tolerated (the VM may already be gone); cloud failures are not.
pub async fn delete_instance(
    ctx: &DeployContext,
    nets: Option<&SharedNets>,
    deployment: &str,
    rec: &InstanceRecord,
) -> anyhow::Result<()> {
    if let Some(vm_cid) = &rec.vm_cid {
        if let Some(vm) = ctx.store.get_vm(deployment, vm_cid)? {
            if let Err(e) = ctx.agents.call(&vm.agent_id, "stop", vec![]).await {
                warn!(agent_id = %vm.agent_id, error = %e, "stop before teardown failed");
            }
            if let Some(disk) = &rec.disk_cid {
                if let Err(e) = ctx
                    .agents
                    .call(&vm.agent_id, "unmount_disk", vec![json!(disk)])
                    .await
                {
                    warn!(error = %e, "unmount before teardown failed");
                }
                if let Err(e) = ctx.cloud.detach_disk(&vm.cid, disk).await {
                    warn!(error = %e, "detach before teardown failed");
                }
            }
            ctx.cloud.delete_vm(&vm.cid).await.map_err(DirectorError::from)?;
            ctx.store.delete_vm(deployment, &vm.cid)?;
            if let Some(nets) = nets {
                for ip in rec.ips.iter().filter_map(|s| s.parse().ok()) {
                    release_anywhere(nets, ip);
                }
            }
        }
    }
    if let Some(disk) = &rec.disk_cid {
        if let Err(e) = ctx.cloud.delete_disk(disk).await {
            warn!(%disk, error = %e, "disk deletion failed during teardown");
        }
        ctx.store.delete_disk(deployment, disk)?;
    }
    ctx.store.delete_instance(deployment, &rec.job, rec.index)?;
    info!(job = %rec.job, index = rec.index, "instance deleted");
    Ok(())
}

fn release_anywhere(nets: &SharedNets, ip: std::net::Ipv4Addr) {
    let mut nets = nets.lock().unwrap();
    for network in nets.values_mut() {
        if network.contains(ip) {
            network.release(ip);
            return;
        }
    }
}
