//! Resource pool updater.
//!
//! Grows idle VM sets before job updates so instance updaters can draw
//! from them, and shrinks them to the post-update target afterwards.
//! Creation per VM: fresh agent id, `create_vm`, bounded `ping` wait, a
//! minimal baseline `apply({})`, then into the idle set.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use armada_core::DirectorError;
use armada_plan::{Plan, ResourcePoolPlan};
use armada_state::VmRecord;

use crate::context::{DeployContext, SharedNets};
use crate::tasks::AGENT_BOOT_DEADLINE;

/// Idle VMs per resource pool, shared between the pool updater and the
/// instance updaters running in parallel.
pub struct IdleVms {
    inner: Mutex<HashMap<String, Vec<VmRecord>>>,
}

impl IdleVms {
    pub fn new(initial: HashMap<String, Vec<VmRecord>>) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub fn take(&self, pool: &str) -> Option<VmRecord> {
        self.inner.lock().unwrap().get_mut(pool).and_then(Vec::pop)
    }

    pub fn put(&self, pool: &str, vm: VmRecord) {
        self.inner
            .lock()
            .unwrap()
            .entry(pool.to_string())
            .or_default()
            .push(vm);
    }

    pub fn count(&self, pool: &str) -> usize {
        self.inner.lock().unwrap().get(pool).map_or(0, Vec::len)
    }
}

/// Create idle VMs until each pool can cover the updaters' demand.
pub async fn grow(
    ctx: &DeployContext,
    plan: &Plan,
    nets: &SharedNets,
    idle: &IdleVms,
    demand: &HashMap<String, u32>,
) -> anyhow::Result<()> {
    for (pool_name, needed) in demand {
        let Some(pool) = plan.resource_pools.get(pool_name) else {
            continue;
        };
        while (idle.count(pool_name) as u32) < *needed {
            let vm = create_pool_vm(ctx, &plan.name, pool, nets).await?;
            idle.put(pool_name, vm);
        }
        info!(pool = %pool_name, idle = idle.count(pool_name), "resource pool grown");
    }
    Ok(())
}

/// Delete idle VMs above each pool's post-update target.
pub async fn shrink(
    ctx: &DeployContext,
    plan: &Plan,
    nets: &SharedNets,
    idle: &IdleVms,
    idle_target: &HashMap<String, u32>,
) -> anyhow::Result<()> {
    for pool in plan.resource_pools.values() {
        let target = idle_target.get(&pool.name).copied().unwrap_or(0);
        while idle.count(&pool.name) as u32 > target {
            let Some(vm) = idle.take(&pool.name) else {
                break;
            };
            delete_pool_vm(ctx, &plan.name, nets, &pool.network, &vm).await?;
        }
        debug!(pool = %pool.name, idle = idle.count(&pool.name), "resource pool shrunk");
    }
    Ok(())
}

/// Create one pool VM: dynamic address, cloud call, agent ping, baseline
/// apply. On an unresponsive agent the VM is deleted again.
pub async fn create_pool_vm(
    ctx: &DeployContext,
    deployment: &str,
    pool: &ResourcePoolPlan,
    nets: &SharedNets,
) -> anyhow::Result<VmRecord> {
    let agent_id = Uuid::new_v4().to_string();
    let (ip, settings) = {
        let mut nets = nets.lock().unwrap();
        let network = nets.get_mut(&pool.network).ok_or_else(|| {
            DirectorError::BadManifest(format!("pool network {} missing", pool.network))
        })?;
        let ip = network.allocate_dynamic();
        (ip, network.settings_for(ip))
    };
    let networks_spec = json!({ pool.network.clone(): settings });

    let cid = ctx
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
        deployment: deployment.to_string(),
        resource_pool: pool.name.clone(),
        ip: ip.map(|i| i.to_string()),
    };
    ctx.store.put_vm(&vm)?;

    if let Err(e) = ctx.agents.ping_within(&agent_id, AGENT_BOOT_DEADLINE).await {
        warn!(%cid, error = %e, "agent never came up, deleting vm");
        let _ = ctx.cloud.delete_vm(&cid).await;
        let _ = ctx.store.delete_vm(deployment, &cid);
        release_ip(nets, &pool.network, ip);
        return Err(e.into());
    }

    // Baseline apply establishes an empty configuration on the fresh VM.
    ctx.agents.call(&agent_id, "apply", vec![json!({})]).await?;
    debug!(%cid, %agent_id, pool = %pool.name, "pool vm ready");
    Ok(vm)
}

/// Delete an idle VM and release its network reservation.
pub async fn delete_pool_vm(
    ctx: &DeployContext,
    deployment: &str,
    nets: &SharedNets,
    network_name: &str,
    vm: &VmRecord,
) -> anyhow::Result<()> {
    ctx.cloud.delete_vm(&vm.cid).await.map_err(DirectorError::from)?;
    ctx.store.delete_vm(deployment, &vm.cid)?;
    release_ip(
        nets,
        network_name,
        vm.ip.as_deref().and_then(|s| s.parse().ok()),
    );
    debug!(cid = %vm.cid, "idle vm deleted");
    Ok(())
}

pub(crate) fn release_ip(nets: &SharedNets, network_name: &str, ip: Option<Ipv4Addr>) {
    if let Some(ip) = ip {
        if let Some(network) = nets.lock().unwrap().get_mut(network_name) {
            network.release(ip);
        }
    }
}
