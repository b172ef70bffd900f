//! Plan compiler: reconcile the desired plan against database state.
//!
//! Adopts existing instances by (job, index), classifies each slot as
//! `no_change | restart | recreate | new`, binds addresses (reuse first,
//! then allocate), computes the obsolete set and the resource pool deltas.
//! Everything is materialized on the plan before any cloud call; the rest
//! of the update is pure execution.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;

use tracing::{debug, info};

use armada_core::DirectorError;
use armada_plan::{ChangeKind, InstancePlan, JobPlan, Network, NetworkKind, Plan, ResourcePoolPlan};
use armada_state::{DeploymentRecord, InstanceRecord, VmRecord};

use crate::context::DeployContext;
use crate::spec;

/// Marker pool name for transient compilation VMs.
pub const COMPILATION_POOL: &str = "compilation";

/// What binding decided beyond the per-instance flags on the plan.
#[derive(Debug)]
pub struct Binding {
    /// Instances in the database but absent from the plan.
    pub obsolete: Vec<InstanceRecord>,
    /// Unbound VMs per resource pool.
    pub idle_vms: HashMap<String, Vec<VmRecord>>,
    /// VMs the job updaters will draw per pool (new + recreate).
    pub vm_demand: HashMap<String, u32>,
    /// Idle VMs each pool should hold once the update is done.
    pub idle_target: HashMap<String, u32>,
}

pub fn bind(ctx: &DeployContext, plan: &mut Plan) -> anyhow::Result<Binding> {
    let store = &ctx.store;

    // Load or create the deployment row.
    if store.get_deployment(&plan.name)?.is_none() {
        let stemcells: BTreeSet<String> = plan
            .resource_pools
            .values()
            .map(|p| p.stemcell.table_key())
            .collect();
        store.put_deployment(&DeploymentRecord {
            name: plan.name.clone(),
            manifest: plan.manifest_text.clone(),
            releases: vec![plan.release.table_key()],
            stemcells: stemcells.into_iter().collect(),
        })?;
        debug!(deployment = %plan.name, "deployment row created");
    }

    let existing = store.list_instances(&plan.name)?;
    let existing_map: HashMap<(String, u32), InstanceRecord> = existing
        .iter()
        .map(|rec| ((rec.job.clone(), rec.index), rec.clone()))
        .collect();
    let vms = store.list_vms(&plan.name)?;
    let bound: HashSet<&str> = existing.iter().filter_map(|i| i.vm_cid.as_deref()).collect();

    let Plan {
        ref name,
        ref mut networks,
        ref resource_pools,
        ref mut jobs,
        ..
    } = *plan;

    // Idle VMs keep their network reservations.
    let mut idle_vms: HashMap<String, Vec<VmRecord>> = HashMap::new();
    for vm in vms {
        if bound.contains(vm.cid.as_str()) || vm.resource_pool == COMPILATION_POOL {
            continue;
        }
        if let Some(ip) = vm.ip.as_deref().and_then(|s| s.parse::<Ipv4Addr>().ok()) {
            if let Some(pool) = resource_pools.get(&vm.resource_pool) {
                if let Some(network) = networks.get_mut(&pool.network) {
                    network.reserve_existing(ip);
                }
            }
        }
        idle_vms.entry(vm.resource_pool.clone()).or_default().push(vm);
    }

    let mut issues = Vec::new();
    let mut claimed: HashSet<(String, u32)> = HashSet::new();

    for job in jobs.iter_mut() {
        let Some(pool) = resource_pools.get(&job.resource_pool) else {
            continue;
        };
        let job_view = job.clone();

        for inst in job.instances.iter_mut() {
            let key = (job_view.name.clone(), inst.index);
            if let Some(rec) = existing_map.get(&key) {
                inst.existing = Some(rec.clone());
                claimed.insert(key);
            }

            bind_instance_ips(inst, &job_view, networks, &mut issues);

            let change = match &inst.existing {
                None => ChangeKind::New,
                // An instance row without a VM needs one regardless.
                Some(rec) if rec.vm_cid.is_none() => ChangeKind::New,
                Some(rec) => classify(&job_view, pool, inst, networks, rec),
            };
            inst.change = change;
            debug!(
                job = %job_view.name,
                index = inst.index,
                change = ?inst.change,
                "instance bound"
            );
        }
    }

    if !issues.is_empty() {
        return Err(DirectorError::ValidationFailed(issues).into());
    }

    let obsolete: Vec<InstanceRecord> = existing
        .into_iter()
        .filter(|rec| !claimed.contains(&(rec.job.clone(), rec.index)))
        .collect();

    // Pool deltas.
    let mut vm_demand: HashMap<String, u32> = HashMap::new();
    let mut planned: HashMap<String, u32> = HashMap::new();
    for job in jobs.iter() {
        let pool = job.resource_pool.clone();
        *planned.entry(pool.clone()).or_default() += job.instances.len() as u32;
        let demand = job
            .instances
            .iter()
            .filter(|i| matches!(i.change, ChangeKind::New | ChangeKind::Recreate))
            .count() as u32;
        if demand > 0 {
            *vm_demand.entry(pool).or_default() += demand;
        }
    }
    let idle_target: HashMap<String, u32> = resource_pools
        .values()
        .map(|pool| {
            let used = planned.get(&pool.name).copied().unwrap_or(0);
            (pool.name.clone(), pool.size.saturating_sub(used))
        })
        .collect();

    info!(
        deployment = %name,
        obsolete = obsolete.len(),
        "plan bound"
    );
    Ok(Binding {
        obsolete,
        idle_vms,
        vm_demand,
        idle_target,
    })
}

/// Reuse the instance's held address when it is still valid, allocate
/// otherwise. Static addresses were pinned per index at plan build.
fn bind_instance_ips(
    inst: &mut InstancePlan,
    job: &JobPlan,
    networks: &mut HashMap<String, Network>,
    issues: &mut Vec<String>,
) {
    for job_network in &job.networks {
        if inst.ips.contains_key(&job_network.network) {
            continue;
        }
        let Some(network) = networks.get_mut(&job_network.network) else {
            continue;
        };
        if network.kind != NetworkKind::Manual {
            continue;
        }

        let kept = inst.existing.as_ref().and_then(|rec| {
            rec.ips
                .iter()
                .filter_map(|s| s.parse::<Ipv4Addr>().ok())
                .find(|ip| network.contains(*ip))
        });
        let ip = match kept {
            Some(ip) if network.reserve_existing(ip) => Some(ip),
            _ => network.allocate_dynamic(),
        };
        match ip {
            Some(ip) => {
                inst.ips.insert(job_network.network.clone(), ip);
            }
            None => issues.push(format!(
                "network {} exhausted binding {}/{}",
                job_network.network, job.name, inst.index
            )),
        }
    }
}

/// Compare target sections against the instance's applied state.
fn classify(
    job: &JobPlan,
    pool: &ResourcePoolPlan,
    inst: &InstancePlan,
    networks: &HashMap<String, Network>,
    rec: &InstanceRecord,
) -> ChangeKind {
    let state = &rec.state;

    // A different address, netmask or network shape needs a new VM, as
    // does a stemcell or VM-shape change.
    if state["networks"] != spec::networks_section(job, inst, networks) {
        return ChangeKind::Recreate;
    }
    if state["resource_pool"] != spec::resource_pool_section(pool) {
        return ChangeKind::Recreate;
    }

    let disk_target = job.persistent_disk_mb.unwrap_or(0);
    let disk_current = state["persistent_disk"].as_u64().unwrap_or(0);
    if disk_target != disk_current {
        // The VM survives a disk resize; the updater migrates the data.
        return ChangeKind::Restart;
    }
    if state["job"] != spec::job_section(&job.template) {
        return ChangeKind::Restart;
    }
    if !spec::packages_identity_matches(state, &job.packages) {
        return ChangeKind::Restart;
    }
    ChangeKind::NoChange
}
