//! The desired-state plan.
//!
//! `Plan::build` turns a parsed manifest plus pure values loaded from the
//! database (release content, stemcells) into the validated structure the
//! plan compiler binds. Validation aggregates every issue into one
//! `validation_failed` instead of stopping at the first.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use armada_core::{DirectorError, DirectorResult};
use armada_state::{InstanceRecord, PackageRecord, ReleaseVersionRecord, StemcellRecord, TemplateRecord};

use crate::manifest::{JobSpec, Manifest, UpdateOverride, UpdateSpec};
use crate::network::Network;

/// Release content loaded from the database, as pure values.
#[derive(Debug, Clone)]
pub struct ReleaseContent {
    pub version: ReleaseVersionRecord,
    pub packages: Vec<PackageRecord>,
    pub templates: Vec<TemplateRecord>,
}

impl ReleaseContent {
    pub fn package(&self, name: &str) -> Option<&PackageRecord> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn template(&self, name: &str) -> Option<&TemplateRecord> {
        self.templates.iter().find(|t| t.name == name)
    }
}

/// What the updater must do to one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    NoChange,
    Restart,
    Recreate,
    New,
}

/// Resolved update policy for one job.
#[derive(Debug, Clone)]
pub struct UpdatePolicy {
    pub canaries: u32,
    pub max_in_flight: u32,
    pub canary_watch_time: Duration,
    pub update_watch_time: Duration,
}

impl UpdatePolicy {
    pub fn resolve(global: &UpdateSpec, job: Option<&UpdateOverride>) -> Self {
        let pick = |o: Option<u32>, g: u32| o.unwrap_or(g);
        let pick_ms =
            |o: Option<u64>, g: u64| Duration::from_millis(o.unwrap_or(g));
        let job = job.cloned().unwrap_or_default();
        Self {
            canaries: pick(job.canaries, global.canaries),
            max_in_flight: pick(job.max_in_flight, global.max_in_flight).max(1),
            canary_watch_time: pick_ms(job.canary_watch_time, global.canary_watch_time),
            update_watch_time: pick_ms(job.update_watch_time, global.update_watch_time),
        }
    }
}

/// One instance slot, bound by the plan compiler.
#[derive(Debug, Clone)]
pub struct InstancePlan {
    pub job: String,
    pub index: u32,
    pub change: ChangeKind,
    /// Bound addresses per network name.
    pub ips: BTreeMap<String, Ipv4Addr>,
    /// The database row adopted for this slot, if any.
    pub existing: Option<InstanceRecord>,
}

#[derive(Debug, Clone)]
pub struct JobNetworkPlan {
    pub network: String,
    pub static_ips: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone)]
pub struct JobPlan {
    pub name: String,
    pub template: TemplateRecord,
    /// Transitive closure of the template's packages, sorted by name.
    pub packages: Vec<PackageRecord>,
    pub resource_pool: String,
    pub persistent_disk_mb: Option<u64>,
    pub networks: Vec<JobNetworkPlan>,
    pub update: UpdatePolicy,
    pub instances: Vec<InstancePlan>,
}

impl JobPlan {
    /// The network an instance's primary address comes from.
    pub fn primary_network(&self) -> &str {
        &self.networks[0].network
    }
}

#[derive(Debug, Clone)]
pub struct ResourcePoolPlan {
    pub name: String,
    pub stemcell: StemcellRecord,
    pub network: String,
    pub size: u32,
    pub cloud_properties: Value,
    pub env: Value,
}

#[derive(Debug, Clone)]
pub struct CompilationPlan {
    pub workers: usize,
    pub network: String,
    pub cloud_properties: Value,
}

/// Validated desired state for one deployment.
#[derive(Debug)]
pub struct Plan {
    pub name: String,
    pub manifest_text: String,
    pub release: ReleaseVersionRecord,
    pub networks: HashMap<String, Network>,
    pub resource_pools: HashMap<String, ResourcePoolPlan>,
    pub compilation: CompilationPlan,
    pub jobs: Vec<JobPlan>,
}

impl Plan {
    pub fn build(
        manifest: &Manifest,
        manifest_text: &str,
        release: &ReleaseContent,
        stemcells: &HashMap<String, StemcellRecord>,
    ) -> DirectorResult<Plan> {
        let mut issues = Vec::new();

        // Networks.
        let mut networks: HashMap<String, Network> = HashMap::new();
        for spec in &manifest.networks {
            if networks.contains_key(&spec.name) {
                issues.push(format!("duplicate network: {}", spec.name));
                continue;
            }
            match Network::from_spec(spec) {
                Ok(network) => {
                    networks.insert(spec.name.clone(), network);
                }
                Err(mut errs) => issues.append(&mut errs),
            }
        }

        // Resource pools.
        let mut resource_pools = HashMap::new();
        for spec in &manifest.resource_pools {
            if resource_pools.contains_key(&spec.name) {
                issues.push(format!("duplicate resource pool: {}", spec.name));
                continue;
            }
            if !networks.contains_key(&spec.network) {
                issues.push(format!(
                    "resource pool {} references unknown network {}",
                    spec.name, spec.network
                ));
            }
            let stemcell_key = format!("{}/{}", spec.stemcell.name, spec.stemcell.version);
            match stemcells.get(&stemcell_key) {
                Some(stemcell) => {
                    resource_pools.insert(
                        spec.name.clone(),
                        ResourcePoolPlan {
                            name: spec.name.clone(),
                            stemcell: stemcell.clone(),
                            network: spec.network.clone(),
                            size: spec.size,
                            cloud_properties: spec.cloud_properties.clone(),
                            env: spec.env.clone(),
                        },
                    );
                }
                None => issues.push(format!("stemcell {stemcell_key} not uploaded")),
            }
        }

        // Compilation pool.
        if !networks.contains_key(&manifest.compilation.network) {
            issues.push(format!(
                "compilation references unknown network {}",
                manifest.compilation.network
            ));
        }
        let compilation = CompilationPlan {
            workers: manifest.compilation.workers.max(1),
            network: manifest.compilation.network.clone(),
            cloud_properties: manifest.compilation.cloud_properties.clone(),
        };

        // Jobs.
        let mut jobs = Vec::new();
        for spec in &manifest.jobs {
            if jobs.iter().any(|j: &JobPlan| j.name == spec.name) {
                issues.push(format!("duplicate job: {}", spec.name));
                continue;
            }
            if let Some(job) = build_job(spec, manifest, release, &mut networks, &mut issues) {
                jobs.push(job);
            }
        }

        // Pool capacity: size must cover every referencing job's instances.
        let mut demand: HashMap<&str, u32> = HashMap::new();
        for job in &jobs {
            *demand.entry(job.resource_pool.as_str()).or_default() += job.instances.len() as u32;
        }
        for (pool_name, needed) in &demand {
            if let Some(pool) = resource_pools.get(*pool_name) {
                if pool.size < *needed {
                    issues.push(format!(
                        "resource pool {pool_name} has size {} but jobs need {needed}",
                        pool.size
                    ));
                }
            }
        }

        if !issues.is_empty() {
            return Err(DirectorError::ValidationFailed(issues));
        }

        debug!(deployment = %manifest.name, jobs = jobs.len(), "plan built");
        Ok(Plan {
            name: manifest.name.clone(),
            manifest_text: manifest_text.to_string(),
            release: release.version.clone(),
            networks,
            resource_pools,
            compilation,
            jobs,
        })
    }

    /// All (package, stemcell) pairs the deployment requires, deduplicated.
    pub fn required_compilations(&self) -> Vec<(PackageRecord, StemcellRecord)> {
        let mut seen = BTreeMap::new();
        for job in &self.jobs {
            let Some(pool) = self.resource_pools.get(&job.resource_pool) else {
                continue;
            };
            for package in &job.packages {
                let key = format!("{}:{}", package.name, pool.stemcell.table_key());
                seen.entry(key)
                    .or_insert_with(|| (package.clone(), pool.stemcell.clone()));
            }
        }
        seen.into_values().collect()
    }
}

fn build_job(
    spec: &JobSpec,
    manifest: &Manifest,
    release: &ReleaseContent,
    networks: &mut HashMap<String, Network>,
    issues: &mut Vec<String>,
) -> Option<JobPlan> {
    let mut ok = true;

    let template = match release.template(&spec.template) {
        Some(t) => Some(t.clone()),
        None => {
            issues.push(format!(
                "job {} references unknown template {}",
                spec.name, spec.template
            ));
            ok = false;
            None
        }
    };

    let packages = template
        .as_ref()
        .map(|t| package_closure(&spec.name, t, release, issues))
        .unwrap_or_default();

    if !manifest.resource_pools.iter().any(|p| p.name == spec.resource_pool) {
        issues.push(format!(
            "job {} references unknown resource pool {}",
            spec.name, spec.resource_pool
        ));
        ok = false;
    }

    if spec.networks.is_empty() {
        issues.push(format!("job {} declares no networks", spec.name));
        ok = false;
    }
    if spec.persistent_disk == Some(0) {
        issues.push(format!("job {} declares a zero-size persistent disk", spec.name));
        ok = false;
    }

    // Static addresses: parse, range-check, uniqueness-check, and pin each
    // index to its address.
    let mut network_plans = Vec::new();
    for job_network in &spec.networks {
        let mut static_ips = Vec::new();
        match networks.get_mut(&job_network.name) {
            Some(network) => {
                if !job_network.static_ips.is_empty()
                    && job_network.static_ips.len() != spec.instances as usize
                {
                    issues.push(format!(
                        "job {} needs {} static ips on {}, got {}",
                        spec.name,
                        spec.instances,
                        job_network.name,
                        job_network.static_ips.len()
                    ));
                    ok = false;
                }
                for text in &job_network.static_ips {
                    match text.parse::<Ipv4Addr>() {
                        Ok(ip) => match network.reserve_static(ip) {
                            Ok(()) => static_ips.push(ip),
                            Err(e) => {
                                issues.push(format!("job {}: {e}", spec.name));
                                ok = false;
                            }
                        },
                        Err(_) => {
                            issues.push(format!("job {}: bad static ip {text}", spec.name));
                            ok = false;
                        }
                    }
                }
            }
            None => {
                issues.push(format!(
                    "job {} references unknown network {}",
                    spec.name, job_network.name
                ));
                ok = false;
            }
        }
        network_plans.push(JobNetworkPlan {
            network: job_network.name.clone(),
            static_ips,
        });
    }

    if !ok {
        return None;
    }
    let template = template?;

    let instances = (0..spec.instances)
        .map(|index| {
            let mut ips = BTreeMap::new();
            for network_plan in &network_plans {
                if let Some(ip) = network_plan.static_ips.get(index as usize) {
                    ips.insert(network_plan.network.clone(), *ip);
                }
            }
            InstancePlan {
                job: spec.name.clone(),
                index,
                change: ChangeKind::New,
                ips,
                existing: None,
            }
        })
        .collect();

    Some(JobPlan {
        name: spec.name.clone(),
        template,
        packages,
        resource_pool: spec.resource_pool.clone(),
        persistent_disk_mb: spec.persistent_disk,
        networks: network_plans,
        update: UpdatePolicy::resolve(&manifest.update, spec.update.as_ref()),
        instances,
    })
}

/// Transitive closure of a template's packages, sorted by name.
fn package_closure(
    job: &str,
    template: &TemplateRecord,
    release: &ReleaseContent,
    issues: &mut Vec<String>,
) -> Vec<PackageRecord> {
    let mut closure: BTreeMap<String, PackageRecord> = BTreeMap::new();
    let mut stack: Vec<String> = template.packages.clone();

    while let Some(name) = stack.pop() {
        if closure.contains_key(&name) {
            continue;
        }
        match release.package(&name) {
            Some(package) => {
                stack.extend(package.dependencies.iter().cloned());
                closure.insert(name, package.clone());
            }
            None => issues.push(format!(
                "job {job}: template {} requires missing package {name}",
                template.name
            )),
        }
    }
    closure.into_values().collect()
}
