//! Package compiler.
//!
//! Builds every (package, stemcell) pair the bound plan needs, honoring
//! compile-time dependencies: tasks form a DAG and a bounded worker pool
//! drives the ready-set in the order tasks become ready. Each worker takes
//! the per-pair compile lock, re-checks the cache under it (concurrent
//! deployments deduplicate here), compiles on a transient VM from the
//! compilation pool, and persists the artifact. Re-running on identical
//! inputs performs zero agent work.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use armada_core::{hex_digest, DirectorError};
use armada_lock::{names as lock_names, LockGuard};
use armada_plan::Plan;
use armada_state::{compiled_package_key, CompiledPackageRecord, PackageRecord, StemcellRecord, VmRecord};
use armada_workers::{CancelToken, WorkerPool};

use crate::context::{DeployContext, SharedNets};
use crate::tasks::AGENT_BOOT_DEADLINE;

/// Compiled artifacts keyed by (package name, stemcell key).
pub type CompiledMap = HashMap<(String, String), CompiledPackageRecord>;

/// Digest over the identities of a package's transitive compile-time
/// dependencies. Part of the compiled-package cache key.
pub fn dependency_key(package: &PackageRecord, by_name: &HashMap<&str, &PackageRecord>) -> String {
    let mut identities: BTreeMap<String, (String, String)> = BTreeMap::new();
    let mut stack: Vec<String> = package.dependencies.clone();
    while let Some(name) = stack.pop() {
        if identities.contains_key(&name) {
            continue;
        }
        if let Some(dep) = by_name.get(name.as_str()) {
            stack.extend(dep.dependencies.iter().cloned());
            identities.insert(name, (dep.version.clone(), dep.fingerprint.clone()));
        }
    }
    let flat: Vec<(&String, &(String, String))> = identities.iter().collect();
    hex_digest(&serde_json::to_vec(&flat).unwrap_or_default())
}

/// Transitive dependency names of a package, sorted.
fn transitive_deps(package: &PackageRecord, by_name: &HashMap<&str, &PackageRecord>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut stack: Vec<String> = package.dependencies.clone();
    while let Some(name) = stack.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        if let Some(dep) = by_name.get(name.as_str()) {
            stack.extend(dep.dependencies.iter().cloned());
        }
    }
    let mut names: Vec<String> = seen.into_iter().collect();
    names.sort();
    names
}

type TaskKey = (String, String);

#[derive(Clone)]
struct CompileTask {
    package: PackageRecord,
    stemcell: StemcellRecord,
    dep_key: String,
    /// Transitive dependency names, for the agent's deps argument.
    all_deps: Vec<String>,
}

impl CompileTask {
    fn key(&self) -> TaskKey {
        (self.package.name.clone(), self.stemcell.table_key())
    }
}

/// Ready-set scheduler. Tasks move to `ready` as their in-DAG
/// dependencies complete, in the order they become ready.
struct Sched {
    ready: VecDeque<CompileTask>,
    blocked: Vec<(CompileTask, HashSet<TaskKey>)>,
    remaining: usize,
    in_flight: usize,
    failed: bool,
}

impl Sched {
    fn complete(&mut self, key: &TaskKey) {
        self.remaining -= 1;
        self.in_flight -= 1;
        let mut index = 0;
        while index < self.blocked.len() {
            self.blocked[index].1.remove(key);
            if self.blocked[index].1.is_empty() {
                let (task, _) = self.blocked.remove(index);
                self.ready.push_back(task);
            } else {
                index += 1;
            }
        }
    }

    fn fail(&mut self) {
        self.in_flight -= 1;
        self.failed = true;
    }
}

/// Compile everything the plan requires. Returns the full artifact map,
/// cached entries included.
pub async fn compile_packages(
    ctx: &DeployContext,
    plan: &Plan,
    nets: &SharedNets,
    cancel: &CancelToken,
) -> anyhow::Result<CompiledMap> {
    let mut by_name: HashMap<&str, &PackageRecord> = HashMap::new();
    for job in &plan.jobs {
        for package in &job.packages {
            by_name.insert(package.name.as_str(), package);
        }
    }

    let results: Arc<Mutex<CompiledMap>> = Arc::new(Mutex::new(CompiledMap::new()));
    let mut tasks: Vec<CompileTask> = Vec::new();

    for (package, stemcell) in plan.required_compilations() {
        let dep_key = dependency_key(&package, &by_name);
        let cache_key = compiled_package_key(
            &package.fingerprint,
            &stemcell.name,
            &stemcell.version,
            &dep_key,
        );
        let pair = (package.name.clone(), stemcell.table_key());
        if let Some(hit) = ctx.store.get_compiled_package(&cache_key)? {
            debug!(package = %package.name, stemcell = %stemcell.table_key(), "compiled package cached");
            results.lock().unwrap().insert(pair, hit);
            continue;
        }
        let all_deps = transitive_deps(&package, &by_name);
        tasks.push(CompileTask {
            package,
            stemcell,
            dep_key,
            all_deps,
        });
    }

    if tasks.is_empty() {
        return Ok(Arc::try_unwrap(results).unwrap().into_inner().unwrap());
    }
    info!(pending = tasks.len(), workers = plan.compilation.workers, "compiling packages");

    // DAG edges: a task waits on tasks for its direct dependencies on the
    // same stemcell. Cached dependencies are already in `results`.
    let task_keys: HashSet<TaskKey> = tasks.iter().map(|t| t.key()).collect();
    let mut ready = VecDeque::new();
    let mut blocked = Vec::new();
    for task in tasks {
        let waiting: HashSet<TaskKey> = task
            .package
            .dependencies
            .iter()
            .map(|dep| (dep.clone(), task.stemcell.table_key()))
            .filter(|key| task_keys.contains(key))
            .collect();
        if waiting.is_empty() {
            ready.push_back(task);
        } else {
            blocked.push((task, waiting));
        }
    }
    let total = ready.len() + blocked.len();
    let sched = Arc::new(Mutex::new(Sched {
        ready,
        blocked,
        remaining: total,
        in_flight: 0,
        failed: false,
    }));
    let notify = Arc::new(Notify::new());

    let vm_pool = Arc::new(CompileVmPool::new(ctx.clone(), plan, nets.clone()));
    let mut pool = WorkerPool::new(plan.compilation.workers).with_cancel(cancel.clone());

    let mut stuck_error = None;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let next = {
            let mut sched = sched.lock().unwrap();
            if sched.remaining == 0 || sched.failed {
                break;
            }
            if sched.ready.is_empty() && sched.in_flight == 0 {
                // Nothing runnable and nothing running: the remaining
                // tasks wait on each other.
                let stuck: Vec<&str> = sched
                    .blocked
                    .iter()
                    .map(|(t, _)| t.package.name.as_str())
                    .collect();
                stuck_error = Some(DirectorError::CompilationFailed {
                    package: stuck.join(", "),
                    detail: "circular package dependencies".to_string(),
                });
                break;
            }
            let popped = sched.ready.pop_front();
            if popped.is_some() {
                sched.in_flight += 1;
            }
            popped
        };
        match next {
            Some(task) => {
                let unit = compile_unit(
                    ctx.clone(),
                    task,
                    Arc::clone(&vm_pool),
                    Arc::clone(&results),
                    Arc::clone(&sched),
                    Arc::clone(&notify),
                );
                if !pool.spawn(unit).await {
                    break;
                }
            }
            None => notify.notified().await,
        }
    }

    let outcome = pool.wait().await;
    vm_pool.cleanup().await;
    outcome?;
    if let Some(stuck) = stuck_error {
        return Err(stuck.into());
    }

    Ok(Arc::try_unwrap(results)
        .expect("compile workers done")
        .into_inner()
        .unwrap())
}

async fn compile_one(
    ctx: &DeployContext,
    task: &CompileTask,
    vm_pool: &CompileVmPool,
    results: &Mutex<CompiledMap>,
) -> anyhow::Result<CompiledPackageRecord> {
    let stemcell_key = task.stemcell.table_key();
    let lock_name = lock_names::compile(&task.package.name, &stemcell_key);
    let _lock = LockGuard::acquire(&ctx.store, &lock_name, ctx.locks.clone()).await?;

    // Another deployment may have compiled this while we queued.
    let cache_key = compiled_package_key(
        &task.package.fingerprint,
        &task.stemcell.name,
        &task.stemcell.version,
        &task.dep_key,
    );
    if let Some(hit) = ctx.store.get_compiled_package(&cache_key)? {
        debug!(package = %task.package.name, "compiled under lock by someone else");
        return Ok(hit);
    }

    let deps_value = {
        let results = results.lock().unwrap();
        let mut deps = serde_json::Map::new();
        for name in &task.all_deps {
            if let Some(record) = results.get(&(name.clone(), stemcell_key.clone())) {
                deps.insert(
                    name.clone(),
                    json!({
                        "version": record.package_version,
                        "blob_id": record.blob_id,
                        "digest": record.digest,
                    }),
                );
            }
        }
        Value::Object(deps)
    };

    let vm = vm_pool.acquire(&task.stemcell).await?;
    debug!(vm = %vm.cid, package = %task.package.name, "compiling");
    let compiled = run_agent_compile(ctx, &vm, task, deps_value).await;
    vm_pool.release(vm).await;

    let value = compiled.map_err(|e| DirectorError::CompilationFailed {
        package: task.package.name.clone(),
        detail: e.to_string(),
    })?;
    let result = &value["result"];
    let blob_id = result["blob_id"].as_str().unwrap_or_default().to_string();
    let digest = result["digest"].as_str().unwrap_or_default().to_string();
    if blob_id.is_empty() {
        return Err(DirectorError::CompilationFailed {
            package: task.package.name.clone(),
            detail: "agent returned no artifact".to_string(),
        }
        .into());
    }

    let record = CompiledPackageRecord {
        package_name: task.package.name.clone(),
        package_version: task.package.version.clone(),
        fingerprint: task.package.fingerprint.clone(),
        stemcell_name: task.stemcell.name.clone(),
        stemcell_version: task.stemcell.version.clone(),
        dependency_key: task.dep_key.clone(),
        blob_id,
        digest,
    };
    ctx.store.put_compiled_package(&record)?;
    info!(package = %task.package.name, stemcell = %stemcell_key, "package compiled");
    Ok(record)
}

async fn run_agent_compile(
    ctx: &DeployContext,
    vm: &CompileVm,
    task: &CompileTask,
    deps: Value,
) -> Result<Value, DirectorError> {
    // No director-side deadline: long compiles are bounded by the agent's
    // own heartbeat, not ours.
    let handle = ctx
        .agents
        .call_opt(
            &vm.agent_id,
            "compile_package",
            vec![
                json!(task.package.blob_id),
                json!(task.package.digest),
                json!(task.package.name),
                json!(task.package.version),
                deps,
            ],
            None,
        )
        .await?;
    match armada_bus::AgentTaskRef::from_value(&handle) {
        Some(task_ref) => ctx.agents.wait_task(&vm.agent_id, &task_ref.agent_task_id).await,
        None => Ok(handle),
    }
}

fn compile_unit(
    ctx: DeployContext,
    task: CompileTask,
    vm_pool: Arc<CompileVmPool>,
    results: Arc<Mutex<CompiledMap>>,
    sched: Arc<Mutex<Sched>>,
    notify: Arc<Notify>,
) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static {
    async move {
        let key = task.key();
        match compile_one(&ctx, &task, &vm_pool, &results).await {
            Ok(record) => {
                results.lock().unwrap().insert(key.clone(), record);
                sched.lock().unwrap().complete(&key);
                notify.notify_one();
                Ok(())
            }
            Err(e) => {
                sched.lock().unwrap().fail();
                notify.notify_one();
                Err(e)
            }
        }
    }
}

// ── Compilation VM pool ────────────────────────────────────────────

struct CompileVm {
    cid: String,
    agent_id: String,
    stemcell_cid: String,
}

/// Transient VMs for compilation, keyed by stemcell. Grown on demand (the
/// worker bound caps concurrency), returned to the idle set after each
/// compile, and deleted wholesale when compilation ends.
struct CompileVmPool {
    ctx: DeployContext,
    deployment: String,
    network: String,
    cloud_properties: Value,
    nets: SharedNets,
    available: tokio::sync::Mutex<HashMap<String, Vec<CompileVm>>>,
    created: Mutex<Vec<(String, Option<Ipv4Addr>)>>,
}

impl CompileVmPool {
    fn new(ctx: DeployContext, plan: &Plan, nets: SharedNets) -> Self {
        Self {
            ctx,
            deployment: plan.name.clone(),
            network: plan.compilation.network.clone(),
            cloud_properties: plan.compilation.cloud_properties.clone(),
            nets,
            available: tokio::sync::Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    async fn acquire(&self, stemcell: &StemcellRecord) -> anyhow::Result<CompileVm> {
        if let Some(vm) = self
            .available
            .lock()
            .await
            .get_mut(&stemcell.cid)
            .and_then(Vec::pop)
        {
            return Ok(vm);
        }

        let agent_id = Uuid::new_v4().to_string();
        let (ip, settings) = {
            let mut nets = self.nets.lock().unwrap();
            let network = nets
                .get_mut(&self.network)
                .ok_or_else(|| DirectorError::BadManifest(format!(
                    "compilation network {} missing",
                    self.network
                )))?;
            let ip = network.allocate_dynamic();
            (ip, network.settings_for(ip))
        };
        let networks_spec = json!({ self.network.clone(): settings });

        let cid = self
            .ctx
            .cloud
            .create_vm(
                &agent_id,
                &stemcell.cid,
                &self.cloud_properties,
                &networks_spec,
                &json!({}),
            )
            .await
            .map_err(DirectorError::from)?;
        self.created.lock().unwrap().push((cid.clone(), ip));
        self.ctx.store.put_vm(&VmRecord {
            cid: cid.clone(),
            agent_id: agent_id.clone(),
            deployment: self.deployment.clone(),
            resource_pool: crate::binder::COMPILATION_POOL.to_string(),
            ip: ip.map(|i| i.to_string()),
        })?;

        self.ctx.agents.ping_within(&agent_id, AGENT_BOOT_DEADLINE).await?;
        debug!(%cid, %agent_id, "compilation vm ready");
        Ok(CompileVm {
            cid,
            agent_id,
            stemcell_cid: stemcell.cid.clone(),
        })
    }

    async fn release(&self, vm: CompileVm) {
        self.available
            .lock()
            .await
            .entry(vm.stemcell_cid.clone())
            .or_default()
            .push(vm);
    }

    /// Delete every VM this pool ever created and return their addresses.
    async fn cleanup(&self) {
        let created: Vec<(String, Option<Ipv4Addr>)> =
            self.created.lock().unwrap().drain(..).collect();
        for (cid, ip) in created {
            if let Err(e) = self.ctx.cloud.delete_vm(&cid).await {
                warn!(%cid, error = %e, "compilation vm cleanup failed");
            }
            let _ = self.ctx.store.delete_vm(&self.deployment, &cid);
            if let Some(ip) = ip {
                if let Some(network) = self.nets.lock().unwrap().get_mut(&self.network) {
                    network.release(ip);
                }
            }
        }
        self.available.lock().await.clear();
    }
}
