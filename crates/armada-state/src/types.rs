//! Domain records persisted by the Armada state store.
//!
//! These types mirror the director's semantic model: durable tasks, release
//! content (packages, templates, compiled artifacts), stemcells, and the
//! deployment-owned records (instances, VMs, disks). All types serialize to
//! JSON for storage in redb value columns.

use serde::{Deserialize, Serialize};

/// Monotonic task identifier.
pub type TaskId = u64;

// ── Tasks ─────────────────────────────────────────────────────────

/// The kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    UpdateDeployment,
    DeleteDeployment,
    UpdateRelease,
    DeleteRelease,
    UpdateStemcell,
    DeleteStemcell,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateDeployment => "update_deployment",
            Self::DeleteDeployment => "delete_deployment",
            Self::UpdateRelease => "update_release",
            Self::DeleteRelease => "delete_release",
            Self::UpdateStemcell => "update_stemcell",
            Self::DeleteStemcell => "delete_stemcell",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle state.
///
/// A task advances exactly once from `queued` to `processing` on pickup and
/// ends in one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Processing,
    Cancelling,
    Done,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Cancelling => "cancelling",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of an asynchronous operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    /// Unix timestamp (seconds) when the task was created.
    pub timestamp: u64,
    pub description: String,
    /// Short result string, or `{code, description}` JSON on domain errors.
    pub result: Option<String>,
    /// Directory holding the `debug`, `event` and `result` streams.
    pub output_dir: Option<String>,
}

/// An entry on the durable task queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub kind: TaskKind,
    /// Kind-specific input (manifest path, release name, ...).
    pub payload: serde_json::Value,
}

// ── Users ─────────────────────────────────────────────────────────

/// An operator account for HTTP basic authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub username: String,
    pub salt: String,
    /// SHA-256 of `salt + password`, hex encoded.
    pub password_digest: String,
}

// ── Releases ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseRecord {
    pub name: String,
}

/// One uploaded version of a release. Its packages and templates live in
/// their own tables under the `{release}/{version}/` key prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseVersionRecord {
    pub release: String,
    pub version: String,
}

impl ReleaseVersionRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.release, self.version)
    }
}

/// A source package within a release version.
///
/// `(name, version, fingerprint)` is a content-addressed identity: two
/// packages with the same fingerprint are interchangeable sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageRecord {
    pub release: String,
    pub release_version: String,
    pub name: String,
    pub version: String,
    /// Content hash of the package source tree.
    pub fingerprint: String,
    /// Blob reference to the source tarball.
    pub blob_id: String,
    pub digest: String,
    /// Names of compile-time dependencies within the same release version.
    pub dependencies: Vec<String>,
}

impl PackageRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.release, self.release_version, self.name)
    }
}

/// A job template within a release version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateRecord {
    pub release: String,
    pub release_version: String,
    pub name: String,
    pub version: String,
    pub blob_id: String,
    pub digest: String,
    /// Names of the packages this template requires.
    pub packages: Vec<String>,
}

impl TemplateRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.release, self.release_version, self.name)
    }
}

/// A compiled artifact, shared across deployments.
///
/// Uniquely keyed by source package identity, target stemcell identity and a
/// digest over the identities of its transitive compile-time dependencies.
/// Never recomputed once the key exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledPackageRecord {
    pub package_name: String,
    pub package_version: String,
    pub fingerprint: String,
    pub stemcell_name: String,
    pub stemcell_version: String,
    pub dependency_key: String,
    pub blob_id: String,
    pub digest: String,
}

impl CompiledPackageRecord {
    pub fn table_key(&self) -> String {
        compiled_package_key(
            &self.fingerprint,
            &self.stemcell_name,
            &self.stemcell_version,
            &self.dependency_key,
        )
    }
}

/// Build the compiled-package cache key.
pub fn compiled_package_key(
    fingerprint: &str,
    stemcell_name: &str,
    stemcell_version: &str,
    dependency_key: &str,
) -> String {
    format!("{fingerprint}:{stemcell_name}/{stemcell_version}:{dependency_key}")
}

// ── Stemcells ─────────────────────────────────────────────────────

/// A base OS image registered with the cloud provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StemcellRecord {
    pub name: String,
    pub version: String,
    /// Cloud id assigned by the provider.
    pub cid: String,
    pub digest: String,
}

impl StemcellRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

// ── Deployments ───────────────────────────────────────────────────

/// A named deployment and the references it currently holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub name: String,
    /// The raw manifest text most recently applied.
    pub manifest: String,
    /// `{release}/{version}` keys in use.
    pub releases: Vec<String>,
    /// `{stemcell}/{version}` keys in use.
    pub stemcells: Vec<String>,
}

/// A VM created through the cloud provider.
///
/// A VM not referenced by any instance belongs to its resource pool's idle
/// set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmRecord {
    pub cid: String,
    pub agent_id: String,
    pub deployment: String,
    pub resource_pool: String,
    /// IP held by this VM's network reservation, if manually allocated.
    pub ip: Option<String>,
}

impl VmRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.deployment, self.cid)
    }
}

/// One numbered replica of a job. Owns at most one VM and one disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub deployment: String,
    pub job: String,
    pub index: u32,
    /// The configuration last applied to the agent.
    pub state: serde_json::Value,
    pub vm_cid: Option<String>,
    pub disk_cid: Option<String>,
    pub ips: Vec<String>,
}

impl InstanceRecord {
    pub fn table_key(&self) -> String {
        instance_key(&self.deployment, &self.job, self.index)
    }
}

pub fn instance_key(deployment: &str, job: &str, index: u32) -> String {
    format!("{deployment}:{job}:{index}")
}

/// A persistent disk owned by an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskRecord {
    pub cid: String,
    pub deployment: String,
    pub size_mb: u64,
}

impl DiskRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.deployment, self.cid)
    }
}

// ── Locks ─────────────────────────────────────────────────────────

/// A named, expiring lock row. At most one row per name with an expiry in
/// the future.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRow {
    pub name: String,
    /// Uuid of the current holder.
    pub holder: String,
    /// Unix timestamp in milliseconds.
    pub expires_at_ms: u64,
}
