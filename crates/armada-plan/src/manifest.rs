//! Deployment manifest parsing.
//!
//! Only the fields the director consumes are modeled; unknown keys are
//! ignored. Parse failures surface as `bad_manifest`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use armada_core::{DirectorError, DirectorResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub release: ReleaseRef,
    pub compilation: CompilationSpec,
    pub update: UpdateSpec,
    pub networks: Vec<NetworkSpec>,
    pub resource_pools: Vec<ResourcePoolSpec>,
    pub jobs: Vec<JobSpec>,
}

impl Manifest {
    pub fn from_yaml(text: &str) -> DirectorResult<Self> {
        serde_yaml::from_str(text).map_err(|e| DirectorError::BadManifest(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StemcellRef {
    pub name: String,
    pub version: String,
}

/// Dedicated resource pool for package compilation VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationSpec {
    pub workers: usize,
    pub network: String,
    #[serde(default)]
    pub cloud_properties: Value,
}

/// Update policy: canary counts and watch windows (milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSpec {
    pub canaries: u32,
    pub max_in_flight: u32,
    pub canary_watch_time: u64,
    pub update_watch_time: u64,
}

/// Per-job override of the global update policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateOverride {
    pub canaries: Option<u32>,
    pub max_in_flight: Option<u32>,
    pub canary_watch_time: Option<u64>,
    pub update_watch_time: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: NetworkKindSpec,
    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,
    /// Network-level cloud properties (dynamic and vip networks).
    #[serde(default)]
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKindSpec {
    #[default]
    Manual,
    Dynamic,
    Vip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetSpec {
    /// CIDR, e.g. `10.0.0.0/24`.
    pub range: String,
    pub gateway: Option<String>,
    /// Static ranges: `10.0.0.10 - 10.0.0.12` or single addresses.
    #[serde(rename = "static", default)]
    pub static_ranges: Vec<String>,
    #[serde(default)]
    pub reserved: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePoolSpec {
    pub name: String,
    pub stemcell: StemcellRef,
    pub network: String,
    pub size: u32,
    #[serde(default)]
    pub cloud_properties: Value,
    #[serde(default)]
    pub env: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub template: String,
    pub instances: u32,
    pub resource_pool: String,
    #[serde(default)]
    pub persistent_disk: Option<u64>,
    pub networks: Vec<JobNetworkSpec>,
    #[serde(default)]
    pub update: Option<UpdateOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNetworkSpec {
    pub name: String,
    #[serde(default)]
    pub static_ips: Vec<String>,
}
