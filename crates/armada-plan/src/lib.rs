//! armada-plan — deployment manifests and the desired-state plan.
//!
//! A `Manifest` is the operator's YAML, parsed but not trusted. A `Plan`
//! is the validated, immutable view: networks with IP pools, resource
//! pools bound to stemcells, jobs bound to templates and their transitive
//! package closure, and one instance slot per job index. The plan compiler
//! in armada-deploy then binds it against database state.

pub mod manifest;
pub mod network;
pub mod plan;

pub use manifest::{
    CompilationSpec, JobNetworkSpec, JobSpec, Manifest, NetworkSpec, ReleaseRef,
    ResourcePoolSpec, StemcellRef, SubnetSpec, UpdateOverride, UpdateSpec,
};
pub use network::{parse_ip_range, Cidr, Network, NetworkKind, Subnet};
pub use plan::{
    ChangeKind, CompilationPlan, InstancePlan, JobNetworkPlan, JobPlan, Plan, ReleaseContent,
    ResourcePoolPlan, UpdatePolicy,
};
