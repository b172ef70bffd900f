//! redb table definitions for the Armada state store.
//!
//! String-keyed tables hold JSON-serialized domain records. Composite keys
//! follow `{release}/{version}/{name}` for release content and
//! `{deployment}:{child}` for deployment-owned records, so related rows are
//! reachable with a prefix scan.

use redb::TableDefinition;

/// Task records keyed by task id.
pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");

/// Durable task queue entries keyed by task id.
pub const TASK_QUEUE: TableDefinition<u64, &[u8]> = TableDefinition::new("task_queue");

/// Counters (`task_seq`) keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Users keyed by username.
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Releases keyed by name.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// Release versions keyed by `{release}/{version}`.
pub const RELEASE_VERSIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("release_versions");

/// Source packages keyed by `{release}/{version}/{name}`.
pub const PACKAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("packages");

/// Job templates keyed by `{release}/{version}/{name}`.
pub const TEMPLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("templates");

/// Compiled packages keyed by `{fingerprint}:{stemcell}/{version}:{dep_key}`.
pub const COMPILED_PACKAGES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("compiled_packages");

/// Stemcells keyed by `{name}/{version}`.
pub const STEMCELLS: TableDefinition<&str, &[u8]> = TableDefinition::new("stemcells");

/// Deployments keyed by name.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// VMs keyed by `{deployment}:{cid}`.
pub const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

/// Instances keyed by `{deployment}:{job}:{index}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Persistent disks keyed by `{deployment}:{cid}`.
pub const DISKS: TableDefinition<&str, &[u8]> = TableDefinition::new("disks");

/// Lock rows keyed by lock name.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
