//! armada-state — embedded state store for the Armada director.
//!
//! Backed by [redb](https://docs.rs/redb), this is the system of record for
//! tasks, releases, packages, compiled packages, templates, stemcells,
//! deployments, VMs, instances, disks, users and lock rows.
//!
//! # Architecture
//!
//! Every record serializes to JSON and lands in a byte-valued column under
//! a composite string key (`{release}/{version}/{name}`,
//! `{deployment}:{job}:{index}`), which makes "everything belonging to X"
//! a prefix scan. The conditional operations the director depends on —
//! exactly-once task pickup, lock-row takeover, queue pops — each run as a
//! single write transaction and get their atomicity from redb serializing
//! writers.
//!
//! A `StateStore` wraps an `Arc` over the database, so handing clones to
//! the API layer and every task worker costs nothing.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
