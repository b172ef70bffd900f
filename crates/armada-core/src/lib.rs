//! armada-core — shared primitives for the Armada director.
//!
//! Home of the closed domain-error surface (`DirectorError`), the blobstore
//! collaborator interface, and content-digest helpers used by the release
//! and compilation pipelines.

pub mod blobstore;
pub mod digest;
pub mod error;

pub use blobstore::{Blobstore, BlobstoreError, LocalBlobstore};
pub use digest::{digest_file, hex_digest};
pub use error::{DirectorError, DirectorResult};
