//! Blobstore collaborator.
//!
//! Write-once, content-addressed object storage holding package sources,
//! compiled packages, job templates and stemcell images. Deletion is
//! best-effort; garbage is collected lazily.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Opaque blob identifier.
pub type BlobId = String;

#[derive(Debug, Error)]
pub enum BlobstoreError {
    #[error("blob not found: {0}")]
    NotFound(BlobId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Object storage for release artifacts.
#[async_trait]
pub trait Blobstore: Send + Sync {
    /// Store the file at `path`; returns the assigned blob id.
    async fn create(&self, path: &Path) -> Result<BlobId, BlobstoreError>;

    /// Store a byte buffer; returns the assigned blob id.
    async fn create_bytes(&self, bytes: &[u8]) -> Result<BlobId, BlobstoreError>;

    /// Copy the blob's content to `dest`.
    async fn fetch(&self, id: &str, dest: &Path) -> Result<(), BlobstoreError>;

    /// Remove a blob. Removing an absent blob is not an error.
    async fn delete(&self, id: &str) -> Result<(), BlobstoreError>;

    async fn exists(&self, id: &str) -> Result<bool, BlobstoreError>;
}

/// Filesystem-backed blobstore. Blobs live under `<root>/<id[0..2]>/<id>`.
pub struct LocalBlobstore {
    root: PathBuf,
}

impl LocalBlobstore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        let shard = &id[..2.min(id.len())];
        self.root.join(shard).join(id)
    }

    async fn prepare(&self, id: &str) -> Result<PathBuf, BlobstoreError> {
        let path = self.blob_path(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }
}

#[async_trait]
impl Blobstore for LocalBlobstore {
    async fn create(&self, path: &Path) -> Result<BlobId, BlobstoreError> {
        let id = Uuid::new_v4().to_string();
        let dest = self.prepare(&id).await?;
        tokio::fs::copy(path, &dest).await?;
        debug!(blob_id = %id, src = ?path, "blob stored");
        Ok(id)
    }

    async fn create_bytes(&self, bytes: &[u8]) -> Result<BlobId, BlobstoreError> {
        let id = Uuid::new_v4().to_string();
        let dest = self.prepare(&id).await?;
        tokio::fs::write(&dest, bytes).await?;
        debug!(blob_id = %id, len = bytes.len(), "blob stored");
        Ok(id)
    }

    async fn fetch(&self, id: &str, dest: &Path) -> Result<(), BlobstoreError> {
        let src = self.blob_path(id);
        if !src.exists() {
            return Err(BlobstoreError::NotFound(id.to_string()));
        }
        tokio::fs::copy(&src, dest).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), BlobstoreError> {
        let path = self.blob_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool, BlobstoreError> {
        Ok(self.blob_path(id).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_fetch_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobstore::new(dir.path().join("blobs"));

        let id = store.create_bytes(b"package source").await.unwrap();
        assert!(store.exists(&id).await.unwrap());

        let out = dir.path().join("out");
        store.fetch(&id, &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"package source");
    }

    #[tokio::test]
    async fn fetch_missing_blob_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobstore::new(dir.path());

        let err = store
            .fetch("does-not-exist", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobstoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobstore::new(dir.path());

        let id = store.create_bytes(b"x").await.unwrap();
        store.delete(&id).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(!store.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn create_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.tgz");
        std::fs::write(&src, b"tarball").unwrap();

        let store = LocalBlobstore::new(dir.path().join("blobs"));
        let id = store.create(&src).await.unwrap();
        assert!(store.exists(&id).await.unwrap());
    }
}
