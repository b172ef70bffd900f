//! Content digests.
//!
//! Packages, templates and stemcell images are identified by SHA-256
//! digests rendered as lowercase hex.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Digest of an in-memory byte slice.
pub fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of a file, streamed in 64 KiB chunks.
pub fn digest_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digest_is_hex_sha256() {
        let d = hex_digest(b"hello");
        assert_eq!(d.len(), 64);
        assert_eq!(
            d,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn file_digest_matches_memory_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"stemcell image bytes").unwrap();
        drop(f);

        assert_eq!(
            digest_file(&path).unwrap(),
            hex_digest(b"stemcell image bytes")
        );
    }
}
