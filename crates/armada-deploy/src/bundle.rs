//! Release and stemcell bundle readers.
//!
//! Bundles are gzipped tarballs. A release bundle carries `release.MF`
//! plus one tarball per package (`packages/<name>.tgz`) and per job
//! template (`jobs/<name>.tgz`). A stemcell bundle carries `stemcell.MF`
//! and the raw `image`. Tar streams read front to back, so each entry
//! lookup rescans the archive; bundles are read a handful of times per
//! upload, which is fine.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;
use tar::Archive;

use armada_core::{DirectorError, DirectorResult};

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseBundleManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub packages: Vec<BundlePackage>,
    #[serde(default)]
    pub jobs: Vec<BundleJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundlePackage {
    pub name: String,
    pub version: String,
    pub fingerprint: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleJob {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StemcellBundleManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub cloud_properties: Value,
}

#[derive(Debug)]
pub struct ReleaseBundle {
    path: PathBuf,
    pub manifest: ReleaseBundleManifest,
}

impl ReleaseBundle {
    pub fn open(path: &Path) -> DirectorResult<Self> {
        let text = read_entry_text(path, "release.MF")?;
        let manifest = serde_yaml::from_str(&text)
            .map_err(|e| DirectorError::BadManifest(format!("release.MF: {e}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            manifest,
        })
    }

    pub fn package_blob(&self, name: &str) -> DirectorResult<Vec<u8>> {
        read_entry_bytes(&self.path, &format!("packages/{name}.tgz"))
    }

    pub fn job_blob(&self, name: &str) -> DirectorResult<Vec<u8>> {
        read_entry_bytes(&self.path, &format!("jobs/{name}.tgz"))
    }
}

pub struct StemcellBundle {
    path: PathBuf,
    pub manifest: StemcellBundleManifest,
}

impl StemcellBundle {
    pub fn open(path: &Path) -> DirectorResult<Self> {
        let text = read_entry_text(path, "stemcell.MF")?;
        let manifest = serde_yaml::from_str(&text)
            .map_err(|e| DirectorError::BadManifest(format!("stemcell.MF: {e}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            manifest,
        })
    }

    /// Copy the raw image out of the bundle.
    pub fn extract_image(&self, dest: &Path) -> DirectorResult<()> {
        let bytes = read_entry_bytes(&self.path, "image")?;
        std::fs::write(dest, bytes)
            .map_err(|e| DirectorError::BadManifest(format!("write image: {e}")))?;
        Ok(())
    }
}

fn open_archive(path: &Path) -> DirectorResult<Archive<GzDecoder<File>>> {
    let file = File::open(path)
        .map_err(|e| DirectorError::BadManifest(format!("open bundle {path:?}: {e}")))?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn read_entry_bytes(path: &Path, wanted: &str) -> DirectorResult<Vec<u8>> {
    let mut archive = open_archive(path)?;
    let entries = archive
        .entries()
        .map_err(|e| DirectorError::BadManifest(format!("bad bundle: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| DirectorError::BadManifest(format!("bad bundle: {e}")))?;
        let entry_path = entry
            .path()
            .map_err(|e| DirectorError::BadManifest(format!("bad bundle: {e}")))?;
        let name = entry_path.to_string_lossy();
        if name.trim_start_matches("./") == wanted {
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| DirectorError::BadManifest(format!("read {wanted}: {e}")))?;
            return Ok(bytes);
        }
    }
    Err(DirectorError::BadManifest(format!(
        "bundle is missing {wanted}"
    )))
}

fn read_entry_text(path: &Path, wanted: &str) -> DirectorResult<String> {
    let bytes = read_entry_bytes(path, wanted)?;
    String::from_utf8(bytes)
        .map_err(|_| DirectorError::BadManifest(format!("{wanted} is not utf-8")))
}
