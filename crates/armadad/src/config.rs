//! director.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use armada_cloud::CloudConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Root for the database, blobstore, task logs and upload spool.
    pub data_dir: PathBuf,
    #[serde(default = "default_cloud")]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Concurrent task worker loops.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Bootstrap operator account, created at startup when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub user: String,
    pub password: String,
}

fn default_name() -> String {
    "Armada Director".to_string()
}

fn default_port() -> u16 {
    25555
}

fn default_cloud() -> CloudConfig {
    CloudConfig::Dummy
}

fn default_workers() -> usize {
    2
}

impl DirectorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DirectorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("armada.redb")
    }

    pub fn blobstore_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn task_log_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.data_dir.join("spool")
    }
}
