//! Durable cluster descriptor stored in the cluster working directory.
//!
//! The state file is written once by `bootstrap-cluster` and only read
//! afterwards. It is not locked; running two commands against the same
//! directory concurrently is unsupported.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Default state file name inside the working directory
pub const DEFAULT_STATE_FILE: &str = "hcloud-talos.yaml";

/// Cluster descriptor persisted as YAML
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Cluster name; namespace for every derived resource name and ownership label
    pub cluster_name: String,
    /// Provider section
    pub hcloud: HcloudState,
    /// Talos version pinned at bootstrap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talos_version: Option<String>,
    /// Kubernetes version pinned at bootstrap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
}

/// Hetzner Cloud section of the state file
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HcloudState {
    /// Datacenter location (e.g. `nbg1`)
    pub location: String,
    /// Network zone (e.g. `eu-central`)
    pub network_zone: String,
    /// API token
    pub token: String,
}

impl fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterState")
            .field("cluster_name", &self.cluster_name)
            .field("hcloud", &self.hcloud)
            .field("talos_version", &self.talos_version)
            .field("kubernetes_version", &self.kubernetes_version)
            .finish()
    }
}

impl fmt::Debug for HcloudState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HcloudState")
            .field("location", &self.location)
            .field("network_zone", &self.network_zone)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Location of a state file: working directory plus file name
#[derive(Clone, Debug)]
pub struct ClusterStore {
    dir: PathBuf,
    file: String,
}

impl ClusterStore {
    /// Create a store for `dir`, using `file` (relative to `dir`) as state file name
    pub fn new(dir: impl Into<PathBuf>, file: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file: file.into(),
        }
    }

    /// Working directory holding state, machine configs and kubeconfig
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of the state file
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }

    /// Prepare the working directory for a new cluster and persist `state`.
    ///
    /// The directory must be empty unless `force` is set, in which case its
    /// previous contents are destroyed. The directory itself is kept, so the
    /// process's current directory works as a target.
    pub fn create(&self, state: &ClusterState, force: bool) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let has_entries = std::fs::read_dir(&self.dir)?.next().is_some();
        if has_entries {
            if !force {
                return Err(Error::DirectoryNotEmpty {
                    path: self.dir.clone(),
                });
            }
            info!(dir = %self.dir.display(), "Wiping existing cluster directory");
            for entry in std::fs::read_dir(&self.dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    std::fs::remove_dir_all(entry.path())?;
                } else {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        self.save(state)
    }

    /// Load the state, failing with [`Error::StateNotFound`] when the file is missing
    pub fn load(&self) -> Result<ClusterState> {
        let path = self.path();
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::StateNotFound { path });
            }
            Err(e) => return Err(e.into()),
        };
        let state: ClusterState = serde_yaml::from_str(&data)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        if state.cluster_name.is_empty() {
            return Err(Error::config(format!(
                "{} has an empty clusterName",
                path.display()
            )));
        }
        debug!(cluster = %state.cluster_name, "Loaded cluster state");
        Ok(state)
    }

    /// Overwrite the state file wholesale
    pub fn save(&self, state: &ClusterState) -> Result<()> {
        let path = self.path();
        let data = serde_yaml::to_string(state)?;
        write_private(&path, data.as_bytes())?;
        Ok(())
    }

    /// Read a file from the working directory (machine configs, patches)
    pub fn read_file(&self, name: &str) -> Result<String> {
        let path = self.dir.join(name);
        std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::config(format!("{} is missing", path.display()))
            } else {
                e.into()
            }
        })
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}
