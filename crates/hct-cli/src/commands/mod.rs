//! CLI command implementations

pub mod add_node;
pub mod apply_manifests;
pub mod bootstrap_cluster;
pub mod delete_node;
pub mod destroy_cluster;
pub mod reconcile_pool;

use std::path::PathBuf;

use clap::Args;

use hct_cluster::Context;
use hct_common::{ClusterStore, DEFAULT_STATE_FILE};

use crate::Result;

/// Options shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Working directory holding the cluster state and Talos configuration
    #[arg(long, global = true, env = "HCLOUD_TALOS_DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Cluster state file name inside the working directory
    #[arg(short = 'c', long, global = true, default_value = DEFAULT_STATE_FILE)]
    pub config: String,

    /// Enable debug logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    /// Store for the cluster state file
    pub fn store(&self) -> ClusterStore {
        ClusterStore::new(&self.dir, &self.config)
    }
}

/// Load the existing cluster and wire the real collaborators
pub(crate) fn load_context(global: &GlobalArgs) -> Result<Context> {
    Ok(Context::load(global.store())?)
}
