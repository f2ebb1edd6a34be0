//! hcloud-talos CLI library
//!
//! Exposes the CLI structure for testing and reuse.

pub mod commands;
pub mod error;

use clap::{Parser, Subcommand};

pub use error::{Error, Result};

use commands::GlobalArgs;

/// hcloud-talos - Talos Kubernetes clusters on Hetzner Cloud
#[derive(Parser, Debug)]
#[command(name = "hcloud-talos")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the infrastructure and the first control-plane node of a new cluster
    BootstrapCluster(commands::bootstrap_cluster::BootstrapClusterArgs),

    /// Provision a node and wait for it to join the cluster
    AddNode(commands::add_node::AddNodeArgs),

    /// Reset a node, remove it from the cluster and delete its server
    DeleteNode(commands::delete_node::DeleteNodeArgs),

    /// Scale a worker pool to the requested size
    ReconcilePool(commands::reconcile_pool::ReconcilePoolArgs),

    /// Apply the in-cluster add-ons
    ApplyManifests(commands::apply_manifests::ApplyManifestsArgs),

    /// Delete every cloud resource owned by the cluster
    DestroyCluster(commands::destroy_cluster::DestroyClusterArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn run(self) -> Result<()> {
        let global = self.global;
        match self.command {
            Commands::BootstrapCluster(args) => {
                commands::bootstrap_cluster::run(&global, args).await
            }
            Commands::AddNode(args) => commands::add_node::run(&global, args).await,
            Commands::DeleteNode(args) => commands::delete_node::run(&global, args).await,
            Commands::ReconcilePool(args) => commands::reconcile_pool::run(&global, args).await,
            Commands::ApplyManifests(args) => commands::apply_manifests::run(&global, args).await,
            Commands::DestroyCluster(args) => commands::destroy_cluster::run(&global, args).await,
        }
    }
}
