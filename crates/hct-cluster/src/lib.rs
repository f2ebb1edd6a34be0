//! Provisioning and reconciliation engine for Talos clusters on Hetzner Cloud
//!
//! Every operation takes an explicit [`Context`] and talks to the outside
//! world only through its collaborator traits:
//! - [`CloudClient`]: Hetzner Cloud resources
//! - [`ClusterMembership`]: the provisioned cluster's Kubernetes API
//! - [`NodeBootstrapper`]: Talos configuration and node bootstrap
//! - [`RemoteExecutor`]: shell access to servers in rescue mode

#![deny(missing_docs)]

pub mod bootstrap;
pub mod cloud;
pub mod context;
pub mod destroy;
pub mod ensure;
pub mod imaging;
pub mod manifests;
pub mod membership;
pub mod node;
pub mod pool;
pub mod remote;
pub mod talos;
pub mod templates;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::{bootstrap_cluster, BootstrapClusterOpts};
pub use cloud::{CloudClient, HcloudClient};
pub use context::{Context, ContextBuilder};
pub use destroy::{destroy_cluster, DestroyClusterOpts, DestroySummary};
pub use manifests::{apply_manifests, ApplyManifestsOpts};
pub use membership::{ClusterMembership, KubeMembership};
pub use node::{add_node, delete_node, AddNodeOpts, ClusterLifecycle, DeleteNodeOpts, NodeOperations};
pub use pool::{reconcile_pool, ReconcilePoolOpts, ReconcileSummary};
pub use remote::{RemoteExecutor, SshExecutor};
pub use talos::{NodeBootstrapper, Talosctl};

// Re-export common error types
pub use hct_common::{Error, Result};
