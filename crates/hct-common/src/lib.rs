//! Common types for hcloud-talos: errors, retry policy, cluster state and labels

#![deny(missing_docs)]

pub mod error;
pub mod labels;
pub mod retry;
pub mod state;

pub use error::Error;
pub use state::{ClusterState, ClusterStore, HcloudState, DEFAULT_STATE_FILE};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Talos version flashed onto new nodes when the state does not pin one
pub const DEFAULT_TALOS_VERSION: &str = "1.7.6";

/// Kubernetes version used by `talosctl gen config` when the state does not pin one
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.30.4";

/// Private network range shared by every node of a cluster
pub const NETWORK_IP_RANGE: &str = "10.0.0.0/16";

/// Subnet carved out of [`NETWORK_IP_RANGE`] for servers
pub const NETWORK_SUBNET_IP_RANGE: &str = "10.0.0.0/24";

/// Kubernetes API port exposed by the control-plane load balancer
pub const KUBERNETES_API_PORT: u16 = 6443;

/// Talos API port exposed by the control-plane load balancer
pub const TALOS_API_PORT: u16 = 50000;
