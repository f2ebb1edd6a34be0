//! Ownership labels and deterministic resource names.
//!
//! Names double as idempotency keys: every ensure step looks a resource up by
//! the name built here before creating it, so these functions must stay stable
//! across releases.

use std::collections::BTreeMap;
use std::fmt;

/// Label binding a cloud resource to its owning cluster
pub const CLUSTER_LABEL: &str = "hct.airfocus.io/cluster";

/// Label carrying a server's [`NodeRole`]
pub const ROLE_LABEL: &str = "hct.airfocus.io/role";

/// Label carrying a worker's pool name
pub const POOL_LABEL: &str = "hct.airfocus.io/pool";

/// Role of a server within the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Runs etcd and the Kubernetes control plane
    ControlPlane,
    /// Runs workloads
    Worker,
}

impl NodeRole {
    /// Label value and machine config prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "controlplane",
            NodeRole::Worker => "worker",
        }
    }

    /// Machine config file generated by `talosctl gen config` for this role
    pub fn machine_config_file(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "controlplane.yaml",
            NodeRole::Worker => "worker.yaml",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controlplane" => Ok(NodeRole::ControlPlane),
            "worker" => Ok(NodeRole::Worker),
            other => Err(crate::Error::validation(format!(
                "unknown node role {other:?}, expected controlplane or worker"
            ))),
        }
    }
}

/// Labels every managed resource starts with
pub fn base_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster.to_string())])
}

/// Labels committed to a server once it has been imaged
pub fn node_labels(cluster: &str, role: NodeRole, pool: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = base_labels(cluster);
    labels.insert(ROLE_LABEL.to_string(), role.as_str().to_string());
    if let Some(pool) = pool {
        labels.insert(POOL_LABEL.to_string(), pool.to_string());
    }
    labels
}

/// Selector matching every resource owned by the cluster
pub fn cluster_selector(cluster: &str) -> String {
    format!("{CLUSTER_LABEL}={cluster}")
}

/// Selector matching every finalized server of the cluster, whatever its role
pub fn finalized_selector(cluster: &str) -> String {
    format!("{CLUSTER_LABEL}={cluster},{ROLE_LABEL}")
}

/// Selector matching the servers of one role
pub fn role_selector(cluster: &str, role: NodeRole) -> String {
    format!("{CLUSTER_LABEL}={cluster},{ROLE_LABEL}={role}")
}

/// Selector matching the members of a worker pool
pub fn pool_selector(cluster: &str, pool: &str) -> String {
    format!(
        "{CLUSTER_LABEL}={cluster},{ROLE_LABEL}={},{POOL_LABEL}={pool}",
        NodeRole::Worker
    )
}

/// Shared private network
pub fn network_name(cluster: &str) -> String {
    format!("{cluster}-nodes")
}

/// Spread placement group for control-plane servers
pub fn controlplane_placement_group_name(cluster: &str) -> String {
    format!("{cluster}-controlplanes")
}

/// Load balancer in front of the Kubernetes and Talos APIs
pub fn controlplane_load_balancer_name(cluster: &str) -> String {
    format!("{cluster}-controlplane")
}

/// Firewall applied to every finalized server
pub fn firewall_name(cluster: &str) -> String {
    format!("{cluster}-nodes")
}

/// Cloud server backing a node
pub fn server_name(cluster: &str, node: &str) -> String {
    format!("{cluster}-{node}")
}

/// Node name at position `index` of a pool
pub fn pool_node_name(prefix: &str, index: u32) -> String {
    format!("{prefix}-{index}")
}
