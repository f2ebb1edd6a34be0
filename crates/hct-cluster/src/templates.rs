//! Declarative shapes of every managed resource

use rand::distributions::Alphanumeric;
use rand::Rng;

use hct_common::labels::{self, NodeRole};
use hct_common::{
    ClusterState, Result, DEFAULT_TALOS_VERSION, KUBERNETES_API_PORT, NETWORK_IP_RANGE,
    NETWORK_SUBNET_IP_RANGE, TALOS_API_PORT,
};

use crate::cloud::{
    FirewallRule, FirewallSpec, Labels, LoadBalancerService, LoadBalancerSpec,
    LoadBalancerTarget, Network, NetworkSpec, PlacementGroupSpec, SubnetSpec,
};
use crate::context::Context;

/// Image the server is created from before it is flashed
pub const INIT_IMAGE: &str = "debian-12";

/// Load balancer type in front of the control plane
pub const CONTROLPLANE_LOAD_BALANCER_TYPE: &str = "lb11";

/// Placeholder in node names replaced by a random suffix
pub const NODE_NAME_ID_PLACEHOLDER: &str = "%id%";

/// Random lowercase alphanumeric string
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Replace the first `%id%` in a node name by 6 random characters
pub fn expand_node_name(name: &str) -> String {
    name.replacen(NODE_NAME_ID_PLACEHOLDER, &random_suffix(6), 1)
}

/// Download URL of the Talos Hetzner Cloud disk image
pub fn talos_image_url(version: &str) -> String {
    format!("https://github.com/siderolabs/talos/releases/download/v{version}/hcloud-amd64.raw.xz")
}

/// Talos version for new nodes: explicit override, then state, then default
pub fn talos_version<'a>(state: &'a ClusterState, requested: Option<&'a str>) -> &'a str {
    requested
        .or(state.talos_version.as_deref())
        .unwrap_or(DEFAULT_TALOS_VERSION)
}

/// Shared node network
pub fn network_spec(state: &ClusterState) -> NetworkSpec {
    NetworkSpec {
        name: labels::network_name(&state.cluster_name),
        ip_range: NETWORK_IP_RANGE.to_string(),
        subnets: vec![SubnetSpec {
            kind: "cloud".to_string(),
            ip_range: NETWORK_SUBNET_IP_RANGE.to_string(),
            network_zone: state.hcloud.network_zone.clone(),
        }],
        labels: labels::base_labels(&state.cluster_name),
    }
}

/// Spread placement group for control-plane servers
pub fn controlplane_placement_group_spec(state: &ClusterState) -> PlacementGroupSpec {
    PlacementGroupSpec {
        name: labels::controlplane_placement_group_name(&state.cluster_name),
        kind: "spread".to_string(),
        labels: labels::base_labels(&state.cluster_name),
    }
}

/// Load balancer forwarding the Kubernetes and Talos APIs to control-plane nodes
pub fn controlplane_load_balancer_spec(state: &ClusterState, network: &Network) -> LoadBalancerSpec {
    let tcp = |port: u16| LoadBalancerService {
        protocol: "tcp".to_string(),
        listen_port: port,
        destination_port: port,
    };
    LoadBalancerSpec {
        name: labels::controlplane_load_balancer_name(&state.cluster_name),
        load_balancer_type: CONTROLPLANE_LOAD_BALANCER_TYPE.to_string(),
        location: state.hcloud.location.clone(),
        network: Some(network.id),
        services: vec![tcp(KUBERNETES_API_PORT), tcp(TALOS_API_PORT)],
        targets: vec![LoadBalancerTarget::LabelSelector {
            selector: labels::role_selector(&state.cluster_name, NodeRole::ControlPlane),
            use_private_ip: true,
        }],
        labels: labels::base_labels(&state.cluster_name),
    }
}

/// Firewall admitting intra-network traffic and ICMP from anywhere
pub fn node_firewall_spec(state: &ClusterState, network: &Network) -> FirewallSpec {
    let inbound = |protocol: &str, sources: &[&str], port: Option<&str>| FirewallRule {
        direction: "in".to_string(),
        protocol: protocol.to_string(),
        source_ips: sources.iter().map(|s| s.to_string()).collect(),
        port: port.map(str::to_string),
    };
    let private = [network.ip_range.as_str()];
    FirewallSpec {
        name: labels::firewall_name(&state.cluster_name),
        rules: vec![
            inbound("tcp", &private, Some("any")),
            inbound("udp", &private, Some("any")),
            inbound("icmp", &private, None),
            inbound("icmp", &["0.0.0.0/0", "::/0"], None),
        ],
        apply_to: vec![labels::finalized_selector(&state.cluster_name)],
        labels: labels::base_labels(&state.cluster_name),
    }
}

/// Everything needed to turn a fresh server into a node
#[derive(Clone, Debug, PartialEq)]
pub struct ServerImageTemplate {
    /// Server name
    pub name: String,
    /// Server type (e.g. `cx22`)
    pub server_type: String,
    /// Talos machine config passed as user data
    pub user_data: String,
    /// Labels present from creation on
    pub base_labels: Labels,
    /// Labels committed once the server is imaged
    pub finalize_labels: Labels,
    /// Compressed raw disk image
    pub image_url: String,
}

/// Template for a node of `role`, reading its machine config from the working directory
pub fn node_template(
    ctx: &Context,
    role: NodeRole,
    node_name: &str,
    server_type: &str,
    pool: Option<&str>,
    talos_version_override: Option<&str>,
) -> Result<ServerImageTemplate> {
    let cluster = ctx.cluster_name();
    let user_data = ctx.store.read_file(role.machine_config_file())?;
    Ok(ServerImageTemplate {
        name: labels::server_name(cluster, &expand_node_name(node_name)),
        server_type: server_type.to_string(),
        user_data,
        base_labels: labels::base_labels(cluster),
        finalize_labels: labels::node_labels(cluster, role, pool),
        image_url: talos_image_url(talos_version(&ctx.state, talos_version_override)),
    })
}
