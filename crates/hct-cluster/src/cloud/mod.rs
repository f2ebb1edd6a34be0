//! Cloud provider model and client abstraction
//!
//! The engine only talks to the provider through [`CloudClient`]. Lookups are
//! by name (the idempotency key) or by label selector; nothing else is keyed
//! on provider ids across invocations.

mod hcloud;

pub use hcloud::HcloudClient;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use hct_common::Result;

/// Provider-assigned resource id
pub type ResourceId = u64;

/// Resource labels
pub type Labels = BTreeMap<String, String>;

/// Private network
#[derive(Clone, Debug, PartialEq)]
pub struct Network {
    /// Provider id
    pub id: ResourceId,
    /// Unique name
    pub name: String,
    /// Network range in CIDR notation
    pub ip_range: String,
    /// Labels
    pub labels: Labels,
}

/// Desired shape of a new network
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkSpec {
    /// Unique name
    pub name: String,
    /// Network range in CIDR notation
    pub ip_range: String,
    /// Subnets to create with the network
    pub subnets: Vec<SubnetSpec>,
    /// Labels
    pub labels: Labels,
}

/// Subnet of a [`NetworkSpec`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubnetSpec {
    /// Subnet type, `cloud` for plain servers
    #[serde(rename = "type")]
    pub kind: String,
    /// Subnet range in CIDR notation
    pub ip_range: String,
    /// Network zone hosting the subnet
    pub network_zone: String,
}

/// Placement group
#[derive(Clone, Debug, PartialEq)]
pub struct PlacementGroup {
    /// Provider id
    pub id: ResourceId,
    /// Unique name
    pub name: String,
    /// Labels
    pub labels: Labels,
}

/// Desired shape of a new placement group
#[derive(Clone, Debug, PartialEq)]
pub struct PlacementGroupSpec {
    /// Unique name
    pub name: String,
    /// Placement strategy, `spread` keeps members on distinct hosts
    pub kind: String,
    /// Labels
    pub labels: Labels,
}

/// Load balancer
#[derive(Clone, Debug, PartialEq)]
pub struct LoadBalancer {
    /// Provider id
    pub id: ResourceId,
    /// Unique name
    pub name: String,
    /// Public IPv4 once assigned
    pub public_ipv4: Option<String>,
    /// Addresses in attached private networks
    pub private_ips: Vec<String>,
    /// Labels
    pub labels: Labels,
}

/// Desired shape of a new load balancer
#[derive(Clone, Debug, PartialEq)]
pub struct LoadBalancerSpec {
    /// Unique name
    pub name: String,
    /// Load balancer type (e.g. `lb11`)
    pub load_balancer_type: String,
    /// Location
    pub location: String,
    /// Private network to attach
    pub network: Option<ResourceId>,
    /// Forwarded services
    pub services: Vec<LoadBalancerService>,
    /// Targets attached once the balancer has settled
    pub targets: Vec<LoadBalancerTarget>,
    /// Labels
    pub labels: Labels,
}

/// TCP service forwarded by a load balancer
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoadBalancerService {
    /// Protocol, `tcp` for plain forwarding
    pub protocol: String,
    /// Port on the balancer
    pub listen_port: u16,
    /// Port on the targets
    pub destination_port: u16,
}

/// Load balancer target
#[derive(Clone, Debug, PartialEq)]
pub enum LoadBalancerTarget {
    /// Every server matching a label selector
    LabelSelector {
        /// Label selector
        selector: String,
        /// Route through the private network
        use_private_ip: bool,
    },
    /// A single server
    Server {
        /// Server id
        id: ResourceId,
        /// Route through the private network
        use_private_ip: bool,
    },
    /// A raw IP address
    Ip {
        /// Target address
        ip: String,
    },
}

/// Firewall
#[derive(Clone, Debug, PartialEq)]
pub struct Firewall {
    /// Provider id
    pub id: ResourceId,
    /// Unique name
    pub name: String,
    /// Labels
    pub labels: Labels,
}

/// Desired shape of a new firewall
#[derive(Clone, Debug, PartialEq)]
pub struct FirewallSpec {
    /// Unique name
    pub name: String,
    /// Inbound rules
    pub rules: Vec<FirewallRule>,
    /// Label selectors of the servers the firewall applies to
    pub apply_to: Vec<String>,
    /// Labels
    pub labels: Labels,
}

/// Inbound firewall rule
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FirewallRule {
    /// Always `in`
    pub direction: String,
    /// `tcp`, `udp` or `icmp`
    pub protocol: String,
    /// Allowed source ranges in CIDR notation
    pub source_ips: Vec<String>,
    /// Port or port range, absent for ICMP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

/// Power state reported for a server
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Powered on
    Running,
    /// Being created
    Initializing,
    /// Booting
    Starting,
    /// Shutting down
    Stopping,
    /// Powered off
    Off,
    /// Being deleted
    Deleting,
    /// Moving hosts
    Migrating,
    /// Being rebuilt
    Rebuilding,
    /// Anything else
    #[serde(other)]
    Unknown,
}

/// Server
#[derive(Clone, Debug, PartialEq)]
pub struct Server {
    /// Provider id
    pub id: ResourceId,
    /// Unique name
    pub name: String,
    /// Power state
    pub status: ServerStatus,
    /// Public IPv4 if the server has one
    pub public_ipv4: Option<String>,
    /// Addresses in attached private networks
    pub private_ips: Vec<String>,
    /// Labels
    pub labels: Labels,
    /// Creation time
    pub created: DateTime<Utc>,
}

impl Server {
    /// First private network address, if attached
    pub fn private_ip(&self) -> Option<&str> {
        self.private_ips.first().map(String::as_str)
    }
}

/// Desired shape of a new server
#[derive(Clone, Debug, PartialEq)]
pub struct ServerSpec {
    /// Unique name
    pub name: String,
    /// Server type (e.g. `cx22`)
    pub server_type: String,
    /// Initial image
    pub image: String,
    /// Location
    pub location: String,
    /// Placement group to join
    pub placement_group: Option<ResourceId>,
    /// Private networks to attach
    pub networks: Vec<ResourceId>,
    /// Power on right after creation
    pub start_after_create: bool,
    /// Cloud-init user data
    pub user_data: String,
    /// SSH keys injected into the image
    pub ssh_keys: Vec<ResourceId>,
    /// Labels
    pub labels: Labels,
}

/// Registered SSH public key
#[derive(Clone, Debug, PartialEq)]
pub struct SshKey {
    /// Provider id
    pub id: ResourceId,
    /// Unique name
    pub name: String,
    /// Labels
    pub labels: Labels,
}

/// Desired shape of a new SSH key
#[derive(Clone, Debug, PartialEq)]
pub struct SshKeySpec {
    /// Unique name
    pub name: String,
    /// Public key in OpenSSH authorized_keys format
    pub public_key: String,
    /// Labels
    pub labels: Labels,
}

/// Trait abstracting the cloud provider API
///
/// `get_*` lookups return `Ok(None)` when nothing carries the name; `*_by_id`
/// lookups fail with a not-found error instead because the caller just
/// created the resource.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Look up a network by name
    async fn get_network(&self, name: &str) -> Result<Option<Network>>;
    /// Create a network
    async fn create_network(&self, spec: &NetworkSpec) -> Result<Network>;
    /// List networks matching a label selector
    async fn list_networks(&self, selector: &str) -> Result<Vec<Network>>;
    /// Delete a network
    async fn delete_network(&self, id: ResourceId) -> Result<()>;

    /// Look up a placement group by name
    async fn get_placement_group(&self, name: &str) -> Result<Option<PlacementGroup>>;
    /// Create a placement group
    async fn create_placement_group(&self, spec: &PlacementGroupSpec) -> Result<PlacementGroup>;
    /// List placement groups matching a label selector
    async fn list_placement_groups(&self, selector: &str) -> Result<Vec<PlacementGroup>>;
    /// Delete a placement group
    async fn delete_placement_group(&self, id: ResourceId) -> Result<()>;

    /// Look up a load balancer by name
    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>>;
    /// Fetch a load balancer by id
    async fn get_load_balancer_by_id(&self, id: ResourceId) -> Result<LoadBalancer>;
    /// Create a load balancer; targets in the spec are ignored
    async fn create_load_balancer(&self, spec: &LoadBalancerSpec) -> Result<LoadBalancer>;
    /// Attach one target to a load balancer
    async fn add_load_balancer_target(
        &self,
        id: ResourceId,
        target: &LoadBalancerTarget,
    ) -> Result<()>;
    /// List load balancers matching a label selector
    async fn list_load_balancers(&self, selector: &str) -> Result<Vec<LoadBalancer>>;
    /// Delete a load balancer
    async fn delete_load_balancer(&self, id: ResourceId) -> Result<()>;

    /// Look up a firewall by name
    async fn get_firewall(&self, name: &str) -> Result<Option<Firewall>>;
    /// Create a firewall
    async fn create_firewall(&self, spec: &FirewallSpec) -> Result<Firewall>;
    /// List firewalls matching a label selector
    async fn list_firewalls(&self, selector: &str) -> Result<Vec<Firewall>>;
    /// Delete a firewall
    async fn delete_firewall(&self, id: ResourceId) -> Result<()>;

    /// Look up a server by name
    async fn get_server(&self, name: &str) -> Result<Option<Server>>;
    /// Fetch a server by id
    async fn get_server_by_id(&self, id: ResourceId) -> Result<Server>;
    /// Create a server
    async fn create_server(&self, spec: &ServerSpec) -> Result<Server>;
    /// Replace a server's labels
    async fn update_server_labels(&self, id: ResourceId, labels: &Labels) -> Result<Server>;
    /// List servers matching a label selector
    async fn list_servers(&self, selector: &str) -> Result<Vec<Server>>;
    /// Delete a server
    async fn delete_server(&self, id: ResourceId) -> Result<()>;
    /// Power a server on
    async fn power_on(&self, id: ResourceId) -> Result<()>;
    /// Request a graceful (ACPI) shutdown
    async fn shutdown(&self, id: ResourceId) -> Result<()>;
    /// Boot into the linux64 rescue system on next start, authorising `ssh_keys`
    async fn enable_rescue(&self, id: ResourceId, ssh_keys: &[ResourceId]) -> Result<()>;

    /// Register an SSH public key
    async fn create_ssh_key(&self, spec: &SshKeySpec) -> Result<SshKey>;
    /// List SSH keys matching a label selector
    async fn list_ssh_keys(&self, selector: &str) -> Result<Vec<SshKey>>;
    /// Delete an SSH key
    async fn delete_ssh_key(&self, id: ResourceId) -> Result<()>;
}
