//! Cluster bootstrap
//!
//! Creates the working directory and the shared infrastructure, generates the
//! Talos configuration against the control-plane load balancer, images the
//! first control-plane node and bootstraps etcd on it. The steps run in order;
//! an interrupted bootstrap is resumed by running it again with `force`, the
//! ensure layer picking up whatever already exists.

use tracing::{info, instrument, warn};

use hct_common::labels::NodeRole;
use hct_common::retry::retry;
use hct_common::{
    ClusterState, Error, HcloudState, Result, DEFAULT_KUBERNETES_VERSION, DEFAULT_TALOS_VERSION,
    NETWORK_IP_RANGE,
};

use crate::cloud::Server;
use crate::context::Context;
use crate::ensure::{ensure_firewall, ensure_load_balancer, ensure_network, ensure_placement_group};
use crate::manifests::{apply_manifests, patch_flannel, ApplyManifestsOpts};
use crate::node::{provision_node, wait_for_node_registered, AddNodeOpts};
use crate::talos::GenConfigOptions;
use crate::templates::{
    controlplane_load_balancer_spec, controlplane_placement_group_spec, network_spec,
    node_firewall_spec,
};

/// Inputs for bootstrapping a new cluster
#[derive(Clone, Debug, PartialEq)]
pub struct BootstrapClusterOpts {
    /// Cluster name, prefix of every resource name
    pub cluster_name: String,
    /// Name of the first control-plane node
    pub node_name: String,
    /// Server type of the first control-plane node
    pub server_type: String,
    /// Hetzner location (e.g. `nbg1`)
    pub location: String,
    /// Hetzner network zone (e.g. `eu-central`)
    pub network_zone: String,
    /// Hetzner Cloud API token
    pub token: String,
    /// Talos version, the built-in default when absent
    pub talos_version: Option<String>,
    /// Kubernetes version, the built-in default when absent
    pub kubernetes_version: Option<String>,
    /// Do not create the node firewall
    pub no_firewall: bool,
    /// Do not enable KubeSpan
    pub no_talos_kubespan: bool,
    /// Do not pin flannel to the private interface
    pub no_flannel: bool,
    /// Wipe a non-empty working directory
    pub force: bool,
    /// Add-ons applied once the cluster is up
    pub manifests: ApplyManifestsOpts,
}

impl BootstrapClusterOpts {
    /// Check required fields and the cluster name format
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("cluster name", &self.cluster_name),
            ("node name", &self.node_name),
            ("server type", &self.server_type),
            ("location", &self.location),
            ("network zone", &self.network_zone),
            ("token", &self.token),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("{field} must not be empty")));
            }
        }
        let valid_name = self
            .cluster_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !self.cluster_name.starts_with('-')
            && !self.cluster_name.ends_with('-');
        if !valid_name {
            return Err(Error::validation(format!(
                "cluster name {:?} must consist of lowercase letters, digits and inner dashes",
                self.cluster_name
            )));
        }
        Ok(())
    }

    /// State persisted for the new cluster, with versions pinned
    pub fn cluster_state(&self) -> ClusterState {
        ClusterState {
            cluster_name: self.cluster_name.clone(),
            hcloud: HcloudState {
                location: self.location.clone(),
                network_zone: self.network_zone.clone(),
                token: self.token.clone(),
            },
            talos_version: Some(
                self.talos_version
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TALOS_VERSION.to_string()),
            ),
            kubernetes_version: Some(
                self.kubernetes_version
                    .clone()
                    .unwrap_or_else(|| DEFAULT_KUBERNETES_VERSION.to_string()),
            ),
        }
    }
}

/// Bootstrap a new cluster from an empty working directory
///
/// `ctx` must have been built over [`BootstrapClusterOpts::cluster_state`].
/// Returns the first control-plane server.
#[instrument(skip(ctx, opts), fields(cluster = %ctx.cluster_name()))]
pub async fn bootstrap_cluster(ctx: &Context, opts: &BootstrapClusterOpts) -> Result<Server> {
    opts.validate()?;
    ctx.store.create(&ctx.state, opts.force)?;
    info!(dir = %ctx.store.dir().display(), "Created cluster state");

    let network = ensure_network(ctx, &network_spec(&ctx.state), true).await?;
    ensure_placement_group(ctx, &controlplane_placement_group_spec(&ctx.state), true).await?;
    let lb = ensure_load_balancer(
        ctx,
        &controlplane_load_balancer_spec(&ctx.state, &network),
        true,
    )
    .await?;
    if opts.no_firewall {
        info!("Skipping node firewall");
    } else {
        ensure_firewall(ctx, &node_firewall_spec(&ctx.state, &network), true).await?;
    }

    let endpoint = lb
        .public_ipv4
        .as_deref()
        .ok_or_else(|| Error::not_found("load balancer public IP", &lb.name))?;
    let gen_options = GenConfigOptions {
        kubernetes_version: Some(
            ctx.state
                .kubernetes_version
                .clone()
                .unwrap_or_else(|| DEFAULT_KUBERNETES_VERSION.to_string()),
        ),
        kubespan: !opts.no_talos_kubespan,
        node_subnet: NETWORK_IP_RANGE.to_string(),
    };
    ctx.bootstrapper
        .gen_config(ctx.cluster_name(), endpoint, &gen_options)
        .await?;

    let server = provision_node(
        ctx,
        &AddNodeOpts {
            node_name: opts.node_name.clone(),
            role: NodeRole::ControlPlane,
            pool: None,
            server_type: opts.server_type.clone(),
            talos_version: None,
            create_infrastructure: true,
        },
    )
    .await?;
    let node_ip = server
        .private_ip()
        .ok_or_else(|| Error::not_found("server private IP", &server.name))?;

    retry(&ctx.slow, "talos bootstrap", || ctx.bootstrapper.bootstrap(node_ip)).await?;
    info!(node = %server.name, "Talos bootstrapped");
    retry(&ctx.fast, "fetch kubeconfig", || {
        ctx.bootstrapper.fetch_kubeconfig(node_ip)
    })
    .await?;

    wait_for_node_registered(ctx, &server.name).await?;
    if let Some(node) = ctx.membership.get_node(&server.name).await? {
        info!(
            node = %node.name,
            kubelet = node.kubelet_version.as_deref().unwrap_or("unknown"),
            "Control plane registered"
        );
    }

    if opts.no_flannel {
        info!("Skipping flannel interface patch");
    } else if let Err(e) = patch_flannel(ctx).await {
        warn!(error = %e, "Failed to pin flannel to the private interface");
    }

    apply_manifests(ctx, &opts.manifests).await?;
    info!(endpoint, node = %server.name, "Cluster bootstrapped");
    Ok(server)
}
