//! Bootstrap command - create a new cluster in an empty working directory

use clap::Args;
use tracing::info;

use hct_cluster::{bootstrap_cluster, ApplyManifestsOpts, BootstrapClusterOpts, Context};

use super::GlobalArgs;
use crate::Result;

/// Bootstrap a new cluster
#[derive(Args, Debug)]
pub struct BootstrapClusterArgs {
    /// Cluster name, prefix of every cloud resource
    pub cluster_name: String,

    /// Name of the first control-plane node (`%id%` is replaced by a random suffix)
    #[arg(default_value = "controlplane-%id%")]
    pub node_name: String,

    /// Hetzner Cloud API token
    #[arg(long, env = "HCLOUD_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Server type of the first control-plane node
    #[arg(long, default_value = "cx22")]
    pub server_type: String,

    /// Hetzner location
    #[arg(long, default_value = "nbg1")]
    pub location: String,

    /// Hetzner network zone
    #[arg(long, default_value = "eu-central")]
    pub network_zone: String,

    /// Talos version to pin for the cluster
    #[arg(long)]
    pub talos_version: Option<String>,

    /// Kubernetes version to pin for the cluster
    #[arg(long)]
    pub kubernetes_version: Option<String>,

    /// Do not create the node firewall
    #[arg(long)]
    pub no_firewall: bool,

    /// Do not enable Talos KubeSpan
    #[arg(long)]
    pub no_talos_kubespan: bool,

    /// Do not pin flannel to the private network interface
    #[arg(long)]
    pub no_flannel: bool,

    /// Do not install the Hetzner cloud controller manager
    #[arg(long, alias = "no-hcloud-cloud-controller-manager")]
    pub no_cloud_controller_manager: bool,

    /// Do not install the Hetzner CSI driver
    #[arg(long, alias = "no-hcloud-csi-driver")]
    pub no_csi_driver: bool,

    /// Wipe a non-empty working directory
    #[arg(long)]
    pub force: bool,
}

impl BootstrapClusterArgs {
    /// Engine inputs for these arguments
    pub fn to_opts(&self) -> BootstrapClusterOpts {
        BootstrapClusterOpts {
            cluster_name: self.cluster_name.clone(),
            node_name: self.node_name.clone(),
            server_type: self.server_type.clone(),
            location: self.location.clone(),
            network_zone: self.network_zone.clone(),
            token: self.token.clone(),
            talos_version: self.talos_version.clone(),
            kubernetes_version: self.kubernetes_version.clone(),
            no_firewall: self.no_firewall,
            no_talos_kubespan: self.no_talos_kubespan,
            no_flannel: self.no_flannel,
            force: self.force,
            manifests: ApplyManifestsOpts {
                no_cloud_controller_manager: self.no_cloud_controller_manager,
                no_csi_driver: self.no_csi_driver,
            },
        }
    }
}

/// Run the bootstrap command
pub async fn run(global: &GlobalArgs, args: BootstrapClusterArgs) -> Result<()> {
    let opts = args.to_opts();
    opts.validate()?;

    let ctx = Context::builder(global.store(), opts.cluster_state()).build()?;
    let server = bootstrap_cluster(&ctx, &opts).await?;

    info!(
        cluster = %opts.cluster_name,
        node = %server.name,
        dir = %global.dir.display(),
        "Cluster ready, kubeconfig and talosconfig written to the working directory"
    );
    Ok(())
}
