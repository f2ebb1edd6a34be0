//! Apply-manifests command

use clap::Args;
use tracing::{info, warn};

use hct_cluster::manifests::patch_flannel;
use hct_cluster::{apply_manifests, ApplyManifestsOpts};

use super::{load_context, GlobalArgs};
use crate::Result;

/// Re-apply the in-cluster add-ons
#[derive(Args, Debug)]
pub struct ApplyManifestsArgs {
    /// Do not pin flannel to the private network interface
    #[arg(long)]
    pub no_flannel: bool,

    /// Do not install the Hetzner cloud controller manager
    #[arg(long, alias = "no-hcloud-cloud-controller-manager")]
    pub no_cloud_controller_manager: bool,

    /// Do not install the Hetzner CSI driver
    #[arg(long, alias = "no-hcloud-csi-driver")]
    pub no_csi_driver: bool,
}

/// Run the apply-manifests command
pub async fn run(global: &GlobalArgs, args: ApplyManifestsArgs) -> Result<()> {
    let ctx = load_context(global)?;

    if !args.no_flannel {
        if let Err(e) = patch_flannel(&ctx).await {
            warn!(error = %e, "Failed to pin flannel to the private interface");
        }
    }

    let applied = apply_manifests(
        &ctx,
        &ApplyManifestsOpts {
            no_cloud_controller_manager: args.no_cloud_controller_manager,
            no_csi_driver: args.no_csi_driver,
        },
    )
    .await?;

    info!(documents = applied, "Manifests applied");
    Ok(())
}
