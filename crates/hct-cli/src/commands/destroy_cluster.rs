//! Destroy-cluster command

use clap::Args;
use tracing::{info, warn};

use hct_cluster::{destroy_cluster, DestroyClusterOpts};

use super::{load_context, GlobalArgs};
use crate::Result;

/// Delete every cloud resource owned by the cluster
#[derive(Args, Debug)]
pub struct DestroyClusterArgs {
    /// Confirm the teardown
    #[arg(long)]
    pub force: bool,
}

/// Run the destroy-cluster command
pub async fn run(global: &GlobalArgs, args: DestroyClusterArgs) -> Result<()> {
    let opts = DestroyClusterOpts { force: args.force };
    opts.validate()?;

    let ctx = load_context(global)?;
    let summary = destroy_cluster(&ctx, &opts).await?;

    if summary.failed > 0 {
        warn!(
            deleted = summary.deleted,
            failed = summary.failed,
            "Some resources could not be deleted, run destroy-cluster again"
        );
    } else {
        info!(deleted = summary.deleted, "Cluster destroyed");
    }
    Ok(())
}
