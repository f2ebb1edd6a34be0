//! Reconcile-pool command

use clap::Args;
use tracing::info;

use hct_cluster::{reconcile_pool, ReconcilePoolOpts};

use super::{load_context, GlobalArgs};
use crate::Result;

/// Converge a worker pool on the requested size
#[derive(Args, Debug)]
pub struct ReconcilePoolArgs {
    /// Pool name
    pub pool_name: String,

    /// Members are named `{prefix}-{n}`
    #[arg(long, default_value = "worker")]
    pub node_name_prefix: String,

    /// Desired number of members
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub node_count: i64,

    /// Server type of new members
    #[arg(long, default_value = "cx22")]
    pub server_type: String,

    /// Talos version override for new members
    #[arg(long)]
    pub talos_version: Option<String>,

    /// Allow removing members when the pool is larger than requested
    #[arg(long)]
    pub force: bool,
}

/// Run the reconcile-pool command
pub async fn run(global: &GlobalArgs, args: ReconcilePoolArgs) -> Result<()> {
    let opts = ReconcilePoolOpts {
        pool_name: args.pool_name,
        node_name_prefix: args.node_name_prefix,
        node_count: args.node_count,
        server_type: args.server_type,
        talos_version: args.talos_version,
        force: args.force,
    };
    opts.validate()?;

    let ctx = load_context(global)?;
    let summary = reconcile_pool(&ctx, &opts).await?;

    info!(
        pool = %opts.pool_name,
        added = ?summary.added,
        deleted = ?summary.deleted,
        "Pool reconciled"
    );
    Ok(())
}
