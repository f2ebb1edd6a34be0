//! Delete-node command

use clap::Args;
use tracing::info;

use hct_cluster::{delete_node, DeleteNodeOpts};

use super::{load_context, GlobalArgs};
use crate::Result;

/// Remove a node from the cluster
#[derive(Args, Debug)]
pub struct DeleteNodeArgs {
    /// Node name as given when it was added
    pub node_name: String,

    /// Confirm the deletion
    #[arg(long)]
    pub force: bool,

    /// Keep the cloud server after the node left the cluster
    #[arg(long)]
    pub keep_server: bool,
}

/// Run the delete-node command
pub async fn run(global: &GlobalArgs, args: DeleteNodeArgs) -> Result<()> {
    let opts = DeleteNodeOpts {
        node_name: args.node_name,
        force: args.force,
        keep_server: args.keep_server,
    };
    opts.validate()?;

    let ctx = load_context(global)?;
    delete_node(&ctx, &opts).await?;

    info!(node = %opts.node_name, keep_server = opts.keep_server, "Node deleted");
    Ok(())
}
