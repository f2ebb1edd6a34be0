//! Add-node command

use clap::Args;
use tracing::info;

use hct_cluster::{add_node, AddNodeOpts};
use hct_common::labels::NodeRole;

use super::{load_context, GlobalArgs};
use crate::Result;

/// Add a node to an existing cluster
#[derive(Args, Debug)]
pub struct AddNodeArgs {
    /// Node name (`%id%` is replaced by a random suffix)
    pub node_name: String,

    /// Add a control-plane node instead of a worker
    #[arg(long)]
    pub controlplane: bool,

    /// Worker pool the node belongs to
    #[arg(long)]
    pub pool_name: Option<String>,

    /// Server type of the node
    #[arg(long, default_value = "cx22")]
    pub server_type: String,

    /// Talos version override for this node
    #[arg(long)]
    pub talos_version: Option<String>,
}

impl AddNodeArgs {
    /// Engine inputs for these arguments
    pub fn to_opts(&self) -> AddNodeOpts {
        AddNodeOpts {
            node_name: self.node_name.clone(),
            role: if self.controlplane {
                NodeRole::ControlPlane
            } else {
                NodeRole::Worker
            },
            pool: self.pool_name.clone(),
            server_type: self.server_type.clone(),
            talos_version: self.talos_version.clone(),
            create_infrastructure: false,
        }
    }
}

/// Run the add-node command
pub async fn run(global: &GlobalArgs, args: AddNodeArgs) -> Result<()> {
    let opts = args.to_opts();
    opts.validate()?;

    let ctx = load_context(global)?;
    let server = add_node(&ctx, &opts).await?;

    info!(node = %server.name, "Node added");
    Ok(())
}
