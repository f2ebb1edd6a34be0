//! Worker pool reconciliation
//!
//! A pool has no stored state. Its members are the servers carrying the
//! cluster, worker role and pool labels, and they are listed afresh on every
//! pass so changes made by other actors are picked up. Each pass adds or
//! removes exactly one node until the member count matches the desired count.

use std::cmp::Ordering;

use tracing::{debug, info, instrument};

use hct_common::labels::{self, NodeRole};
use hct_common::retry::retry;
use hct_common::{Error, Result};

use crate::cloud::Server;
use crate::context::Context;
use crate::node::{AddNodeOpts, ClusterLifecycle, DeleteNodeOpts, NodeOperations};

/// Highest suffix tried when looking for a free node name
pub const MAX_POOL_INDEX: u32 = 1000;

/// Inputs for reconciling one pool
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcilePoolOpts {
    /// Pool label value
    pub pool_name: String,
    /// Node names are `{prefix}-{n}`
    pub node_name_prefix: String,
    /// Desired number of members
    pub node_count: i64,
    /// Server type for new members
    pub server_type: String,
    /// Talos version override for new members
    pub talos_version: Option<String>,
    /// Confirms removing members when the pool is too large
    pub force: bool,
}

impl ReconcilePoolOpts {
    /// Check required fields and the desired count
    pub fn validate(&self) -> Result<()> {
        if self.pool_name.trim().is_empty() {
            return Err(Error::validation("pool name must not be empty"));
        }
        if self.node_name_prefix.trim().is_empty() {
            return Err(Error::validation("node name prefix must not be empty"));
        }
        if self.server_type.trim().is_empty() {
            return Err(Error::validation("server type must not be empty"));
        }
        if self.node_count < 0 {
            return Err(Error::validation(format!(
                "node count must not be negative, got {}",
                self.node_count
            )));
        }
        Ok(())
    }
}

/// Nodes added and removed while converging
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileSummary {
    /// Node names added, in order
    pub added: Vec<String>,
    /// Node names removed, in order
    pub deleted: Vec<String>,
}

/// Node name of a pool member, i.e. its server name without the cluster prefix
fn member_node_name<'a>(cluster: &str, server: &'a Server) -> &'a str {
    server
        .name
        .strip_prefix(cluster)
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(&server.name)
}

/// First `{prefix}-{n}` not used by any current member
pub fn next_node_name(
    cluster: &str,
    pool: &str,
    prefix: &str,
    members: &[Server],
) -> Result<String> {
    (1..=MAX_POOL_INDEX)
        .map(|n| labels::pool_node_name(prefix, n))
        .find(|candidate| {
            !members
                .iter()
                .any(|m| member_node_name(cluster, m) == candidate.as_str())
        })
        .ok_or_else(|| Error::PoolExhausted {
            pool: pool.to_string(),
            prefix: prefix.to_string(),
        })
}

/// Most recently created member, ties broken by the higher id
fn newest_member(members: &[Server]) -> Option<&Server> {
    members.iter().max_by_key(|s| (s.created, s.id))
}

/// Drive the pool to its desired size with the context's own lifecycle
pub async fn reconcile_pool(ctx: &Context, opts: &ReconcilePoolOpts) -> Result<ReconcileSummary> {
    reconcile_pool_with(ctx, &ClusterLifecycle::new(ctx), opts).await
}

/// Drive the pool to its desired size through `nodes`
///
/// Members are added one at a time, each waited on before the next, and
/// removed newest first. There is no overall deadline: an external actor that
/// keeps changing the pool keeps this loop going.
#[instrument(skip(ctx, nodes, opts), fields(cluster = %ctx.cluster_name(), pool = %opts.pool_name))]
pub async fn reconcile_pool_with(
    ctx: &Context,
    nodes: &dyn NodeOperations,
    opts: &ReconcilePoolOpts,
) -> Result<ReconcileSummary> {
    opts.validate()?;

    let cluster = ctx.cluster_name();
    let selector = labels::pool_selector(cluster, &opts.pool_name);
    let mut summary = ReconcileSummary::default();

    loop {
        let members = retry(&ctx.fast, "list pool members", || {
            ctx.cloud.list_servers(&selector)
        })
        .await?;
        let diff = members.len() as i64 - opts.node_count;
        debug!(members = members.len(), desired = opts.node_count, diff, "Observed pool");

        match diff.cmp(&0) {
            Ordering::Equal => break,
            Ordering::Less => {
                let node_name =
                    next_node_name(cluster, &opts.pool_name, &opts.node_name_prefix, &members)?;
                info!(node = %node_name, "Scaling pool up");
                nodes
                    .add_node(&AddNodeOpts {
                        node_name: node_name.clone(),
                        role: NodeRole::Worker,
                        pool: Some(opts.pool_name.clone()),
                        server_type: opts.server_type.clone(),
                        talos_version: opts.talos_version.clone(),
                        create_infrastructure: false,
                    })
                    .await?;
                summary.added.push(node_name);
            }
            Ordering::Greater => {
                let Some(victim) = newest_member(&members) else {
                    break;
                };
                let node_name = member_node_name(cluster, victim).to_string();
                if !opts.force {
                    return Err(Error::validation(format!(
                        "pool {} has {diff} nodes too many, removing them must be forced",
                        opts.pool_name
                    )));
                }
                info!(node = %node_name, "Scaling pool down");
                nodes
                    .delete_node(&DeleteNodeOpts {
                        node_name: node_name.clone(),
                        force: opts.force,
                        keep_server: false,
                    })
                    .await?;
                summary.deleted.push(node_name);
            }
        }
    }

    info!(
        added = summary.added.len(),
        deleted = summary.deleted.len(),
        "Pool converged"
    );
    Ok(summary)
}
