//! Node lifecycle: add a node to the cluster and take it out again
//!
//! The Kubernetes node name of a server is its cloud server name
//! (`{cluster}-{node}`), which is what registration waits and membership
//! removal key on.

use async_trait::async_trait;
use tracing::{info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use hct_common::labels::{self, NodeRole};
use hct_common::retry::retry;
use hct_common::{Error, Result};

use crate::cloud::{Server, ServerStatus};
use crate::context::Context;
use crate::ensure::{ensure_network, ensure_placement_group};
use crate::imaging::create_server_from_image;
use crate::templates::{controlplane_placement_group_spec, network_spec, node_template};

/// Inputs for adding one node
#[derive(Clone, Debug, PartialEq)]
pub struct AddNodeOpts {
    /// Node name, may contain `%id%`
    pub node_name: String,
    /// Control plane or worker
    pub role: NodeRole,
    /// Worker pool the node belongs to
    pub pool: Option<String>,
    /// Server type (e.g. `cx22`)
    pub server_type: String,
    /// Talos version override for this node
    pub talos_version: Option<String>,
    /// Create the network and placement group if they are missing
    pub create_infrastructure: bool,
}

impl AddNodeOpts {
    /// Check required fields before anything touches the cloud
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::validation("node name must not be empty"));
        }
        if self.server_type.trim().is_empty() {
            return Err(Error::validation("server type must not be empty"));
        }
        match (&self.pool, self.role) {
            (Some(_), NodeRole::ControlPlane) => Err(Error::validation(
                "pools are only supported for worker nodes",
            )),
            (Some(pool), NodeRole::Worker) if pool.trim().is_empty() => {
                Err(Error::validation("pool name must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Inputs for removing one node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteNodeOpts {
    /// Node name as given when it was added
    pub node_name: String,
    /// Confirms the destructive call
    pub force: bool,
    /// Leave the cloud server in place after the node left the cluster
    pub keep_server: bool,
}

impl DeleteNodeOpts {
    /// Check required fields and the force flag
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::validation("node name must not be empty"));
        }
        if !self.force {
            return Err(Error::validation("deleting a node must be forced"));
        }
        Ok(())
    }
}

/// Trait abstracting single-node transitions
///
/// The pool reconciler drives nodes through this seam so its convergence
/// logic can be exercised without imaging servers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeOperations: Send + Sync {
    /// Add a node and wait for it to register
    async fn add_node(&self, opts: &AddNodeOpts) -> Result<Server>;

    /// Remove a node from the cluster and the cloud
    async fn delete_node(&self, opts: &DeleteNodeOpts) -> Result<()>;
}

/// [`NodeOperations`] against the real collaborators of a [`Context`]
pub struct ClusterLifecycle<'a> {
    ctx: &'a Context,
}

impl<'a> ClusterLifecycle<'a> {
    /// Lifecycle operations over `ctx`
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl NodeOperations for ClusterLifecycle<'_> {
    async fn add_node(&self, opts: &AddNodeOpts) -> Result<Server> {
        add_node(self.ctx, opts).await
    }

    async fn delete_node(&self, opts: &DeleteNodeOpts) -> Result<()> {
        delete_node(self.ctx, opts).await
    }
}

/// Create, image and register one node
pub async fn add_node(ctx: &Context, opts: &AddNodeOpts) -> Result<Server> {
    let server = provision_node(ctx, opts).await?;
    wait_for_node_registered(ctx, &server.name).await?;
    info!(node = %server.name, role = %opts.role, "Node joined the cluster");
    Ok(server)
}

/// Create and image one node without waiting for it to register
///
/// The first control-plane node cannot register before the cluster is
/// bootstrapped, so bootstrap uses this directly.
#[instrument(skip(ctx, opts), fields(cluster = %ctx.cluster_name(), node = %opts.node_name))]
pub async fn provision_node(ctx: &Context, opts: &AddNodeOpts) -> Result<Server> {
    opts.validate()?;

    let network = ensure_network(ctx, &network_spec(&ctx.state), opts.create_infrastructure).await?;
    let placement_group = match opts.role {
        NodeRole::ControlPlane => Some(
            ensure_placement_group(
                ctx,
                &controlplane_placement_group_spec(&ctx.state),
                opts.create_infrastructure,
            )
            .await?,
        ),
        NodeRole::Worker => None,
    };

    let template = node_template(
        ctx,
        opts.role,
        &opts.node_name,
        &opts.server_type,
        opts.pool.as_deref(),
        opts.talos_version.as_deref(),
    )?;
    info!(server = %template.name, role = %opts.role, "Provisioning node");
    create_server_from_image(ctx, &network, placement_group.as_ref(), &template).await
}

/// Poll the Kubernetes API until a node named `node_name` exists
pub async fn wait_for_node_registered(ctx: &Context, node_name: &str) -> Result<()> {
    retry(&ctx.slow, "wait for node registration", move || async move {
        let nodes = ctx.membership.list_nodes().await?;
        if nodes.iter().any(|n| n.name == node_name) {
            Ok(())
        } else {
            Err(Error::pending(format!("node {node_name} not registered yet")))
        }
    })
    .await
}

/// Reset a node, remove it from Kubernetes and delete its server
#[instrument(skip(ctx, opts), fields(cluster = %ctx.cluster_name(), node = %opts.node_name))]
pub async fn delete_node(ctx: &Context, opts: &DeleteNodeOpts) -> Result<()> {
    opts.validate()?;

    let server_name = labels::server_name(ctx.cluster_name(), &opts.node_name);
    let server = retry(&ctx.fast, "get server", || ctx.cloud.get_server(&server_name))
        .await?
        .ok_or_else(|| Error::not_found("server", &server_name))?;
    let private_ip = server
        .private_ip()
        .ok_or_else(|| Error::not_found("server private IP", &server_name))?;
    let id = server.id;

    retry(&ctx.fast, "reset node", || ctx.bootstrapper.reset(private_ip)).await?;
    info!(server = %server_name, "Node reset");

    if let Err(e) = retry(&ctx.fast, "shutdown", || ctx.cloud.shutdown(id)).await {
        warn!(server = %server_name, error = %e, "Shutdown request failed");
    }
    let powered_off = retry(&ctx.slow, "wait for power off", move || async move {
        let server = ctx.cloud.get_server_by_id(id).await?;
        if server.status == ServerStatus::Off {
            Ok(())
        } else {
            Err(Error::pending(format!(
                "server {} is {:?}",
                server.name, server.status
            )))
        }
    })
    .await;
    if let Err(e) = powered_off {
        warn!(server = %server_name, error = %e, "Server did not report power off, continuing");
    }

    retry(&ctx.fast, "delete kubernetes node", || {
        ctx.membership.delete_node(&server_name)
    })
    .await?;

    if opts.keep_server {
        info!(server = %server_name, "Node removed, keeping server");
        return Ok(());
    }
    retry(&ctx.fast, "delete server", || ctx.cloud.delete_server(id)).await?;
    info!(server = %server_name, "Node and server deleted");
    Ok(())
}
