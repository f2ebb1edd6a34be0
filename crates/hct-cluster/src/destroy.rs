//! Cluster teardown
//!
//! Everything carrying the cluster's ownership label is deleted, kind by kind,
//! servers first so nothing still references the shared resources. Teardown is
//! best effort: failures are logged and counted, and the remaining resources
//! are still processed.

use std::future::Future;

use tracing::{info, instrument, warn};

use hct_common::labels;
use hct_common::retry::retry;
use hct_common::{Error, Result};

use crate::cloud::ResourceId;
use crate::context::Context;

/// Inputs for destroying a cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DestroyClusterOpts {
    /// Confirms the destructive call
    pub force: bool,
}

impl DestroyClusterOpts {
    /// Destroying must be forced
    pub fn validate(&self) -> Result<()> {
        if !self.force {
            return Err(Error::validation("destroying a cluster must be forced"));
        }
        Ok(())
    }
}

/// Outcome of a teardown
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DestroySummary {
    /// Resources deleted
    pub deleted: usize,
    /// Listings or deletions that failed
    pub failed: usize,
}

async fn delete_all<D, DF>(
    ctx: &Context,
    summary: &mut DestroySummary,
    kind: &'static str,
    listed: Result<Vec<(ResourceId, String)>>,
    delete: D,
) where
    D: Fn(ResourceId) -> DF,
    DF: Future<Output = Result<()>>,
{
    let items = match listed {
        Ok(items) => items,
        Err(e) => {
            warn!(kind, error = %e, "Failed to list resources, skipping kind");
            summary.failed += 1;
            return;
        }
    };

    for (id, name) in items {
        match retry(&ctx.fast, &format!("delete {kind} {name}"), || delete(id)).await {
            Ok(()) => {
                info!(kind, name = %name, "Deleted");
                summary.deleted += 1;
            }
            Err(e) => {
                warn!(kind, name = %name, error = %e, "Failed to delete, continuing");
                summary.failed += 1;
            }
        }
    }
}

/// Delete every resource owned by the cluster
#[instrument(skip(ctx, opts), fields(cluster = %ctx.cluster_name()))]
pub async fn destroy_cluster(ctx: &Context, opts: &DestroyClusterOpts) -> Result<DestroySummary> {
    opts.validate()?;

    let selector = labels::cluster_selector(ctx.cluster_name());
    let mut summary = DestroySummary::default();

    let servers = retry(&ctx.fast, "list servers", || ctx.cloud.list_servers(&selector))
        .await
        .map(|items| items.into_iter().map(|s| (s.id, s.name)).collect());
    delete_all(ctx, &mut summary, "server", servers, |id| {
        ctx.cloud.delete_server(id)
    })
    .await;

    let firewalls = retry(&ctx.fast, "list firewalls", || {
        ctx.cloud.list_firewalls(&selector)
    })
    .await
    .map(|items| items.into_iter().map(|f| (f.id, f.name)).collect());
    delete_all(ctx, &mut summary, "firewall", firewalls, |id| {
        ctx.cloud.delete_firewall(id)
    })
    .await;

    let load_balancers = retry(&ctx.fast, "list load balancers", || {
        ctx.cloud.list_load_balancers(&selector)
    })
    .await
    .map(|items| items.into_iter().map(|lb| (lb.id, lb.name)).collect());
    delete_all(ctx, &mut summary, "load balancer", load_balancers, |id| {
        ctx.cloud.delete_load_balancer(id)
    })
    .await;

    let placement_groups = retry(&ctx.fast, "list placement groups", || {
        ctx.cloud.list_placement_groups(&selector)
    })
    .await
    .map(|items| items.into_iter().map(|pg| (pg.id, pg.name)).collect());
    delete_all(ctx, &mut summary, "placement group", placement_groups, |id| {
        ctx.cloud.delete_placement_group(id)
    })
    .await;

    let networks = retry(&ctx.fast, "list networks", || ctx.cloud.list_networks(&selector))
        .await
        .map(|items| items.into_iter().map(|n| (n.id, n.name)).collect());
    delete_all(ctx, &mut summary, "network", networks, |id| {
        ctx.cloud.delete_network(id)
    })
    .await;

    let ssh_keys = retry(&ctx.fast, "list ssh keys", || ctx.cloud.list_ssh_keys(&selector))
        .await
        .map(|items| items.into_iter().map(|k| (k.id, k.name)).collect());
    delete_all(ctx, &mut summary, "ssh key", ssh_keys, |id| {
        ctx.cloud.delete_ssh_key(id)
    })
    .await;

    info!(
        deleted = summary.deleted,
        failed = summary.failed,
        "Cluster teardown finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{MockCloudClient, SshKeySpec};
    use crate::ensure::{ensure_firewall, ensure_load_balancer, ensure_network, ensure_placement_group};
    use crate::node::{add_node, AddNodeOpts};
    use crate::templates;
    use crate::testing::{mock_cloud_context, TestHarness};
    use hct_common::labels::NodeRole;

    async fn provisioned() -> TestHarness {
        let harness = TestHarness::new();
        let ctx = &harness.ctx;
        let network = ensure_network(ctx, &templates::network_spec(&ctx.state), true)
            .await
            .unwrap();
        ensure_placement_group(ctx, &templates::controlplane_placement_group_spec(&ctx.state), true)
            .await
            .unwrap();
        ensure_load_balancer(
            ctx,
            &templates::controlplane_load_balancer_spec(&ctx.state, &network),
            true,
        )
        .await
        .unwrap();
        ensure_firewall(ctx, &templates::node_firewall_spec(&ctx.state, &network), true)
            .await
            .unwrap();
        add_node(
            ctx,
            &AddNodeOpts {
                node_name: "worker-1".to_string(),
                role: NodeRole::Worker,
                pool: None,
                server_type: "cx22".to_string(),
                talos_version: None,
                create_infrastructure: false,
            },
        )
        .await
        .unwrap();
        ctx.cloud
            .create_ssh_key(&SshKeySpec {
                name: "demo-worker-2-init-leftover".to_string(),
                public_key: "ssh-ed25519 AAAA".to_string(),
                labels: labels::base_labels("demo"),
            })
            .await
            .unwrap();
        harness
    }

    #[tokio::test]
    async fn destroy_requires_force() {
        let (_dir, ctx) = mock_cloud_context(MockCloudClient::new());
        let err = destroy_cluster(&ctx, &DestroyClusterOpts { force: false })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    /// Story: a provisioned cluster is torn down servers first, shared
    /// infrastructure last, and other clusters' servers survive.
    #[tokio::test]
    async fn destroy_deletes_every_owned_resource_in_order() {
        let harness = provisioned().await;
        let foreign = harness.cloud.seed_worker("other", "worker-1", "default", 0);
        let before = harness.cloud.calls().len();

        let summary = destroy_cluster(&harness.ctx, &DestroyClusterOpts { force: true })
            .await
            .unwrap();

        assert_eq!(summary, DestroySummary { deleted: 6, failed: 0 });
        let deletions: Vec<String> = harness.cloud.calls()[before..]
            .iter()
            .filter(|c| c.starts_with("delete_"))
            .cloned()
            .collect();
        assert_eq!(
            deletions,
            vec![
                "delete_server demo-worker-1",
                "delete_firewall demo-nodes",
                "delete_load_balancer demo-controlplane",
                "delete_placement_group demo-controlplanes",
                "delete_network demo-nodes",
                "delete_ssh_key demo-worker-2-init-leftover",
            ]
        );
        assert_eq!(harness.cloud.servers(), vec![foreign]);
        assert!(harness.cloud.networks().is_empty());
        assert!(harness.cloud.ssh_keys().is_empty());
    }

    #[tokio::test]
    async fn failed_deletion_does_not_stop_teardown() {
        let harness = provisioned().await;
        harness.cloud.fail_on("delete_firewall demo-nodes");

        let summary = destroy_cluster(&harness.ctx, &DestroyClusterOpts { force: true })
            .await
            .unwrap();

        assert_eq!(summary, DestroySummary { deleted: 5, failed: 1 });
        assert!(harness.cloud.networks().is_empty());
        assert!(harness.cloud.calls_to("delete_ssh_key").len() >= 2);
    }
}
