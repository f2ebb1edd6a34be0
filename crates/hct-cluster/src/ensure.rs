//! Idempotent get-or-create for the shared cluster infrastructure
//!
//! Resources are looked up by their deterministic name. An existing resource is
//! returned as-is, its shape is never reconciled against the desired one. The
//! name is the only idempotency key, so an interrupted run picks up whatever
//! the previous one managed to create.

use std::future::Future;

use tracing::{debug, info};

use hct_common::retry::retry;
use hct_common::{Error, Result};

use crate::cloud::{
    Firewall, FirewallSpec, LoadBalancer, LoadBalancerSpec, Network, NetworkSpec, PlacementGroup,
    PlacementGroupSpec,
};
use crate::context::Context;

/// Lookup and creation are retried together so a create whose response was
/// lost is recovered by name on the next attempt.
async fn get_or_create<T, G, GF, C, CF>(
    ctx: &Context,
    kind: &'static str,
    name: &str,
    create: bool,
    get: G,
    make: C,
) -> Result<(T, bool)>
where
    G: Fn() -> GF,
    GF: Future<Output = Result<Option<T>>>,
    C: Fn() -> CF,
    CF: Future<Output = Result<T>>,
{
    let get = &get;
    let make = &make;
    let (resource, created) = retry(
        &ctx.fast,
        &format!("ensure {kind} {name}"),
        move || async move {
            if let Some(existing) = get().await? {
                return Ok((existing, false));
            }
            if !create {
                return Err(Error::not_found(kind, name));
            }
            Ok((make().await?, true))
        },
    )
    .await?;

    if created {
        info!(kind, name, "Created resource");
    } else {
        debug!(kind, name, "Resource already exists");
    }
    Ok((resource, created))
}

/// Look up the cluster network by name, creating it when `create` is set
pub async fn ensure_network(ctx: &Context, spec: &NetworkSpec, create: bool) -> Result<Network> {
    let (network, _) = get_or_create(
        ctx,
        "network",
        &spec.name,
        create,
        || ctx.cloud.get_network(&spec.name),
        || ctx.cloud.create_network(spec),
    )
    .await?;
    Ok(network)
}

/// Look up a placement group by name, creating it when `create` is set
pub async fn ensure_placement_group(
    ctx: &Context,
    spec: &PlacementGroupSpec,
    create: bool,
) -> Result<PlacementGroup> {
    let (group, _) = get_or_create(
        ctx,
        "placement group",
        &spec.name,
        create,
        || ctx.cloud.get_placement_group(&spec.name),
        || ctx.cloud.create_placement_group(spec),
    )
    .await?;
    Ok(group)
}

/// Look up a load balancer by name, creating it when `create` is set
///
/// A new load balancer is polled under the slow profile until it has a public
/// address, and a private one too when it is attached to a network. Its targets are then attached one at a time;
/// the first target that cannot be attached aborts the rest.
pub async fn ensure_load_balancer(
    ctx: &Context,
    spec: &LoadBalancerSpec,
    create: bool,
) -> Result<LoadBalancer> {
    let (lb, created) = get_or_create(
        ctx,
        "load balancer",
        &spec.name,
        create,
        || ctx.cloud.get_load_balancer(&spec.name),
        || ctx.cloud.create_load_balancer(spec),
    )
    .await?;
    if !created {
        return Ok(lb);
    }

    let id = lb.id;
    let needs_private_ip = spec.network.is_some();
    let lb = retry(
        &ctx.slow,
        &format!("wait for load balancer {} addresses", spec.name),
        move || async move {
            let lb = ctx.cloud.get_load_balancer_by_id(id).await?;
            if lb.public_ipv4.is_none() || (needs_private_ip && lb.private_ips.is_empty()) {
                return Err(Error::pending(format!(
                    "load balancer {} has no addresses yet",
                    lb.name
                )));
            }
            Ok(lb)
        },
    )
    .await?;

    for target in &spec.targets {
        retry(
            &ctx.fast,
            &format!("add target to load balancer {}", spec.name),
            || ctx.cloud.add_load_balancer_target(lb.id, target),
        )
        .await?;
        debug!(load_balancer = %spec.name, ?target, "Attached load balancer target");
    }

    info!(
        load_balancer = %lb.name,
        public_ip = lb.public_ipv4.as_deref().unwrap_or_default(),
        "Load balancer ready"
    );
    Ok(lb)
}

/// Look up a firewall by name, creating it when `create` is set
pub async fn ensure_firewall(ctx: &Context, spec: &FirewallSpec, create: bool) -> Result<Firewall> {
    let (firewall, _) = get_or_create(
        ctx,
        "firewall",
        &spec.name,
        create,
        || ctx.cloud.get_firewall(&spec.name),
        || ctx.cloud.create_firewall(spec),
    )
    .await?;
    Ok(firewall)
}
