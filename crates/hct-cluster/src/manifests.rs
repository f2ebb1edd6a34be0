//! In-cluster add-ons applied after bootstrap
//!
//! The Hetzner cloud controller manager needs the API token and the node
//! network name, which it reads from the `kube-system/hcloud` Secret rendered
//! alongside it. The CSI driver reads its token from `kube-system/hcloud-csi`
//! and provides the default `hcloud-volumes` StorageClass.

use minijinja::{context, Environment, Value};
use serde_json::json;
use tracing::{info, instrument};

use hct_common::retry::retry;
use hct_common::{Error, Result};

use crate::context::Context;
use crate::ensure::ensure_network;
use crate::templates::network_spec;

/// Cloud controller manager image
pub const HCLOUD_CCM_IMAGE: &str = "hetznercloud/hcloud-cloud-controller-manager:v1.9.1";

/// CSI driver image
pub const HCLOUD_CSI_IMAGE: &str = "hetznercloud/hcloud-csi-driver:1.6.0";

const CSI_ATTACHER_IMAGE: &str = "k8s.gcr.io/sig-storage/csi-attacher:v3.2.1";
const CSI_RESIZER_IMAGE: &str = "k8s.gcr.io/sig-storage/csi-resizer:v1.2.0";
const CSI_PROVISIONER_IMAGE: &str = "k8s.gcr.io/sig-storage/csi-provisioner:v2.2.2";
const CSI_REGISTRAR_IMAGE: &str = "k8s.gcr.io/sig-storage/csi-node-driver-registrar:v2.2.0";
const CSI_LIVENESS_IMAGE: &str = "k8s.gcr.io/sig-storage/livenessprobe:v2.3.0";

/// Pod network handed out by the cloud controller manager
pub const POD_CIDR: &str = "10.244.0.0/16";

/// Namespace of the flannel DaemonSet
pub const FLANNEL_NAMESPACE: &str = "kube-system";

/// Name of the flannel DaemonSet
pub const FLANNEL_DAEMONSET: &str = "kube-flannel";

/// Interface carrying the private network on Hetzner servers
pub const PRIVATE_INTERFACE: &str = "eth1";

/// Cloud controller manager template loaded at compile time
const CCM_TEMPLATE: &str = include_str!("../templates/hcloud-ccm.yaml");

/// CSI driver template loaded at compile time
const CSI_TEMPLATE: &str = include_str!("../templates/hcloud-csi.yaml");

/// Inputs for applying the add-on manifests
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyManifestsOpts {
    /// Skip the cloud controller manager and its credentials Secret
    pub no_cloud_controller_manager: bool,
    /// Skip the CSI driver and its credentials Secret
    pub no_csi_driver: bool,
}

fn render(name: &'static str, template: &str, values: Value) -> Result<String> {
    let mut env = Environment::new();
    env.add_template(name, template)
        .map_err(|e| Error::internal_with_context(name, e.to_string()))?;
    env.get_template(name)
        .and_then(|t| t.render(values))
        .map_err(|e| Error::internal_with_context(name, e.to_string()))
}

/// Render the cloud controller manager bundle for `network`
pub fn render_cloud_controller_manager(token: &str, network: &str) -> Result<String> {
    render(
        "hcloud-ccm",
        CCM_TEMPLATE,
        context! {
            token => token,
            network => network,
            image => HCLOUD_CCM_IMAGE,
            pod_cidr => POD_CIDR,
        },
    )
}

/// Render the CSI driver bundle
pub fn render_csi_driver(token: &str) -> Result<String> {
    render(
        "hcloud-csi",
        CSI_TEMPLATE,
        context! {
            token => token,
            image => HCLOUD_CSI_IMAGE,
            attacher_image => CSI_ATTACHER_IMAGE,
            resizer_image => CSI_RESIZER_IMAGE,
            provisioner_image => CSI_PROVISIONER_IMAGE,
            registrar_image => CSI_REGISTRAR_IMAGE,
            liveness_image => CSI_LIVENESS_IMAGE,
        },
    )
}

/// Split a multi-document YAML stream, dropping empty documents
pub fn split_documents(yaml: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in yaml.lines() {
        if line.trim_end() == "---" {
            documents.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    documents.push(current);

    documents
        .into_iter()
        .filter(|doc| {
            doc.lines()
                .any(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        })
        .collect()
}

/// Apply every add-on manifest, one document at a time
#[instrument(skip(ctx, opts), fields(cluster = %ctx.cluster_name()))]
pub async fn apply_manifests(ctx: &Context, opts: &ApplyManifestsOpts) -> Result<usize> {
    let network = ensure_network(ctx, &network_spec(&ctx.state), false).await?;

    let mut bundle = String::new();
    if !opts.no_cloud_controller_manager {
        bundle.push_str(&render_cloud_controller_manager(
            &ctx.state.hcloud.token,
            &network.name,
        )?);
    }
    if !opts.no_csi_driver {
        bundle.push_str("\n---\n");
        bundle.push_str(&render_csi_driver(&ctx.state.hcloud.token)?);
    }

    let documents = split_documents(&bundle);
    for document in &documents {
        retry(&ctx.fast, "apply manifest", || {
            ctx.membership.apply_manifest(document)
        })
        .await?;
    }
    info!(documents = documents.len(), "Applied manifests");
    Ok(documents.len())
}

/// JSON patch pinning flannel to the private network interface
pub fn flannel_interface_patch() -> Result<json_patch::Patch> {
    serde_json::from_value(json!([{
        "op": "add",
        "path": "/spec/template/spec/containers/0/args/-",
        "value": format!("--iface={PRIVATE_INTERFACE}"),
    }]))
    .map_err(|e| Error::serialization(e.to_string()))
}

/// Make flannel route pod traffic over the private network
pub async fn patch_flannel(ctx: &Context) -> Result<()> {
    let patch = flannel_interface_patch()?;
    retry(&ctx.fast, "patch flannel", || {
        ctx.membership
            .patch_daemonset(FLANNEL_NAMESPACE, FLANNEL_DAEMONSET, &patch)
    })
    .await?;
    info!(interface = PRIVATE_INTERFACE, "Flannel pinned to private interface");
    Ok(())
}
