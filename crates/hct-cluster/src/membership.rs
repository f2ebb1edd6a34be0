//! Kubernetes membership operations against the provisioned cluster

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use hct_common::{Error, Result};

/// Kubeconfig written by `talosctl kubeconfig .`
pub const KUBECONFIG_FILE: &str = "kubeconfig";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const FIELD_MANAGER: &str = "hcloud-talos";
const NODE_DELETE_GRACE_SECONDS: u32 = 60;

/// Summary of a registered Kubernetes node
#[derive(Clone, Debug, PartialEq)]
pub struct MemberNode {
    /// Node name, equal to the backing server's name
    pub name: String,
    /// Whether the Ready condition is True
    pub ready: bool,
    /// Reported kubelet version
    pub kubelet_version: Option<String>,
}

impl From<Node> for MemberNode {
    fn from(node: Node) -> Self {
        let status = node.status.unwrap_or_default();
        let ready = status
            .conditions
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True");
        Self {
            name: node.metadata.name.unwrap_or_default(),
            ready,
            kubelet_version: status.node_info.map(|info| info.kubelet_version),
        }
    }
}

/// Trait abstracting the Kubernetes API of the provisioned cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// List registered nodes
    async fn list_nodes(&self) -> Result<Vec<MemberNode>>;

    /// Get a node by name
    async fn get_node(&self, name: &str) -> Result<Option<MemberNode>>;

    /// Delete a node; an already absent node counts as success
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Server-side apply a single YAML or JSON document
    async fn apply_manifest(&self, manifest: &str) -> Result<()>;

    /// Apply a JSON patch to a DaemonSet
    async fn patch_daemonset(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()>;
}

/// [`ClusterMembership`] using the kubeconfig from the working directory
///
/// The kubeconfig only exists after bootstrap, so a client is created for
/// every call rather than once up front.
#[derive(Clone, Debug)]
pub struct KubeMembership {
    kubeconfig: PathBuf,
}

impl KubeMembership {
    /// Use the kubeconfig at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: path.into(),
        }
    }

    /// Use `kubeconfig` inside the cluster working directory
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(KUBECONFIG_FILE))
    }

    async fn client(&self) -> Result<Client> {
        let kubeconfig = Kubeconfig::read_from(&self.kubeconfig).map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!(
                    "failed to read kubeconfig {}: {}",
                    self.kubeconfig.display(),
                    e
                ),
            )
        })?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to load kubeconfig: {}", e),
                )
            })?;
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);
        Client::try_from(config).map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to create client: {}", e))
        })
    }
}

#[async_trait]
impl ClusterMembership for KubeMembership {
    async fn list_nodes(&self) -> Result<Vec<MemberNode>> {
        let api: Api<Node> = Api::all(self.client().await?);
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.into_iter().map(MemberNode::from).collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<MemberNode>> {
        let api: Api<Node> = Api::all(self.client().await?);
        Ok(api.get_opt(name).await?.map(MemberNode::from))
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client().await?);
        let params = DeleteParams {
            grace_period_seconds: Some(NODE_DELETE_GRACE_SECONDS),
            ..DeleteParams::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => {
                info!(node = %name, "Deleted Kubernetes node");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(node = %name, "Kubernetes node already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        let document = ManifestDocument::parse(manifest)?;
        let client = self.client().await?;
        let api: Api<DynamicObject> = match &document.namespace {
            Some(ns) => Api::namespaced_with(client, ns, &document.api_resource),
            None => Api::all_with(client, &document.api_resource),
        };
        api.patch(
            &document.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&document.value),
        )
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "apply_manifest",
                format!(
                    "failed to apply {}/{}: {}",
                    document.api_resource.kind, document.name, e
                ),
            )
        })?;
        debug!(kind = %document.api_resource.kind, name = %document.name, "Applied manifest");
        Ok(())
    }

    async fn patch_daemonset(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client().await?, namespace);
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Json::<()>(patch.clone()),
        )
        .await?;
        Ok(())
    }
}

/// Identity of a manifest document needed to address it in the API
#[derive(Clone, Debug)]
pub struct ManifestDocument {
    /// Resolved API resource
    pub api_resource: ApiResource,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, absent for cluster-scoped objects
    pub namespace: Option<String>,
    /// Full document
    pub value: serde_json::Value,
}

impl ManifestDocument {
    /// Parse a YAML or JSON document
    pub fn parse(manifest: &str) -> Result<Self> {
        let value: serde_json::Value = if manifest.trim_start().starts_with('{') {
            serde_json::from_str(manifest)
                .map_err(|e| Error::serialization(format!("invalid JSON manifest: {e}")))?
        } else {
            serde_yaml::from_str(manifest)
                .map_err(|e| Error::serialization(format!("invalid YAML manifest: {e}")))?
        };

        let field = |pointer: &str| value.pointer(pointer).and_then(|v| v.as_str());
        let api_version = field("/apiVersion")
            .ok_or_else(|| Error::serialization("manifest is missing apiVersion"))?;
        let kind = field("/kind").ok_or_else(|| Error::serialization("manifest is missing kind"))?;
        let name = field("/metadata/name")
            .ok_or_else(|| Error::serialization("manifest is missing metadata.name"))?
            .to_string();
        let namespace = field("/metadata/namespace").map(str::to_string);
        let api_resource = build_api_resource(api_version, kind);

        Ok(Self {
            api_resource,
            name,
            namespace,
            value,
        })
    }
}

/// Build an [`ApiResource`] from a manifest's apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}
