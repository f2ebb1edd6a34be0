//! Hetzner Cloud REST adapter for [`CloudClient`]

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::trace;

use hct_common::{Error, Result};

use super::{
    CloudClient, Firewall, FirewallSpec, Labels, LoadBalancer, LoadBalancerSpec,
    LoadBalancerTarget, Network, NetworkSpec, PlacementGroup, PlacementGroupSpec, ResourceId,
    Server, ServerSpec, ServerStatus, SshKey, SshKeySpec,
};

/// Public API endpoint
pub const API_BASE_URL: &str = "https://api.hetzner.cloud/v1";

const PAGE_SIZE: u32 = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`CloudClient`] backed by the Hetzner Cloud API
#[derive(Clone)]
pub struct HcloudClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl fmt::Debug for HcloudClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HcloudClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HcloudClient {
    /// Create a client for the public API
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, API_BASE_URL)
    }

    /// Create a client against a custom endpoint
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("hcloud-talos/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::cloud(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        trace!(%method, path, "Cloud API request");
        let mut request = self
            .http
            .request(method.clone(), format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::cloud(format!("{method} {path}: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(api_error(status.as_u16(), &text))
    }

    async fn send_json(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        self.send(method, path, query, body)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| Error::cloud(format!("failed to decode response of {path}: {e}")))
    }

    async fn list<W: DeserializeOwned>(
        &self,
        collection: &str,
        filter: (&str, &str),
    ) -> Result<Vec<W>> {
        let path = format!("/{collection}");
        let mut items = Vec::new();
        let mut page = 1u64;
        loop {
            let query = [
                (filter.0, filter.1.to_string()),
                ("per_page", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            let mut value = self.send_json(Method::GET, &path, &query, None).await?;
            let batch: Vec<W> = take_field(&mut value, collection)?;
            items.extend(batch);
            match next_page(&value) {
                Some(next) => page = next,
                None => return Ok(items),
            }
        }
    }

    async fn find_by_name<W: DeserializeOwned>(
        &self,
        collection: &str,
        name: &str,
    ) -> Result<Option<W>> {
        let mut found: Vec<W> = self.list(collection, ("name", name)).await?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    async fn list_by_selector<W: DeserializeOwned>(
        &self,
        collection: &str,
        selector: &str,
    ) -> Result<Vec<W>> {
        self.list(collection, ("label_selector", selector)).await
    }

    async fn get_by_id<W: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
        kind: &'static str,
        id: ResourceId,
    ) -> Result<W> {
        let path = format!("/{collection}/{id}");
        match self.send_json(Method::GET, &path, &[], None).await {
            Ok(mut value) => take_field(&mut value, key),
            Err(Error::Cloud {
                status: Some(404), ..
            }) => Err(Error::not_found(kind, id.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn create<W: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
        body: Value,
    ) -> Result<W> {
        let path = format!("/{collection}");
        let mut value = self
            .send_json(Method::POST, &path, &[], Some(&body))
            .await?;
        take_field(&mut value, key)
    }

    async fn delete(&self, collection: &str, id: ResourceId) -> Result<()> {
        let path = format!("/{collection}/{id}");
        self.send(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }

    async fn action(
        &self,
        collection: &str,
        id: ResourceId,
        action: &str,
        body: Option<Value>,
    ) -> Result<()> {
        let path = format!("/{collection}/{id}/actions/{action}");
        self.send(Method::POST, &path, &[], body.as_ref()).await?;
        Ok(())
    }
}

#[async_trait]
impl CloudClient for HcloudClient {
    async fn get_network(&self, name: &str) -> Result<Option<Network>> {
        let wire: Option<NetworkWire> = self.find_by_name("networks", name).await?;
        Ok(wire.map(Into::into))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<Network> {
        let wire: NetworkWire = self
            .create("networks", "network", network_body(spec))
            .await?;
        Ok(wire.into())
    }

    async fn list_networks(&self, selector: &str) -> Result<Vec<Network>> {
        let wire: Vec<NetworkWire> = self.list_by_selector("networks", selector).await?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn delete_network(&self, id: ResourceId) -> Result<()> {
        self.delete("networks", id).await
    }

    async fn get_placement_group(&self, name: &str) -> Result<Option<PlacementGroup>> {
        let wire: Option<NamedWire> = self.find_by_name("placement_groups", name).await?;
        Ok(wire.map(Into::into))
    }

    async fn create_placement_group(&self, spec: &PlacementGroupSpec) -> Result<PlacementGroup> {
        let body = json!({
            "name": spec.name,
            "type": spec.kind,
            "labels": spec.labels,
        });
        let wire: NamedWire = self
            .create("placement_groups", "placement_group", body)
            .await?;
        Ok(wire.into())
    }

    async fn list_placement_groups(&self, selector: &str) -> Result<Vec<PlacementGroup>> {
        let wire: Vec<NamedWire> = self
            .list_by_selector("placement_groups", selector)
            .await?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn delete_placement_group(&self, id: ResourceId) -> Result<()> {
        self.delete("placement_groups", id).await
    }

    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>> {
        let wire: Option<LoadBalancerWire> = self.find_by_name("load_balancers", name).await?;
        Ok(wire.map(Into::into))
    }

    async fn get_load_balancer_by_id(&self, id: ResourceId) -> Result<LoadBalancer> {
        let wire: LoadBalancerWire = self
            .get_by_id("load_balancers", "load_balancer", "load balancer", id)
            .await?;
        Ok(wire.into())
    }

    async fn create_load_balancer(&self, spec: &LoadBalancerSpec) -> Result<LoadBalancer> {
        let wire: LoadBalancerWire = self
            .create("load_balancers", "load_balancer", load_balancer_body(spec))
            .await?;
        Ok(wire.into())
    }

    async fn add_load_balancer_target(
        &self,
        id: ResourceId,
        target: &LoadBalancerTarget,
    ) -> Result<()> {
        self.action("load_balancers", id, "add_target", Some(target_body(target)))
            .await
    }

    async fn list_load_balancers(&self, selector: &str) -> Result<Vec<LoadBalancer>> {
        let wire: Vec<LoadBalancerWire> =
            self.list_by_selector("load_balancers", selector).await?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn delete_load_balancer(&self, id: ResourceId) -> Result<()> {
        self.delete("load_balancers", id).await
    }

    async fn get_firewall(&self, name: &str) -> Result<Option<Firewall>> {
        let wire: Option<NamedWire> = self.find_by_name("firewalls", name).await?;
        Ok(wire.map(Into::into))
    }

    async fn create_firewall(&self, spec: &FirewallSpec) -> Result<Firewall> {
        let wire: NamedWire = self
            .create("firewalls", "firewall", firewall_body(spec))
            .await?;
        Ok(wire.into())
    }

    async fn list_firewalls(&self, selector: &str) -> Result<Vec<Firewall>> {
        let wire: Vec<NamedWire> = self.list_by_selector("firewalls", selector).await?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn delete_firewall(&self, id: ResourceId) -> Result<()> {
        self.delete("firewalls", id).await
    }

    async fn get_server(&self, name: &str) -> Result<Option<Server>> {
        let wire: Option<ServerWire> = self.find_by_name("servers", name).await?;
        Ok(wire.map(Into::into))
    }

    async fn get_server_by_id(&self, id: ResourceId) -> Result<Server> {
        let wire: ServerWire = self.get_by_id("servers", "server", "server", id).await?;
        Ok(wire.into())
    }

    async fn create_server(&self, spec: &ServerSpec) -> Result<Server> {
        let wire: ServerWire = self
            .create("servers", "server", server_body(spec))
            .await?;
        Ok(wire.into())
    }

    async fn update_server_labels(&self, id: ResourceId, labels: &Labels) -> Result<Server> {
        let path = format!("/servers/{id}");
        let body = json!({ "labels": labels });
        let mut value = self
            .send_json(Method::PUT, &path, &[], Some(&body))
            .await?;
        let wire: ServerWire = take_field(&mut value, "server")?;
        Ok(wire.into())
    }

    async fn list_servers(&self, selector: &str) -> Result<Vec<Server>> {
        let wire: Vec<ServerWire> = self.list_by_selector("servers", selector).await?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn delete_server(&self, id: ResourceId) -> Result<()> {
        self.delete("servers", id).await
    }

    async fn power_on(&self, id: ResourceId) -> Result<()> {
        self.action("servers", id, "poweron", None).await
    }

    async fn shutdown(&self, id: ResourceId) -> Result<()> {
        self.action("servers", id, "shutdown", None).await
    }

    async fn enable_rescue(&self, id: ResourceId, ssh_keys: &[ResourceId]) -> Result<()> {
        let body = json!({ "type": "linux64", "ssh_keys": ssh_keys });
        self.action("servers", id, "enable_rescue", Some(body)).await
    }

    async fn create_ssh_key(&self, spec: &SshKeySpec) -> Result<SshKey> {
        let body = json!({
            "name": spec.name,
            "public_key": spec.public_key,
            "labels": spec.labels,
        });
        let wire: NamedWire = self.create("ssh_keys", "ssh_key", body).await?;
        Ok(wire.into())
    }

    async fn list_ssh_keys(&self, selector: &str) -> Result<Vec<SshKey>> {
        let wire: Vec<NamedWire> = self.list_by_selector("ssh_keys", selector).await?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn delete_ssh_key(&self, id: ResourceId) -> Result<()> {
        self.delete("ssh_keys", id).await
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    code: String,
    message: String,
}

fn api_error(status: u16, body: &str) -> Error {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => Error::cloud_status(
            status,
            format!("{}: {}", parsed.error.code, parsed.error.message),
        ),
        Err(_) if body.trim().is_empty() => Error::cloud_status(status, "empty response body"),
        Err(_) => Error::cloud_status(status, body.trim().to_string()),
    }
}

fn take_field<W: DeserializeOwned>(value: &mut Value, key: &str) -> Result<W> {
    let field = value
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| Error::cloud(format!("response is missing field {key:?}")))?;
    serde_json::from_value(field)
        .map_err(|e| Error::cloud(format!("failed to decode {key:?}: {e}")))
}

fn next_page(value: &Value) -> Option<u64> {
    value
        .pointer("/meta/pagination/next_page")
        .and_then(Value::as_u64)
}

/// Resources that only need id, name and labels
#[derive(Debug, Deserialize)]
struct NamedWire {
    id: ResourceId,
    name: String,
    #[serde(default)]
    labels: Labels,
}

impl From<NamedWire> for PlacementGroup {
    fn from(w: NamedWire) -> Self {
        Self {
            id: w.id,
            name: w.name,
            labels: w.labels,
        }
    }
}

impl From<NamedWire> for Firewall {
    fn from(w: NamedWire) -> Self {
        Self {
            id: w.id,
            name: w.name,
            labels: w.labels,
        }
    }
}

impl From<NamedWire> for SshKey {
    fn from(w: NamedWire) -> Self {
        Self {
            id: w.id,
            name: w.name,
            labels: w.labels,
        }
    }
}

#[derive(Deserialize)]
struct NetworkWire {
    id: ResourceId,
    name: String,
    ip_range: String,
    #[serde(default)]
    labels: Labels,
}

impl From<NetworkWire> for Network {
    fn from(w: NetworkWire) -> Self {
        Self {
            id: w.id,
            name: w.name,
            ip_range: w.ip_range,
            labels: w.labels,
        }
    }
}

#[derive(Default, Deserialize)]
struct PublicNetWire {
    #[serde(default)]
    ipv4: Option<IpWire>,
}

#[derive(Deserialize)]
struct IpWire {
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Deserialize)]
struct PrivateNetWire {
    #[serde(default)]
    ip: Option<String>,
}

fn public_ipv4(net: PublicNetWire) -> Option<String> {
    net.ipv4
        .and_then(|v4| v4.ip)
        .filter(|ip| !ip.is_empty() && ip != "0.0.0.0")
}

fn private_ips(nets: Vec<PrivateNetWire>) -> Vec<String> {
    nets.into_iter()
        .filter_map(|n| n.ip)
        .filter(|ip| !ip.is_empty() && ip != "0.0.0.0")
        .collect()
}

#[derive(Deserialize)]
struct LoadBalancerWire {
    id: ResourceId,
    name: String,
    #[serde(default)]
    public_net: PublicNetWire,
    #[serde(default)]
    private_net: Vec<PrivateNetWire>,
    #[serde(default)]
    labels: Labels,
}

impl From<LoadBalancerWire> for LoadBalancer {
    fn from(w: LoadBalancerWire) -> Self {
        Self {
            id: w.id,
            name: w.name,
            public_ipv4: public_ipv4(w.public_net),
            private_ips: private_ips(w.private_net),
            labels: w.labels,
        }
    }
}

#[derive(Deserialize)]
struct ServerWire {
    id: ResourceId,
    name: String,
    status: ServerStatus,
    #[serde(default)]
    public_net: PublicNetWire,
    #[serde(default)]
    private_net: Vec<PrivateNetWire>,
    #[serde(default)]
    labels: Labels,
    created: DateTime<Utc>,
}

impl From<ServerWire> for Server {
    fn from(w: ServerWire) -> Self {
        Self {
            id: w.id,
            name: w.name,
            status: w.status,
            public_ipv4: public_ipv4(w.public_net),
            private_ips: private_ips(w.private_net),
            labels: w.labels,
            created: w.created,
        }
    }
}

fn network_body(spec: &NetworkSpec) -> Value {
    json!({
        "name": spec.name,
        "ip_range": spec.ip_range,
        "subnets": spec.subnets,
        "labels": spec.labels,
    })
}

fn load_balancer_body(spec: &LoadBalancerSpec) -> Value {
    let mut body = json!({
        "name": spec.name,
        "load_balancer_type": spec.load_balancer_type,
        "location": spec.location,
        "services": spec.services,
        "labels": spec.labels,
    });
    if let Some(network) = spec.network {
        body["network"] = json!(network);
    }
    body
}

fn target_body(target: &LoadBalancerTarget) -> Value {
    match target {
        LoadBalancerTarget::LabelSelector {
            selector,
            use_private_ip,
        } => json!({
            "type": "label_selector",
            "label_selector": { "selector": selector },
            "use_private_ip": use_private_ip,
        }),
        LoadBalancerTarget::Server { id, use_private_ip } => json!({
            "type": "server",
            "server": { "id": id },
            "use_private_ip": use_private_ip,
        }),
        LoadBalancerTarget::Ip { ip } => json!({
            "type": "ip",
            "ip": { "ip": ip },
        }),
    }
}

fn firewall_body(spec: &FirewallSpec) -> Value {
    let apply_to: Vec<Value> = spec
        .apply_to
        .iter()
        .map(|selector| {
            json!({
                "type": "label_selector",
                "label_selector": { "selector": selector },
            })
        })
        .collect();
    json!({
        "name": spec.name,
        "rules": spec.rules,
        "apply_to": apply_to,
        "labels": spec.labels,
    })
}

fn server_body(spec: &ServerSpec) -> Value {
    let mut body = json!({
        "name": spec.name,
        "server_type": spec.server_type,
        "image": spec.image,
        "location": spec.location,
        "networks": spec.networks,
        "start_after_create": spec.start_after_create,
        "user_data": spec.user_data,
        "ssh_keys": spec.ssh_keys,
        "labels": spec.labels,
    });
    if let Some(group) = spec.placement_group {
        body["placement_group"] = json!(group);
    }
    body
}
