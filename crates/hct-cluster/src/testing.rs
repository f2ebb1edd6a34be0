//! In-memory collaborators for engine tests
//!
//! `FakeCloud` keeps every resource in memory and matches label selectors the
//! way the provider does. `FakeMembership` derives registered nodes from the
//! fake cloud: a server joins once it is finalized (has a role label) and
//! powered on.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use hct_common::labels::ROLE_LABEL;
use hct_common::{ClusterState, ClusterStore, Error, HcloudState, Result, DEFAULT_STATE_FILE};

use crate::cloud::{
    CloudClient, Firewall, FirewallSpec, Labels, LoadBalancer, LoadBalancerSpec,
    LoadBalancerTarget, Network, NetworkSpec, PlacementGroup, PlacementGroupSpec, ResourceId,
    Server, ServerSpec, ServerStatus, SshKey, SshKeySpec,
};
use crate::context::Context;
use crate::membership::{ClusterMembership, MemberNode};
use crate::remote::{RemoteExecutor, SshKeyPair};
use crate::talos::{GenConfigOptions, NodeBootstrapper};

pub fn sample_state() -> ClusterState {
    ClusterState {
        cluster_name: "demo".to_string(),
        hcloud: HcloudState {
            location: "nbg1".to_string(),
            network_zone: "eu-central".to_string(),
            token: "test-token".to_string(),
        },
        talos_version: None,
        kubernetes_version: None,
    }
}

/// Does `labels` satisfy a `k=v,k2,...` selector
pub fn matches_selector(labels: &Labels, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

#[derive(Default)]
struct FakeState {
    next_id: ResourceId,
    networks: Vec<Network>,
    placement_groups: Vec<PlacementGroup>,
    load_balancers: Vec<(LoadBalancer, u32)>,
    lb_targets: Vec<(ResourceId, LoadBalancerTarget)>,
    firewalls: Vec<Firewall>,
    servers: Vec<Server>,
    ssh_keys: Vec<SshKey>,
    calls: Vec<String>,
    failing: BTreeSet<String>,
    lb_settle_polls: u32,
    refuse_power_off: bool,
}

/// In-memory [`CloudClient`]
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_load_balancer_by_id` polls before addresses appear
    pub fn with_lb_settle_polls(self, polls: u32) -> Self {
        self.state.lock().unwrap().lb_settle_polls = polls;
        self
    }

    /// Make every call rendered as `call` (e.g. `"delete_firewall demo-nodes"`) fail
    pub fn fail_on(&self, call: &str) {
        self.state.lock().unwrap().failing.insert(call.to_string());
    }

    /// Keep servers running after shutdown requests
    pub fn refuse_power_off(&self) {
        self.state.lock().unwrap().refuse_power_off = true;
    }

    /// Every call made so far, as `"<method> <resource name>"`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls whose method matches `method`
    pub fn calls_to(&self, method: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(method))
            .collect()
    }

    pub fn servers(&self) -> Vec<Server> {
        self.state.lock().unwrap().servers.clone()
    }

    pub fn ssh_keys(&self) -> Vec<SshKey> {
        self.state.lock().unwrap().ssh_keys.clone()
    }

    pub fn networks(&self) -> Vec<Network> {
        self.state.lock().unwrap().networks.clone()
    }

    pub fn load_balancer_targets(&self) -> Vec<(ResourceId, LoadBalancerTarget)> {
        self.state.lock().unwrap().lb_targets.clone()
    }

    /// Insert an already finalized worker, as left behind by an earlier run
    pub fn seed_worker(&self, cluster: &str, node: &str, pool: &str, created_offset: i64) -> Server {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        let server = Server {
            id,
            name: format!("{cluster}-{node}"),
            status: ServerStatus::Running,
            public_ipv4: Some(format!("1.2.3.{id}")),
            private_ips: vec![format!("10.0.0.{id}")],
            labels: hct_common::labels::node_labels(
                cluster,
                hct_common::labels::NodeRole::Worker,
                Some(pool),
            ),
            created: epoch(created_offset),
        };
        state.servers.push(server.clone());
        server
    }

    fn record(&self, call: String) -> Result<std::sync::MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock().unwrap();
        let failing = state.failing.contains(&call);
        state.calls.push(call.clone());
        if failing {
            return Err(Error::cloud_status(503, format!("injected failure: {call}")));
        }
        Ok(state)
    }
}

fn epoch(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap()
}

fn name_of<T>(items: &[T], id: ResourceId, get: impl Fn(&T) -> (ResourceId, &str)) -> String {
    items
        .iter()
        .map(&get)
        .find(|(item_id, _)| *item_id == id)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("#{id}"))
}

#[async_trait]
impl CloudClient for FakeCloud {
    async fn get_network(&self, name: &str) -> Result<Option<Network>> {
        let state = self.record(format!("get_network {name}"))?;
        Ok(state.networks.iter().find(|n| n.name == name).cloned())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<Network> {
        let mut state = self.record(format!("create_network {}", spec.name))?;
        state.next_id += 1;
        let network = Network {
            id: state.next_id,
            name: spec.name.clone(),
            ip_range: spec.ip_range.clone(),
            labels: spec.labels.clone(),
        };
        state.networks.push(network.clone());
        Ok(network)
    }

    async fn list_networks(&self, selector: &str) -> Result<Vec<Network>> {
        let state = self.record(format!("list_networks {selector}"))?;
        Ok(state
            .networks
            .iter()
            .filter(|n| matches_selector(&n.labels, selector))
            .cloned()
            .collect())
    }

    async fn delete_network(&self, id: ResourceId) -> Result<()> {
        let name = name_of(&self.networks(), id, |n| (n.id, &n.name));
        let mut state = self.record(format!("delete_network {name}"))?;
        state.networks.retain(|n| n.id != id);
        Ok(())
    }

    async fn get_placement_group(&self, name: &str) -> Result<Option<PlacementGroup>> {
        let state = self.record(format!("get_placement_group {name}"))?;
        Ok(state.placement_groups.iter().find(|p| p.name == name).cloned())
    }

    async fn create_placement_group(&self, spec: &PlacementGroupSpec) -> Result<PlacementGroup> {
        let mut state = self.record(format!("create_placement_group {}", spec.name))?;
        state.next_id += 1;
        let group = PlacementGroup {
            id: state.next_id,
            name: spec.name.clone(),
            labels: spec.labels.clone(),
        };
        state.placement_groups.push(group.clone());
        Ok(group)
    }

    async fn list_placement_groups(&self, selector: &str) -> Result<Vec<PlacementGroup>> {
        let state = self.record(format!("list_placement_groups {selector}"))?;
        Ok(state
            .placement_groups
            .iter()
            .filter(|p| matches_selector(&p.labels, selector))
            .cloned()
            .collect())
    }

    async fn delete_placement_group(&self, id: ResourceId) -> Result<()> {
        let groups = self.state.lock().unwrap().placement_groups.clone();
        let name = name_of(&groups, id, |p| (p.id, &p.name));
        let mut state = self.record(format!("delete_placement_group {name}"))?;
        state.placement_groups.retain(|p| p.id != id);
        Ok(())
    }

    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>> {
        let state = self.record(format!("get_load_balancer {name}"))?;
        Ok(state
            .load_balancers
            .iter()
            .find(|(lb, _)| lb.name == name)
            .map(|(lb, _)| lb.clone()))
    }

    async fn get_load_balancer_by_id(&self, id: ResourceId) -> Result<LoadBalancer> {
        let mut state = self.record(format!("get_load_balancer_by_id {id}"))?;
        let settle_after = state.lb_settle_polls;
        let (lb, polls) = state
            .load_balancers
            .iter_mut()
            .find(|(lb, _)| lb.id == id)
            .ok_or_else(|| Error::not_found("load balancer", id.to_string()))?;
        *polls += 1;
        if *polls >= settle_after {
            lb.public_ipv4 = Some(format!("5.6.7.{id}"));
            lb.private_ips = vec![format!("10.0.0.{}", 200 + id)];
        }
        Ok(lb.clone())
    }

    async fn create_load_balancer(&self, spec: &LoadBalancerSpec) -> Result<LoadBalancer> {
        let mut state = self.record(format!("create_load_balancer {}", spec.name))?;
        state.next_id += 1;
        let lb = LoadBalancer {
            id: state.next_id,
            name: spec.name.clone(),
            public_ipv4: None,
            private_ips: Vec::new(),
            labels: spec.labels.clone(),
        };
        state.load_balancers.push((lb.clone(), 0));
        Ok(lb)
    }

    async fn add_load_balancer_target(
        &self,
        id: ResourceId,
        target: &LoadBalancerTarget,
    ) -> Result<()> {
        let mut state = self.record(format!("add_load_balancer_target {id}"))?;
        state.lb_targets.push((id, target.clone()));
        Ok(())
    }

    async fn list_load_balancers(&self, selector: &str) -> Result<Vec<LoadBalancer>> {
        let state = self.record(format!("list_load_balancers {selector}"))?;
        Ok(state
            .load_balancers
            .iter()
            .filter(|(lb, _)| matches_selector(&lb.labels, selector))
            .map(|(lb, _)| lb.clone())
            .collect())
    }

    async fn delete_load_balancer(&self, id: ResourceId) -> Result<()> {
        let lbs: Vec<LoadBalancer> = self
            .state
            .lock()
            .unwrap()
            .load_balancers
            .iter()
            .map(|(lb, _)| lb.clone())
            .collect();
        let name = name_of(&lbs, id, |lb| (lb.id, &lb.name));
        let mut state = self.record(format!("delete_load_balancer {name}"))?;
        state.load_balancers.retain(|(lb, _)| lb.id != id);
        Ok(())
    }

    async fn get_firewall(&self, name: &str) -> Result<Option<Firewall>> {
        let state = self.record(format!("get_firewall {name}"))?;
        Ok(state.firewalls.iter().find(|f| f.name == name).cloned())
    }

    async fn create_firewall(&self, spec: &FirewallSpec) -> Result<Firewall> {
        let mut state = self.record(format!("create_firewall {}", spec.name))?;
        state.next_id += 1;
        let firewall = Firewall {
            id: state.next_id,
            name: spec.name.clone(),
            labels: spec.labels.clone(),
        };
        state.firewalls.push(firewall.clone());
        Ok(firewall)
    }

    async fn list_firewalls(&self, selector: &str) -> Result<Vec<Firewall>> {
        let state = self.record(format!("list_firewalls {selector}"))?;
        Ok(state
            .firewalls
            .iter()
            .filter(|f| matches_selector(&f.labels, selector))
            .cloned()
            .collect())
    }

    async fn delete_firewall(&self, id: ResourceId) -> Result<()> {
        let firewalls = self.state.lock().unwrap().firewalls.clone();
        let name = name_of(&firewalls, id, |f| (f.id, &f.name));
        let mut state = self.record(format!("delete_firewall {name}"))?;
        state.firewalls.retain(|f| f.id != id);
        Ok(())
    }

    async fn get_server(&self, name: &str) -> Result<Option<Server>> {
        let state = self.record(format!("get_server {name}"))?;
        Ok(state.servers.iter().find(|s| s.name == name).cloned())
    }

    async fn get_server_by_id(&self, id: ResourceId) -> Result<Server> {
        let state = self.record(format!("get_server_by_id {id}"))?;
        state
            .servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("server", id.to_string()))
    }

    async fn create_server(&self, spec: &ServerSpec) -> Result<Server> {
        let mut state = self.record(format!("create_server {}", spec.name))?;
        state.next_id += 1;
        let id = state.next_id;
        let server = Server {
            id,
            name: spec.name.clone(),
            status: if spec.start_after_create {
                ServerStatus::Running
            } else {
                ServerStatus::Off
            },
            public_ipv4: Some(format!("1.2.3.{id}")),
            private_ips: spec
                .networks
                .iter()
                .map(|_| format!("10.0.0.{id}"))
                .collect(),
            labels: spec.labels.clone(),
            created: epoch(id as i64),
        };
        state.servers.push(server.clone());
        Ok(server)
    }

    async fn update_server_labels(&self, id: ResourceId, labels: &Labels) -> Result<Server> {
        let name = name_of(&self.servers(), id, |s| (s.id, &s.name));
        let mut state = self.record(format!("update_server_labels {name}"))?;
        let server = state
            .servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::not_found("server", id.to_string()))?;
        server.labels = labels.clone();
        Ok(server.clone())
    }

    async fn list_servers(&self, selector: &str) -> Result<Vec<Server>> {
        let state = self.record(format!("list_servers {selector}"))?;
        Ok(state
            .servers
            .iter()
            .filter(|s| matches_selector(&s.labels, selector))
            .cloned()
            .collect())
    }

    async fn delete_server(&self, id: ResourceId) -> Result<()> {
        let name = name_of(&self.servers(), id, |s| (s.id, &s.name));
        let mut state = self.record(format!("delete_server {name}"))?;
        state.servers.retain(|s| s.id != id);
        Ok(())
    }

    async fn power_on(&self, id: ResourceId) -> Result<()> {
        let name = name_of(&self.servers(), id, |s| (s.id, &s.name));
        let mut state = self.record(format!("power_on {name}"))?;
        if let Some(server) = state.servers.iter_mut().find(|s| s.id == id) {
            server.status = ServerStatus::Running;
        }
        Ok(())
    }

    async fn shutdown(&self, id: ResourceId) -> Result<()> {
        let name = name_of(&self.servers(), id, |s| (s.id, &s.name));
        let mut state = self.record(format!("shutdown {name}"))?;
        let refuse = state.refuse_power_off;
        if let Some(server) = state.servers.iter_mut().find(|s| s.id == id) {
            if !refuse {
                server.status = ServerStatus::Off;
            }
        }
        Ok(())
    }

    async fn enable_rescue(&self, id: ResourceId, _ssh_keys: &[ResourceId]) -> Result<()> {
        let name = name_of(&self.servers(), id, |s| (s.id, &s.name));
        self.record(format!("enable_rescue {name}"))?;
        Ok(())
    }

    async fn create_ssh_key(&self, spec: &SshKeySpec) -> Result<SshKey> {
        let mut state = self.record(format!("create_ssh_key {}", spec.name))?;
        state.next_id += 1;
        let key = SshKey {
            id: state.next_id,
            name: spec.name.clone(),
            labels: spec.labels.clone(),
        };
        state.ssh_keys.push(key.clone());
        Ok(key)
    }

    async fn list_ssh_keys(&self, selector: &str) -> Result<Vec<SshKey>> {
        let state = self.record(format!("list_ssh_keys {selector}"))?;
        Ok(state
            .ssh_keys
            .iter()
            .filter(|k| matches_selector(&k.labels, selector))
            .cloned()
            .collect())
    }

    async fn delete_ssh_key(&self, id: ResourceId) -> Result<()> {
        let name = name_of(&self.ssh_keys(), id, |k| (k.id, &k.name));
        let mut state = self.record(format!("delete_ssh_key {name}"))?;
        state.ssh_keys.retain(|k| k.id != id);
        Ok(())
    }
}

/// Kubernetes view derived from the fake cloud
pub struct FakeMembership {
    cloud: Arc<FakeCloud>,
    deleted: Mutex<Vec<String>>,
    applied: Mutex<Vec<String>>,
    patched: Mutex<Vec<String>>,
    fail_patches: AtomicBool,
}

impl FakeMembership {
    pub fn new(cloud: Arc<FakeCloud>) -> Self {
        Self {
            cloud,
            deleted: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            patched: Mutex::new(Vec::new()),
            fail_patches: AtomicBool::new(false),
        }
    }

    /// Make every workload patch fail as if the object did not exist
    pub fn fail_patches(&self) {
        self.fail_patches.store(true, Ordering::SeqCst);
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn patched(&self) -> Vec<String> {
        self.patched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterMembership for FakeMembership {
    async fn list_nodes(&self) -> Result<Vec<MemberNode>> {
        let deleted = self.deleted();
        Ok(self
            .cloud
            .servers()
            .into_iter()
            .filter(|s| s.status == ServerStatus::Running && s.labels.contains_key(ROLE_LABEL))
            .filter(|s| !deleted.contains(&s.name))
            .map(|s| MemberNode {
                name: s.name,
                ready: true,
                kubelet_version: Some("v1.30.4".to_string()),
            })
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<MemberNode>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.name == name))
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        self.applied.lock().unwrap().push(manifest.to_string());
        Ok(())
    }

    async fn patch_daemonset(
        &self,
        namespace: &str,
        name: &str,
        _patch: &json_patch::Patch,
    ) -> Result<()> {
        if self.fail_patches.load(Ordering::SeqCst) {
            return Err(Error::not_found("daemonset", format!("{namespace}/{name}")));
        }
        self.patched
            .lock()
            .unwrap()
            .push(format!("{namespace}/{name}"));
        Ok(())
    }
}

/// Records every talosctl invocation
///
/// `gen_config` writes placeholder machine configs into the working directory
/// like the real tool does.
#[derive(Default)]
pub struct FakeBootstrapper {
    calls: Mutex<Vec<String>>,
    dir: Option<PathBuf>,
}

impl FakeBootstrapper {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            dir: Some(dir.to_path_buf()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<String> {
        self.calls.lock().unwrap().push(call);
        Ok(String::new())
    }
}

#[async_trait]
impl NodeBootstrapper for FakeBootstrapper {
    async fn gen_config(
        &self,
        cluster_name: &str,
        endpoint_ip: &str,
        options: &GenConfigOptions,
    ) -> Result<String> {
        if let Some(dir) = &self.dir {
            std::fs::write(dir.join("controlplane.yaml"), "controlplane-config")?;
            std::fs::write(dir.join("worker.yaml"), "worker-config")?;
        }
        self.record(format!(
            "gen_config {cluster_name} {endpoint_ip} kubespan={}",
            options.kubespan
        ))
    }

    async fn bootstrap(&self, node_ip: &str) -> Result<String> {
        self.record(format!("bootstrap {node_ip}"))
    }

    async fn fetch_kubeconfig(&self, node_ip: &str) -> Result<String> {
        self.record(format!("kubeconfig {node_ip}"))
    }

    async fn reset(&self, node_ip: &str) -> Result<String> {
        self.record(format!("reset {node_ip}"))
    }
}

/// Records every remote command
#[derive(Default)]
pub struct FakeRemote {
    commands: Mutex<Vec<(String, String)>>,
}

impl FakeRemote {
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn execute(
        &self,
        host: &str,
        _port: u16,
        _key: &SshKeyPair,
        command: &str,
    ) -> Result<String> {
        self.commands
            .lock()
            .unwrap()
            .push((host.to_string(), command.to_string()));
        Ok(String::new())
    }
}

/// Context over in-memory collaborators and a scratch working directory
pub struct TestHarness {
    pub ctx: Context,
    pub cloud: Arc<FakeCloud>,
    pub membership: Arc<FakeMembership>,
    pub bootstrapper: Arc<FakeBootstrapper>,
    pub remote: Arc<FakeRemote>,
    _dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_cloud(FakeCloud::new())
    }

    pub fn with_cloud(cloud: FakeCloud) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("controlplane.yaml"), "controlplane-config").unwrap();
        std::fs::write(dir.path().join("worker.yaml"), "worker-config").unwrap();
        let store = ClusterStore::new(dir.path(), DEFAULT_STATE_FILE);
        store.save(&sample_state()).unwrap();

        let cloud = Arc::new(cloud);
        let membership = Arc::new(FakeMembership::new(cloud.clone()));
        let bootstrapper = Arc::new(FakeBootstrapper::in_dir(dir.path()));
        let remote = Arc::new(FakeRemote::default());
        let ctx = Context::for_testing(
            store,
            sample_state(),
            cloud.clone(),
            membership.clone(),
            bootstrapper.clone(),
            remote.clone(),
        );
        Self {
            ctx,
            cloud,
            membership,
            bootstrapper,
            remote,
            _dir: dir,
        }
    }
}

/// Context over a mocked cloud with inert remaining collaborators
pub fn mock_cloud_context(cloud: crate::cloud::MockCloudClient) -> (TempDir, Context) {
    let dir = tempfile::tempdir().unwrap();
    let store = ClusterStore::new(dir.path(), DEFAULT_STATE_FILE);
    let ctx = Context::for_testing(
        store,
        sample_state(),
        Arc::new(cloud),
        Arc::new(crate::membership::MockClusterMembership::new()),
        Arc::new(crate::talos::MockNodeBootstrapper::new()),
        Arc::new(crate::remote::MockRemoteExecutor::new()),
    );
    (dir, ctx)
}

#[test]
fn selector_matching_supports_presence_terms() {
    let labels: Labels = [
        ("hct.airfocus.io/cluster".to_string(), "demo".to_string()),
        ("hct.airfocus.io/role".to_string(), "worker".to_string()),
    ]
    .into_iter()
    .collect();
    assert!(matches_selector(&labels, "hct.airfocus.io/cluster=demo"));
    assert!(matches_selector(
        &labels,
        "hct.airfocus.io/cluster=demo,hct.airfocus.io/role"
    ));
    assert!(!matches_selector(
        &labels,
        "hct.airfocus.io/cluster=demo,hct.airfocus.io/pool=default"
    ));
    assert!(!matches_selector(&labels, "hct.airfocus.io/cluster=other"));
}
