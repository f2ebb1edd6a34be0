//! Explicit operation context
//!
//! Every engine operation receives a [`Context`] by reference: the loaded
//! cluster state, where it lives, the collaborator handles and the retry
//! profiles. Nothing is process-global.

use std::sync::Arc;

use hct_common::retry::RetryPolicy;
use hct_common::{ClusterState, ClusterStore, Result};

use crate::cloud::{CloudClient, HcloudClient};
use crate::membership::{ClusterMembership, KubeMembership};
use crate::remote::{RemoteExecutor, SshExecutor};
use crate::talos::{NodeBootstrapper, Talosctl};

/// Shared context for one engine invocation
pub struct Context {
    /// Cluster descriptor
    pub state: ClusterState,
    /// Working directory and state file location
    pub store: ClusterStore,
    /// Cloud provider API
    pub cloud: Arc<dyn CloudClient>,
    /// Kubernetes API of the provisioned cluster
    pub membership: Arc<dyn ClusterMembership>,
    /// Node OS bootstrap tooling
    pub bootstrapper: Arc<dyn NodeBootstrapper>,
    /// Remote shell for rescue-mode imaging
    pub remote: Arc<dyn RemoteExecutor>,
    /// Profile for calls expected to settle quickly
    pub fast: RetryPolicy,
    /// Profile for calls with long real-world settle times
    pub slow: RetryPolicy,
}

impl Context {
    /// Create a builder for a context over `state`
    pub fn builder(store: ClusterStore, state: ClusterState) -> ContextBuilder {
        ContextBuilder::new(store, state)
    }

    /// Load the state from `store` and wire the real collaborators
    pub fn load(store: ClusterStore) -> Result<Self> {
        let state = store.load()?;
        Self::builder(store, state).build()
    }

    /// Cluster name, the namespace of every derived resource name
    pub fn cluster_name(&self) -> &str {
        &self.state.cluster_name
    }

    /// Create a context for testing with custom collaborators
    ///
    /// Retry profiles shrink to milliseconds so exhausted waits finish fast.
    #[cfg(test)]
    pub fn for_testing(
        store: ClusterStore,
        state: ClusterState,
        cloud: Arc<dyn CloudClient>,
        membership: Arc<dyn ClusterMembership>,
        bootstrapper: Arc<dyn NodeBootstrapper>,
        remote: Arc<dyn RemoteExecutor>,
    ) -> Self {
        use std::time::Duration;

        Self {
            state,
            store,
            cloud,
            membership,
            bootstrapper,
            remote,
            fast: RetryPolicy::new(Duration::from_millis(40), Duration::from_millis(1)),
            slow: RetryPolicy::new(Duration::from_millis(80), Duration::from_millis(1)),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// Collaborators that are not overridden default to the real adapters:
/// ```text
/// let ctx = Context::builder(store, state).build()?;
/// ```
pub struct ContextBuilder {
    store: ClusterStore,
    state: ClusterState,
    cloud: Option<Arc<dyn CloudClient>>,
    membership: Option<Arc<dyn ClusterMembership>>,
    bootstrapper: Option<Arc<dyn NodeBootstrapper>>,
    remote: Option<Arc<dyn RemoteExecutor>>,
    fast: RetryPolicy,
    slow: RetryPolicy,
}

impl ContextBuilder {
    fn new(store: ClusterStore, state: ClusterState) -> Self {
        Self {
            store,
            state,
            cloud: None,
            membership: None,
            bootstrapper: None,
            remote: None,
            fast: RetryPolicy::FAST,
            slow: RetryPolicy::SLOW,
        }
    }

    /// Override the cloud client
    pub fn cloud(mut self, cloud: Arc<dyn CloudClient>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Override the Kubernetes membership client
    pub fn membership(mut self, membership: Arc<dyn ClusterMembership>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Override the node bootstrapper
    pub fn bootstrapper(mut self, bootstrapper: Arc<dyn NodeBootstrapper>) -> Self {
        self.bootstrapper = Some(bootstrapper);
        self
    }

    /// Override the remote executor
    pub fn remote(mut self, remote: Arc<dyn RemoteExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Override both retry profiles
    pub fn retry_profiles(mut self, fast: RetryPolicy, slow: RetryPolicy) -> Self {
        self.fast = fast;
        self.slow = slow;
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context> {
        let cloud: Arc<dyn CloudClient> = match self.cloud {
            Some(cloud) => cloud,
            None => Arc::new(HcloudClient::new(self.state.hcloud.token.clone())?),
        };
        let dir = self.store.dir().to_path_buf();
        Ok(Context {
            cloud,
            membership: self
                .membership
                .unwrap_or_else(|| Arc::new(KubeMembership::in_dir(&dir))),
            bootstrapper: self
                .bootstrapper
                .unwrap_or_else(|| Arc::new(Talosctl::new(&dir))),
            remote: self.remote.unwrap_or_else(|| Arc::new(SshExecutor::new())),
            fast: self.fast,
            slow: self.slow,
            state: self.state,
            store: self.store,
        })
    }
}
