//! Talos node bootstrap via `talosctl`
//!
//! Every command runs inside the cluster working directory so that generated
//! machine configs, `talosconfig` and `kubeconfig` land next to the state file.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use hct_common::{Error, Result, KUBERNETES_API_PORT};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
const TALOSCONFIG_FILE: &str = "talosconfig";

/// Inputs for `talosctl gen config`
#[derive(Clone, Debug, PartialEq)]
pub struct GenConfigOptions {
    /// Kubernetes version to pin, talosctl's default when absent
    pub kubernetes_version: Option<String>,
    /// Enable KubeSpan node-to-node encryption
    pub kubespan: bool,
    /// Private network range kubelets must pick their node IP from
    pub node_subnet: String,
}

/// Trait abstracting the node OS bootstrap tooling
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeBootstrapper: Send + Sync {
    /// Generate machine configs and talosconfig for a cluster whose API is
    /// reachable at `endpoint_ip`
    async fn gen_config(
        &self,
        cluster_name: &str,
        endpoint_ip: &str,
        options: &GenConfigOptions,
    ) -> Result<String>;

    /// Bootstrap etcd on the first control-plane node
    async fn bootstrap(&self, node_ip: &str) -> Result<String>;

    /// Write the cluster kubeconfig into the working directory
    async fn fetch_kubeconfig(&self, node_ip: &str) -> Result<String>;

    /// Wipe a node's state and leave the cluster
    async fn reset(&self, node_ip: &str) -> Result<String>;
}

/// [`NodeBootstrapper`] backed by the `talosctl` binary
#[derive(Clone, Debug)]
pub struct Talosctl {
    binary: String,
    dir: PathBuf,
}

impl Talosctl {
    /// Run `talosctl` from `PATH` in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: "talosctl".to_string(),
            dir: dir.into(),
        }
    }

    /// Use a specific `talosctl` binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let description = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %description, "Running talosctl");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args).current_dir(&self.dir).kill_on_drop(true);
        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                warn!(command = %description, "Command timed out after {:?}", COMMAND_TIMEOUT);
                Error::command(&description, format!("timed out after {:?}", COMMAND_TIMEOUT))
            })?
            .map_err(|e| Error::command(&description, format!("failed to execute: {e}")))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(combined)
        } else {
            Err(Error::command(
                description,
                format!("{}\n{}", output.status, combined.trim_end()),
            ))
        }
    }

    async fn run_with_talosconfig(&self, node_ip: &str, args: &[&str]) -> Result<String> {
        let mut full = vec![
            "--talosconfig".to_string(),
            TALOSCONFIG_FILE.to_string(),
            "-n".to_string(),
            node_ip.to_string(),
        ];
        full.extend(args.iter().map(|a| a.to_string()));
        self.run(&full).await
    }
}

/// Strategic merge patch applied to every generated machine config
pub fn config_patch(options: &GenConfigOptions) -> serde_json::Value {
    json!({
        "machine": {
            "kubelet": {
                "nodeIP": { "validSubnets": [options.node_subnet] }
            },
            "network": {
                "kubespan": { "enabled": options.kubespan }
            }
        },
        "cluster": {
            "externalCloudProvider": { "enabled": true }
        }
    })
}

fn gen_config_args(cluster_name: &str, endpoint_ip: &str, options: &GenConfigOptions) -> Vec<String> {
    let mut args = vec![
        "gen".to_string(),
        "config".to_string(),
        cluster_name.to_string(),
        format!("https://{endpoint_ip}:{KUBERNETES_API_PORT}"),
        "--additional-sans".to_string(),
        endpoint_ip.to_string(),
        "--config-patch".to_string(),
        config_patch(options).to_string(),
    ];
    if let Some(version) = &options.kubernetes_version {
        args.push("--kubernetes-version".to_string());
        args.push(version.clone());
    }
    args
}

#[async_trait]
impl NodeBootstrapper for Talosctl {
    async fn gen_config(
        &self,
        cluster_name: &str,
        endpoint_ip: &str,
        options: &GenConfigOptions,
    ) -> Result<String> {
        info!(cluster = %cluster_name, endpoint = %endpoint_ip, "Generating Talos configuration");
        let mut output = self
            .run(&gen_config_args(cluster_name, endpoint_ip, options))
            .await?;
        output.push_str(
            &self
                .run(&[
                    "--talosconfig".to_string(),
                    TALOSCONFIG_FILE.to_string(),
                    "config".to_string(),
                    "endpoint".to_string(),
                    endpoint_ip.to_string(),
                ])
                .await?,
        );
        Ok(output)
    }

    async fn bootstrap(&self, node_ip: &str) -> Result<String> {
        self.run_with_talosconfig(node_ip, &["bootstrap"]).await
    }

    async fn fetch_kubeconfig(&self, node_ip: &str) -> Result<String> {
        self.run_with_talosconfig(node_ip, &["kubeconfig", "."]).await
    }

    async fn reset(&self, node_ip: &str) -> Result<String> {
        self.run_with_talosconfig(node_ip, &["reset"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> GenConfigOptions {
        GenConfigOptions {
            kubernetes_version: Some("1.30.4".to_string()),
            kubespan: true,
            node_subnet: "10.0.0.0/16".to_string(),
        }
    }

    #[test]
    fn patch_restricts_kubelet_to_private_network() {
        let patch = config_patch(&options());
        assert_eq!(
            patch["machine"]["kubelet"]["nodeIP"]["validSubnets"][0],
            "10.0.0.0/16"
        );
        assert_eq!(patch["cluster"]["externalCloudProvider"]["enabled"], true);
        assert_eq!(patch["machine"]["network"]["kubespan"]["enabled"], true);
    }

    #[test]
    fn kubespan_can_be_disabled() {
        let patch = config_patch(&GenConfigOptions {
            kubespan: false,
            ..options()
        });
        assert_eq!(patch["machine"]["network"]["kubespan"]["enabled"], false);
    }

    #[test]
    fn gen_config_targets_load_balancer_endpoint() {
        let args = gen_config_args("demo", "5.6.7.8", &options());
        assert_eq!(&args[0..4], &["gen", "config", "demo", "https://5.6.7.8:6443"]);
        assert!(args.windows(2).any(|w| w == ["--additional-sans", "5.6.7.8"]));
        assert!(args.windows(2).any(|w| w == ["--kubernetes-version", "1.30.4"]));
    }

    #[test]
    fn gen_config_without_pinned_kubernetes_version() {
        let args = gen_config_args(
            "demo",
            "5.6.7.8",
            &GenConfigOptions {
                kubernetes_version: None,
                ..options()
            },
        );
        assert!(!args.iter().any(|a| a == "--kubernetes-version"));
    }

    #[tokio::test]
    async fn failing_command_reports_its_output() {
        let dir = tempfile::tempdir().unwrap();
        let talos = Talosctl::new(dir.path()).with_binary("sh");
        let err = talos
            .run(&["-c".to_string(), "echo boom >&2; exit 3".to_string()])
            .await
            .unwrap_err();
        match err {
            Error::Command { command, message } => {
                assert!(command.starts_with("sh -c"));
                assert!(message.contains("boom"));
            }
            other => panic!("expected command error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let talos = Talosctl::new(dir.path()).with_binary("definitely-not-talosctl");
        let err = talos.bootstrap("10.0.0.2").await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }
}
