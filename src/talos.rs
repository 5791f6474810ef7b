//! The Talos collaborator (spec §6), consumed only by the reconciler (C8) —
//! never by C1–C7.
//!
//! Grounded on `talos-api-rs`'s `resources::{bootstrap, kubeconfig,
//! configuration}` modules for method naming, and on the bare-metal
//! provisioner's `talos::BootstrapConfig` for the config-patch fields
//! threaded through generation. The core depends only on this trait; no
//! gRPC wire code is reproduced here (out of scope, per spec §1).

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

use crate::spec::ClusterSpec;

/// Opaque Talos secret bundle (etcd CA, cluster CA, tokens). The core
/// persists this via `metadata::MetadataStore` but never inspects its
/// contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalosSecrets {
    pub bundle: Vec<u8>,
}

/// Per-node machine configuration, already rendered to YAML bytes.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub yaml: Vec<u8>,
}

/// The three artifacts `GenerateConfig` produces (spec §6).
pub struct GeneratedConfig {
    pub control_plane: MachineConfig,
    pub join: MachineConfig,
    pub secrets: TalosSecrets,
}

#[derive(Error, Debug)]
pub enum TalosError {
    #[error("config generation failed: {0}")]
    Generate(String),
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("kubeconfig retrieval failed: {0}")]
    Kubeconfig(String),
}

/// Capability the reconciler needs from the Talos side of the system.
/// Pure given the same secret bundle: `generate_config` is deterministic.
#[async_trait]
pub trait TalosClient: Send + Sync {
    /// Render the control-plane and join machine configs for `spec`,
    /// generating a fresh secret bundle if `existing_secrets` is `None`.
    ///
    /// # Errors
    /// Returns [`TalosError::Generate`] if templating fails.
    async fn generate_config(
        &self,
        spec: &ClusterSpec,
        api_endpoint: &str,
        existing_secrets: Option<&TalosSecrets>,
    ) -> Result<GeneratedConfig, TalosError>;

    /// Issued once against the first control-plane node's IP.
    ///
    /// # Errors
    /// Returns [`TalosError::Bootstrap`] if the node does not accept the
    /// bootstrap command.
    async fn bootstrap(&self, node_ip: &str) -> Result<(), TalosError>;

    /// Writes the admin kubeconfig bytes for the cluster reachable at
    /// `node_ip`.
    ///
    /// # Errors
    /// Returns [`TalosError::Kubeconfig`] if the node cannot produce one.
    async fn kubeconfig(&self, node_ip: &str) -> Result<Vec<u8>, TalosError>;
}

/// [`TalosClient`] implementation that shells out to the external `talosctl`
/// binary, one process per call.
///
/// Grounded on the bare-metal provisioner's `talos::bootstrap` module, which
/// drives every Talos lifecycle step (`gen secrets`, `gen config`,
/// `bootstrap`, `kubeconfig`) the same way: build a `std::process::Command`,
/// check `status.success()`, and fold stderr into the error. This mirrors
/// that exactly but on `tokio::process::Command` since the trait is async,
/// and keeps generated artifacts under `output_dir` between calls instead of
/// threading file paths through the trait's in-memory return types.
pub struct ShellTalosClient {
    /// Scratch directory `talosctl gen config` writes `controlplane.yaml`,
    /// `worker.yaml`, `secrets.yaml`, and `talosconfig` into. Reused across
    /// calls so `bootstrap`/`kubeconfig` can find the `talosconfig` a prior
    /// `generate_config` call produced.
    output_dir: PathBuf,
    /// `--install-disk` value passed to `talosctl gen config` (e.g.
    /// `/dev/sda`).
    install_disk: String,
}

impl ShellTalosClient {
    #[must_use]
    pub fn new(output_dir: PathBuf, install_disk: String) -> Self {
        Self {
            output_dir,
            install_disk,
        }
    }

    fn talosconfig_path(&self) -> PathBuf {
        self.output_dir.join("talosconfig")
    }

    fn secrets_path(&self) -> PathBuf {
        self.output_dir.join("secrets.yaml")
    }
}

#[async_trait]
impl TalosClient for ShellTalosClient {
    async fn generate_config(
        &self,
        spec: &ClusterSpec,
        api_endpoint: &str,
        existing_secrets: Option<&TalosSecrets>,
    ) -> Result<GeneratedConfig, TalosError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| TalosError::Generate(format!("creating output dir: {e}")))?;

        let secrets_path = self.secrets_path();
        if let Some(existing) = existing_secrets {
            tokio::fs::write(&secrets_path, &existing.bundle)
                .await
                .map_err(|e| TalosError::Generate(format!("writing existing secrets: {e}")))?;
        } else {
            let output = Command::new("talosctl")
                .args(["gen", "secrets", "-o"])
                .arg(&secrets_path)
                .output()
                .await
                .map_err(|e| TalosError::Generate(format!("spawning talosctl gen secrets: {e}")))?;
            if !output.status.success() {
                return Err(TalosError::Generate(format!(
                    "talosctl gen secrets: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
        }

        let output = Command::new("talosctl")
            .args(["gen", "config", &spec.cluster_name, api_endpoint, "--with-secrets"])
            .arg(&secrets_path)
            .arg("--output-dir")
            .arg(&self.output_dir)
            .args(["--install-disk", &self.install_disk])
            .args(["--kubernetes-version", &spec.kubernetes_version])
            .args(["--force"])
            .output()
            .await
            .map_err(|e| TalosError::Generate(format!("spawning talosctl gen config: {e}")))?;
        if !output.status.success() {
            return Err(TalosError::Generate(format!(
                "talosctl gen config: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let control_plane = tokio::fs::read(self.output_dir.join("controlplane.yaml"))
            .await
            .map_err(|e| TalosError::Generate(format!("reading controlplane.yaml: {e}")))?;
        let join = tokio::fs::read(self.output_dir.join("worker.yaml"))
            .await
            .map_err(|e| TalosError::Generate(format!("reading worker.yaml: {e}")))?;
        let bundle = tokio::fs::read(&secrets_path)
            .await
            .map_err(|e| TalosError::Generate(format!("reading secrets.yaml: {e}")))?;

        Ok(GeneratedConfig {
            control_plane: MachineConfig { yaml: control_plane },
            join: MachineConfig { yaml: join },
            secrets: TalosSecrets { bundle },
        })
    }

    async fn bootstrap(&self, node_ip: &str) -> Result<(), TalosError> {
        let output = Command::new("talosctl")
            .arg("--talosconfig")
            .arg(self.talosconfig_path())
            .args(["-e", node_ip, "-n", node_ip, "bootstrap"])
            .output()
            .await
            .map_err(|e| TalosError::Bootstrap(format!("spawning talosctl bootstrap: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already bootstrapped") || stderr.contains("etcd is already running") {
            warn!(node_ip, "cluster already bootstrapped, treating as success");
            return Ok(());
        }
        Err(TalosError::Bootstrap(stderr.into_owned()))
    }

    async fn kubeconfig(&self, node_ip: &str) -> Result<Vec<u8>, TalosError> {
        let out_path = self.output_dir.join("kubeconfig");
        let output = Command::new("talosctl")
            .arg("--talosconfig")
            .arg(self.talosconfig_path())
            .args(["-e", node_ip, "-n", node_ip, "kubeconfig"])
            .arg(&out_path)
            .output()
            .await
            .map_err(|e| TalosError::Kubeconfig(format!("spawning talosctl kubeconfig: {e}")))?;
        if !output.status.success() {
            return Err(TalosError::Kubeconfig(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        tokio::fs::read(&out_path)
            .await
            .map_err(|e| TalosError::Kubeconfig(format!("reading kubeconfig: {e}")))
    }
}
