//! The snapshot-builder collaborator (spec §4.3 Up, step 4), consumed only
//! by the reconciler (C8) — never by C1–C7.
//!
//! Cutting a Talos boot snapshot means booting a disposable server into
//! rescue mode, writing the Talos disk image to it, and imaging the result;
//! none of that disk-provisioning plumbing belongs in the Cloud Resource
//! Layer (spec §1 non-goals), so the core blocks on this external
//! collaborator for a source server id the same way it blocks on the Talos
//! collaborator for config generation. Grounded on `talos::ShellTalosClient`'s
//! shell-out-and-parse-output pattern.

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum SnapshotBuilderError {
    #[error("snapshot source server provisioning failed: {0}")]
    Build(String),
}

/// Produces a live, Talos-imaged server suitable as the `server_id` argument
/// to [`crate::resources::snapshot::ensure_snapshot`]'s underlying
/// `CreateSnapshot` call. The core only invokes this when the named
/// snapshot is absent; once cut, the snapshot is discovered by label and
/// this collaborator is not consulted again.
#[async_trait]
pub trait SnapshotBuilder: Send + Sync {
    /// # Errors
    /// Returns [`SnapshotBuilderError::Build`] if no source server could be
    /// produced for `cluster_name`/`talos_version`.
    async fn provision_source_server(
        &self,
        cluster_name: &str,
        talos_version: &str,
    ) -> Result<i64, SnapshotBuilderError>;
}

/// [`SnapshotBuilder`] that shells out to an external image-builder binary,
/// one process per call, and parses the decimal server id it prints to
/// stdout on success.
pub struct ShellSnapshotBuilder {
    /// Path to (or name of) the external binary that boots a rescue server,
    /// writes the Talos disk image, and prints the resulting server's id.
    binary: String,
}

impl ShellSnapshotBuilder {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

#[async_trait]
impl SnapshotBuilder for ShellSnapshotBuilder {
    async fn provision_source_server(
        &self,
        cluster_name: &str,
        talos_version: &str,
    ) -> Result<i64, SnapshotBuilderError> {
        let output = Command::new(&self.binary)
            .args(["--cluster", cluster_name, "--talos-version", talos_version])
            .output()
            .await
            .map_err(|e| SnapshotBuilderError::Build(format!("spawning {}: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(SnapshotBuilderError::Build(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|e| SnapshotBuilderError::Build(format!("parsing source server id: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSnapshotBuilder(i64);

    #[async_trait]
    impl SnapshotBuilder for FixedSnapshotBuilder {
        async fn provision_source_server(
            &self,
            _cluster_name: &str,
            _talos_version: &str,
        ) -> Result<i64, SnapshotBuilderError> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn fixed_builder_returns_configured_id() {
        let builder = FixedSnapshotBuilder(42);
        let id = builder.provision_source_server("prod", "v1.9.0").await.unwrap();
        assert_eq!(id, 42);
    }
}
