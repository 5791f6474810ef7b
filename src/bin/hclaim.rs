//! `hclaim` CLI — the external entrypoint around [`hclaim::reconciler::Reconciler`]
//! (spec §6 CLI surface).
//!
//! Grounded on the bare-metal provisioner's clap-derive `Cli`/`Commands`
//! shape, trimmed to the four subcommands spec §6 names and given an
//! explicit exit-code contract instead of a bare `anyhow::Result<()>`,
//! since this binary has a scripted caller that distinguishes user error
//! from a provisioning failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use hclaim::cloud::hetzner::HetznerClient;
use hclaim::metadata::InMemoryMetadataStore;
use hclaim::reconciler::Reconciler;
use hclaim::snapshot_builder::ShellSnapshotBuilder;
use hclaim::spec::ClusterSpec;
use hclaim::talos::{ShellTalosClient, TalosClient};
use hclaim::RuntimeConfig;

#[derive(Parser)]
#[command(name = "hclaim")]
#[command(about = "Idempotent provisioning and reconciliation for a Talos cluster on Hetzner Cloud")]
struct Cli {
    /// Path to the `ClusterSpec` YAML file.
    #[arg(long, global = true)]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the cluster described by `--config` up, creating or reconciling
    /// whatever resources are missing.
    Up,

    /// Tear down every resource the cluster owns.
    Down,

    /// Report the count of resources still carrying the cluster's label.
    Status,

    /// Write the cluster's admin kubeconfig to a file.
    Kubeconfig {
        /// Control-plane node IP to request the kubeconfig from.
        #[arg(long)]
        node_ip: String,

        /// Output path for the kubeconfig.
        #[arg(long, default_value = "kubeconfig")]
        out: PathBuf,
    },
}

/// Exit codes per spec §6: 0 success, 1 user error (bad config), 2
/// provisioning error, 3 cancellation.
enum ExitStatus {
    Success,
    UserError,
    ProvisioningError,
    Cancelled,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => Self::from(0),
            ExitStatus::UserError => Self::from(1),
            ExitStatus::ProvisioningError => Self::from(2),
            ExitStatus::Cancelled => Self::from(3),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let spec = match ClusterSpec::load(&cli.config) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitStatus::UserError.into();
        }
    };

    let token = match std::env::var("HCLOUD_TOKEN") {
        Ok(token) => token,
        Err(_) => {
            eprintln!("error: HCLOUD_TOKEN must be set");
            return ExitStatus::UserError.into();
        }
    };
    let cloud = match HetznerClient::new(token) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("error: {e}");
            return ExitStatus::UserError.into();
        }
    };
    let talos_output_dir = std::env::var("HCLOUD_TALOS_OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join(format!("hclaim-{}", spec.cluster_name)));
    let install_disk = std::env::var("HCLOUD_INSTALL_DISK").unwrap_or_else(|_| "/dev/sda".to_string());
    let talos = Arc::new(ShellTalosClient::new(talos_output_dir, install_disk));
    let snapshot_builder_binary =
        std::env::var("HCLOUD_SNAPSHOT_BUILDER").unwrap_or_else(|_| "hclaim-snapshot-builder".to_string());
    let snapshot_builder = Arc::new(ShellSnapshotBuilder::new(snapshot_builder_binary));
    let metadata = Arc::new(InMemoryMetadataStore::default());
    let config = RuntimeConfig::from_env();
    let reconciler = Reconciler::new(cloud.clone(), talos.clone(), snapshot_builder, metadata, config);

    match cli.command {
        Commands::Up => run(reconciler.up(&spec).await),
        Commands::Down => run(reconciler.down(&spec).await),
        Commands::Status => {
            let labels = hclaim::naming::cluster_labels(&spec.cluster_name);
            match hclaim::cleanup::remaining_resources(cloud.as_ref(), &labels).await {
                Ok(summary) => {
                    println!("{summary}");
                    ExitStatus::Success.into()
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitStatus::ProvisioningError.into()
                }
            }
        }
        Commands::Kubeconfig { node_ip, out } => {
            match talos.kubeconfig(&node_ip).await {
                Ok(bytes) => match std::fs::write(&out, bytes) {
                    Ok(()) => {
                        println!("kubeconfig written to {}", out.display());
                        ExitStatus::Success.into()
                    }
                    Err(e) => {
                        eprintln!("error: failed to write {}: {e}", out.display());
                        ExitStatus::ProvisioningError.into()
                    }
                },
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitStatus::ProvisioningError.into()
                }
            }
        }
    }
}

fn run(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitStatus::Success.into(),
        Err(e) => {
            error!(error = %e, "operation failed");
            eprintln!("error: {e}");
            // `retry::RetryError::Cancelled` is generic over the operation's
            // error type and gets type-erased on the way into `anyhow::Error`
            // here, so cancellation is recognized by its fixed Display text
            // rather than a downcast (the same string-matching approach
            // `talos::ShellTalosClient::bootstrap` uses for talosctl stderr).
            if e.chain().any(|cause| cause.to_string().contains("operation cancelled")) {
                ExitStatus::Cancelled.into()
            } else {
                ExitStatus::ProvisioningError.into()
            }
        }
    }
}
