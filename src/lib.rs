//! Idempotent provisioning and reconciliation engine for a Talos Linux
//! Kubernetes cluster on a single cloud.
//!
//! The crate is layered: [`cloud`] is the thin SDK-shaped capability trait,
//! [`resources`] builds the generic get-or-create/delete primitives (C4) and
//! the per-kind adapters (network, firewall, server, ...) on top of it,
//! [`cleanup`] performs dependency-ordered bulk teardown by label (C7), and
//! [`reconciler`] drives the cluster's Up/Down lifecycle (C8).
//!
//! # Example
//!
//! ```rust,ignore
//! use hclaim::spec::ClusterSpec;
//! use hclaim::reconciler::Reconciler;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let spec = ClusterSpec::load("cluster.yaml".as_ref())?;
//!     let reconciler = Reconciler::new(cloud, talos, snapshot_builder, metadata, config);
//!     reconciler.up(&spec).await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod cleanup;
pub mod cloud;
pub mod config;
pub mod error;
pub mod metadata;
pub mod naming;
pub mod reconciler;
pub mod resources;
pub mod retry;
pub mod snapshot_builder;
pub mod spec;
pub mod talos;

pub use cloud::CloudClient;
pub use config::RuntimeConfig;
pub use error::{EnsureError, ErrorClass, ProviderError};
pub use metadata::{MetadataStore, RunMetadata};
pub use reconciler::Reconciler;
pub use snapshot_builder::SnapshotBuilder;
pub use spec::ClusterSpec;
pub use talos::TalosClient;
