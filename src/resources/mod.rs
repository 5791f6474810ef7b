//! Per-kind resource adapters built on the generic `Ensure`/`Delete`
//! primitives (C4) in [`ensure`].
//!
//! Each submodule owns one cloud resource kind and wires up a
//! [`ensure::EnsureOp`] / [`ensure::DeleteOp`] from the [`crate::cloud`]
//! capability trait plus the [`crate::spec::ClusterSpec`] fields that
//! determine its desired state. Business logic for that kind (CIDR
//! validation, firewall rule diffing, server dependency resolution) lives
//! next to its adapter, not in `ensure`.

pub mod certificate;
pub mod ensure;
pub mod firewall;
pub mod load_balancer;
pub mod network;
pub mod placement_group;
pub mod server;
pub mod snapshot;
pub mod ssh_key;

pub use ensure::{delete_once, delete_with_retry, ensure, DeleteOp, EnsureOp};
