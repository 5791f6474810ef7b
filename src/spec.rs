//! Declarative cluster specification (spec §3).
//!
//! Loaded once per run and never mutated by the core; `Ensure` is a pure
//! function of `(desired spec, current cloud state)`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Role a node pool plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolRole {
    ControlPlane,
    Worker,
}

/// One homogeneous group of servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub role: PoolRole,
    pub replicas: u32,
    pub server_type: String,
    pub location: String,
    /// Strategy for placement-group sharding when `replicas` exceeds the
    /// cloud's per-group limit. `None` disables anti-affinity placement.
    pub placement_group_strategy: Option<PlacementStrategy>,
    /// Opaque to the core; threaded through to the Talos config generator.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<String>,
    #[serde(default = "default_true")]
    pub public_ipv4: bool,
    #[serde(default)]
    pub public_ipv6: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementStrategy {
    /// One placement group for the whole pool.
    Single,
    /// Shard into multiple placement groups once `replicas` exceeds the
    /// cloud's per-group server limit.
    Sharded,
}

impl NodePool {
    #[must_use]
    pub fn is_control_plane(&self) -> bool {
        self.role == PoolRole::ControlPlane
    }
}

/// Private network topology (spec §3 Network descriptor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub cidr: String,
    pub zone: String,
    pub subnet_cidr: String,
}

/// Kube-apiserver firewall allow-list (spec §3 Firewall descriptor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallSpec {
    pub api_allow_cidrs: Vec<String>,
    #[serde(default)]
    pub ssh_allow_cidrs: Vec<String>,
}

/// Timeout and retry settings (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSpec {
    #[serde(with = "humantime_duration", default = "default_server_create")]
    pub server_create: Duration,
    #[serde(with = "humantime_duration", default = "default_delete")]
    pub delete: Duration,
    #[serde(with = "humantime_duration", default = "default_image_wait")]
    pub image_wait: Duration,
    #[serde(with = "humantime_duration", default = "default_server_ip")]
    pub server_ip: Duration,
}

fn default_server_create() -> Duration {
    Duration::from_secs(600)
}
fn default_delete() -> Duration {
    Duration::from_secs(300)
}
fn default_image_wait() -> Duration {
    Duration::from_secs(900)
}
fn default_server_ip() -> Duration {
    Duration::from_secs(300)
}

impl Default for TimeoutSpec {
    fn default() -> Self {
        Self {
            server_create: default_server_create(),
            delete: default_delete(),
            image_wait: default_image_wait(),
            server_ip: default_server_ip(),
        }
    }
}

mod humantime_duration {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}

/// The full declarative specification for one cluster (spec §3 ClusterSpec).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// DNS-label-safe cluster name; also the sole basis for the cluster
    /// ownership label.
    pub cluster_name: String,
    pub talos_version: String,
    pub kubernetes_version: String,
    pub node_pools: Vec<NodePool>,
    pub network: NetworkSpec,
    pub firewall: FirewallSpec,
    #[serde(default)]
    pub timeouts: TimeoutSpec,
}

/// Error returned by [`ClusterSpec::validate`].
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("exactly one node pool must have role=control-plane, found {0}")]
    WrongControlPlaneCount(usize),
    #[error("control-plane pool '{0}' must have an odd replica count >= 1, found {1}")]
    EvenControlPlaneReplicas(String, u32),
    #[error("cluster name '{0}' is not DNS-label-safe")]
    InvalidClusterName(String),
}

impl ClusterSpec {
    /// Validate the invariants spec §3 states for `NodePool`.
    ///
    /// # Errors
    /// Returns [`SpecError`] if the control-plane pool cardinality or
    /// replica parity invariant is violated, or the cluster name is not
    /// DNS-label-safe.
    pub fn validate(&self) -> Result<(), SpecError> {
        if !is_dns_label_safe(&self.cluster_name) {
            return Err(SpecError::InvalidClusterName(self.cluster_name.clone()));
        }

        let control_planes: Vec<&NodePool> = self
            .node_pools
            .iter()
            .filter(|p| p.is_control_plane())
            .collect();

        if control_planes.len() != 1 {
            return Err(SpecError::WrongControlPlaneCount(control_planes.len()));
        }

        let cp = control_planes[0];
        if cp.replicas == 0 || cp.replicas % 2 == 0 {
            return Err(SpecError::EvenControlPlaneReplicas(
                cp.name.clone(),
                cp.replicas,
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn control_plane_pool(&self) -> Option<&NodePool> {
        self.node_pools.iter().find(|p| p.is_control_plane())
    }

    #[must_use]
    pub fn worker_pools(&self) -> Vec<&NodePool> {
        self.node_pools.iter().filter(|p| !p.is_control_plane()).collect()
    }

    /// Load a `ClusterSpec` from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or does not parse as a
    /// `ClusterSpec`.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read cluster spec {}: {e}", path.display()))?;
        let spec: Self = serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse cluster spec {}: {e}", path.display()))?;
        spec.validate()?;
        Ok(spec)
    }
}

fn is_dns_label_safe(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// The abstract entity a resource adapter represents (spec §3 Resource).
#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub id: i64,
    pub labels: BTreeMap<String, String>,
}

impl Resource {
    #[must_use]
    pub fn carries_cluster_label(&self, cluster: &str) -> bool {
        self.labels
            .get(crate::naming::CLUSTER_LABEL_KEY)
            .is_some_and(|v| v == cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(role: PoolRole, replicas: u32, name: &str) -> NodePool {
        NodePool {
            name: name.to_string(),
            role,
            replicas,
            server_type: "cx22".into(),
            location: "fsn1".into(),
            placement_group_strategy: Some(PlacementStrategy::Single),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            public_ipv4: true,
            public_ipv6: false,
        }
    }

    fn base_spec() -> ClusterSpec {
        ClusterSpec {
            cluster_name: "test-cluster".into(),
            talos_version: "v1.9.0".into(),
            kubernetes_version: "v1.31.0".into(),
            node_pools: vec![
                pool(PoolRole::ControlPlane, 3, "cp"),
                pool(PoolRole::Worker, 2, "workers"),
            ],
            network: NetworkSpec {
                cidr: "10.0.0.0/8".into(),
                zone: "eu-central".into(),
                subnet_cidr: "10.0.0.0/24".into(),
            },
            firewall: FirewallSpec {
                api_allow_cidrs: vec!["1.2.3.4/32".into()],
                ssh_allow_cidrs: vec![],
            },
            timeouts: TimeoutSpec::default(),
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(base_spec().validate().is_ok());
    }

    #[test]
    fn rejects_even_control_plane_replicas() {
        let mut spec = base_spec();
        spec.node_pools[0].replicas = 2;
        assert!(matches!(
            spec.validate(),
            Err(SpecError::EvenControlPlaneReplicas(_, 2))
        ));
    }

    #[test]
    fn rejects_zero_control_plane_pools() {
        let mut spec = base_spec();
        spec.node_pools.retain(|p| !p.is_control_plane());
        assert!(matches!(
            spec.validate(),
            Err(SpecError::WrongControlPlaneCount(0))
        ));
    }

    #[test]
    fn rejects_two_control_plane_pools() {
        let mut spec = base_spec();
        spec.node_pools.push(pool(PoolRole::ControlPlane, 1, "cp2"));
        assert!(matches!(
            spec.validate(),
            Err(SpecError::WrongControlPlaneCount(2))
        ));
    }

    #[test]
    fn rejects_non_dns_safe_cluster_name() {
        let mut spec = base_spec();
        spec.cluster_name = "Test_Cluster".into();
        assert!(matches!(
            spec.validate(),
            Err(SpecError::InvalidClusterName(_))
        ));
    }
}
