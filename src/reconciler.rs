//! Cluster Reconciler (C8): the `Up`/`Down` lifecycle state machine.
//!
//! Grounded on the bare-metal provisioner's `ProvisionStep` sequence in
//! `state.rs`, generalized from its fixed two-node (control-plane + worker)
//! flow to the full dependency graph of spec §3/§4.3: network → SSH key →
//! firewall → snapshot → placement groups → load balancer → control-plane
//! servers → apiserver reachability → bootstrap → worker servers → load
//! balancer service/target. Every step is an `Ensure`; re-running after
//! partial progress resumes without recreating extant resources, since
//! state is observed from the cloud rather than checkpointed locally.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cleanup::{cleanup_by_label, CleanupTargets};
use crate::cloud::{CloudClient, Server};
use crate::config::RuntimeConfig;
use crate::metadata::{save_metadata, MetadataStore, RunMetadata};
use crate::naming;
use crate::resources::{firewall, load_balancer, network, placement_group, server, snapshot, ssh_key};
use crate::retry::RetryConfig;
use crate::snapshot_builder::SnapshotBuilder;
use crate::spec::{ClusterSpec, NodePool};
use crate::talos::{TalosClient, TalosSecrets};

/// Hetzner Cloud's documented per-placement-group server limit. A pool
/// using `PlacementStrategy::Sharded` splits into `ceil(replicas / this)`
/// groups once it would otherwise exceed the limit (spec §4.3 Up, step 5).
const MAX_PLACEMENT_GROUP_SIZE: u32 = 10;

/// Default load balancer type, since `ClusterSpec` does not expose one
/// (spec §3 leaves load-balancer sizing unspecified). `lb11` is Hetzner's
/// smallest type and suffices for a single kube-apiserver target group.
const DEFAULT_LOAD_BALANCER_TYPE: &str = "lb11";

/// kube-apiserver's well-known port, used both as the LB's listen port and
/// the Talos/Kubernetes API endpoint port.
const KUBE_API_PORT: u16 = 6443;

/// How often to retry a TCP reachability probe against the apiserver load
/// balancer before its timeout budget is spent (spec §4.3 Up, step 8).
const TCP_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Drives a `ClusterSpec` through its `Up` and `Down` lifecycles.
///
/// Holds its collaborators behind `Arc` so server creation within a pool
/// can fan out across a bounded `JoinSet` (spec §5 Concurrency model)
/// without threading lifetimes through spawned tasks.
pub struct Reconciler {
    cloud: Arc<dyn CloudClient>,
    talos: Arc<dyn TalosClient>,
    snapshot_builder: Arc<dyn SnapshotBuilder>,
    metadata: Arc<dyn MetadataStore>,
    config: RuntimeConfig,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        talos: Arc<dyn TalosClient>,
        snapshot_builder: Arc<dyn SnapshotBuilder>,
        metadata: Arc<dyn MetadataStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            cloud,
            talos,
            snapshot_builder,
            metadata,
            config,
        }
    }

    /// Bring `spec`'s cluster to its desired topology, resuming from
    /// whatever partial state the cloud already holds.
    ///
    /// # Errors
    /// Aborts on the first `Ensure` failure; the partial state is left on
    /// the cloud (spec §4.3: "no automatic rollback").
    pub async fn up(&self, spec: &ClusterSpec) -> anyhow::Result<()> {
        spec.validate()?;
        let cancel = CancellationToken::new();
        let cluster = spec.cluster_name.as_str();

        info!(cluster, "ensuring network");
        let net = network::ensure_network(self.cloud.as_ref(), cluster, &spec.network).await?;

        info!(cluster, "ensuring ssh key");
        let key = ssh_key::ensure_ssh_key(self.cloud.as_ref(), cluster, &self.config.ssh_public_key).await?;

        info!(cluster, "ensuring firewall");
        firewall::ensure_firewall(self.cloud.as_ref(), cluster, &spec.firewall).await?;

        info!(cluster, "ensuring talos snapshot");
        let snapshot_name = naming::snapshot(cluster, &spec.talos_version);
        let source_server_id = match self.cloud.get_image_by_name(&snapshot_name).await? {
            Some(_) => 0,
            None => {
                info!(cluster, "snapshot absent, blocking on snapshot-builder collaborator");
                self.snapshot_builder
                    .provision_source_server(cluster, &spec.talos_version)
                    .await?
            }
        };
        snapshot::ensure_snapshot(self.cloud.as_ref(), cluster, &spec.talos_version, source_server_id).await?;

        info!(cluster, "ensuring placement groups");
        let placement_groups = self.ensure_placement_groups(cluster, &spec.node_pools).await?;

        info!(cluster, "ensuring load balancer");
        let lb = load_balancer::ensure_load_balancer(self.cloud.as_ref(), spec, DEFAULT_LOAD_BALANCER_TYPE).await?;
        let lb_private_ip = first_host_ip(&net.subnets.first().map_or_else(|| net.ip_range.clone(), |s| s.ip_range.clone()));
        load_balancer::ensure_network_attachment(self.cloud.as_ref(), &lb, net.id, &lb_private_ip).await?;

        let api_endpoint = format!("https://{lb_private_ip}:{KUBE_API_PORT}");

        let control_plane = spec
            .control_plane_pool()
            .ok_or_else(|| anyhow::anyhow!("cluster spec has no control-plane pool"))?;

        let existing_secrets = self.load_secrets(cluster).await?;
        let generated = self
            .talos
            .generate_config(spec, &api_endpoint, existing_secrets.as_ref())
            .await?;
        self.save_secrets(cluster, &generated.secrets).await?;

        info!(cluster, "ensuring control-plane servers");
        let mut first_cp: Option<Server> = None;
        for index in 0..control_plane.replicas {
            let user_data = if index == 0 {
                String::from_utf8_lossy(&generated.control_plane.yaml).into_owned()
            } else {
                String::from_utf8_lossy(&generated.join.yaml).into_owned()
            };
            let deps = self.server_dependencies(
                cluster,
                control_plane,
                &key,
                &placement_groups,
                Some(net.id),
                user_data,
            );
            let created = server::ensure_server(
                self.cloud.as_ref(),
                cluster,
                control_plane,
                index,
                deps,
                &self.config.retry,
                &cancel,
            )
            .await?;
            server::attach_and_start(self.cloud.as_ref(), &created, net.id, None).await?;
            if index == 0 {
                first_cp = Some(created);
            }
        }
        let first_cp = first_cp.ok_or_else(|| anyhow::anyhow!("control-plane pool has zero replicas"))?;

        info!(cluster, "waiting for apiserver load balancer to become reachable");
        wait_for_tcp(&lb_private_ip, KUBE_API_PORT, self.config.timeout_server_ip).await?;

        info!(cluster, "bootstrapping control plane");
        let bootstrap_ip = server::public_address(&first_cp)?;
        self.talos.bootstrap(&bootstrap_ip).await?;

        info!(cluster, "ensuring worker servers");
        for pool in spec.worker_pools() {
            self.ensure_pool_servers(
                cluster,
                pool,
                &key,
                &placement_groups,
                net.id,
                &generated.join.yaml,
                &self.config.retry,
                &cancel,
            )
            .await?;
        }

        info!(cluster, "configuring load balancer service and target");
        load_balancer::ensure_service(self.cloud.as_ref(), &lb, KUBE_API_PORT).await?;
        let cp_selector = naming::build_label_selector(&control_plane_selector(cluster, control_plane));
        load_balancer::ensure_target(self.cloud.as_ref(), &lb, &cp_selector).await?;

        save_metadata(self.metadata.as_ref(), &RunMetadata::new(cluster.to_string())).await?;
        info!(cluster, "up complete");
        Ok(())
    }

    /// Tear down every resource carrying the cluster's ownership label.
    ///
    /// # Errors
    /// Returns the aggregated [`crate::error::CleanupError`] if any resource
    /// class failed to delete.
    pub async fn down(&self, spec: &ClusterSpec) -> anyhow::Result<()> {
        let cluster = spec.cluster_name.as_str();
        let labels = naming::cluster_labels(cluster);
        let cancel = CancellationToken::new();

        let placement_group_names = placement_group_names(cluster, &spec.node_pools);
        let targets = CleanupTargets {
            cluster_name: cluster.to_string(),
            placement_group_names,
            certificate_names: Vec::new(),
        };

        info!(cluster, "tearing down cluster");
        cleanup_by_label(self.cloud.as_ref(), &labels, &targets, &self.config.retry, &cancel).await?;
        info!(cluster, "down complete");
        Ok(())
    }

    /// One placement group per pool that opts in, sharded per
    /// [`MAX_PLACEMENT_GROUP_SIZE`] for `PlacementStrategy::Sharded` pools.
    async fn ensure_placement_groups(
        &self,
        cluster: &str,
        pools: &[NodePool],
    ) -> anyhow::Result<BTreeMap<String, Vec<i64>>> {
        let mut by_pool: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for pool in pools {
            let Some(strategy) = pool.placement_group_strategy else {
                continue;
            };
            let shard_count = match strategy {
                crate::spec::PlacementStrategy::Single => 1,
                crate::spec::PlacementStrategy::Sharded => {
                    pool.replicas.div_ceil(MAX_PLACEMENT_GROUP_SIZE).max(1)
                }
            };
            let mut ids = Vec::with_capacity(shard_count as usize);
            for shard in 0..shard_count {
                let pg = placement_group::ensure_placement_group(self.cloud.as_ref(), cluster, &pool.name, shard)
                    .await?;
                ids.push(pg.id);
            }
            by_pool.insert(pool.name.clone(), ids);
        }
        Ok(by_pool)
    }

    /// Ensure every replica of a worker pool, fanning out across a bounded
    /// `JoinSet` (spec §5: "servers within the same pool may be created in
    /// parallel").
    #[allow(clippy::too_many_arguments)]
    async fn ensure_pool_servers(
        &self,
        cluster: &str,
        pool: &NodePool,
        key: &crate::cloud::SshKey,
        placement_groups: &BTreeMap<String, Vec<i64>>,
        network_id: i64,
        join_config: &[u8],
        retry_config: &RetryConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut set = JoinSet::new();
        for index in 0..pool.replicas {
            let cloud = Arc::clone(&self.cloud);
            let cluster = cluster.to_string();
            let pool = pool.clone();
            let key = key.clone();
            let placement_group_id = placement_group_for_index(placement_groups, &pool, index);
            let user_data = String::from_utf8_lossy(join_config).into_owned();
            let retry_config = retry_config.clone();
            let cancel = cancel.clone();
            let image_wait = self.config.timeout_image_wait;

            set.spawn(async move {
                let deps = server::ServerDependencies {
                    ssh_key_ids: vec![key.id],
                    placement_group_id,
                    network_id: Some(network_id),
                    private_ip: None,
                    user_data,
                    image_label_selector: naming::build_label_selector(&naming::cluster_labels(&cluster)),
                    image_wait,
                };
                let created =
                    server::ensure_server(cloud.as_ref(), &cluster, &pool, index, deps, &retry_config, &cancel)
                        .await?;
                server::attach_and_start(cloud.as_ref(), &created, network_id, None).await
            });
        }

        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(anyhow::anyhow!("{e}")),
                Err(join_err) => {
                    warn!(error = %join_err, "worker task panicked");
                    return Err(anyhow::anyhow!("worker server task panicked: {join_err}"));
                }
            }
        }
        Ok(())
    }

    fn server_dependencies(
        &self,
        cluster: &str,
        pool: &NodePool,
        key: &crate::cloud::SshKey,
        placement_groups: &BTreeMap<String, Vec<i64>>,
        network_id: Option<i64>,
        user_data: String,
    ) -> server::ServerDependencies {
        server::ServerDependencies {
            ssh_key_ids: vec![key.id],
            placement_group_id: placement_group_for_index(placement_groups, pool, 0),
            network_id,
            private_ip: None,
            user_data,
            image_label_selector: naming::build_label_selector(&naming::cluster_labels(cluster)),
            image_wait: self.config.timeout_image_wait,
        }
    }

    async fn load_secrets(&self, cluster: &str) -> anyhow::Result<Option<TalosSecrets>> {
        let key = format!("{cluster}_talos_secrets.json");
        match self.metadata.get(&key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_secrets(&self, cluster: &str, secrets: &TalosSecrets) -> anyhow::Result<()> {
        let key = format!("{cluster}_talos_secrets.json");
        let bytes = serde_json::to_vec(secrets)?;
        self.metadata.put(&key, &bytes).await?;
        Ok(())
    }
}

fn control_plane_selector(cluster: &str, pool: &NodePool) -> BTreeMap<String, String> {
    let mut selector = naming::cluster_labels(cluster);
    selector.insert(crate::resources::server::POOL_LABEL_KEY.to_string(), pool.name.clone());
    selector
}

fn placement_group_for_index(groups: &BTreeMap<String, Vec<i64>>, pool: &NodePool, index: u32) -> Option<i64> {
    let ids = groups.get(&pool.name)?;
    if ids.is_empty() {
        return None;
    }
    let shard = match pool.placement_group_strategy {
        Some(crate::spec::PlacementStrategy::Sharded) => (index / MAX_PLACEMENT_GROUP_SIZE) as usize,
        _ => 0,
    };
    ids.get(shard.min(ids.len() - 1)).copied()
}

fn placement_group_names(cluster: &str, pools: &[NodePool]) -> Vec<String> {
    let mut names = Vec::new();
    for pool in pools {
        let Some(strategy) = pool.placement_group_strategy else {
            continue;
        };
        let shard_count = match strategy {
            crate::spec::PlacementStrategy::Single => 1,
            crate::spec::PlacementStrategy::Sharded => pool.replicas.div_ceil(MAX_PLACEMENT_GROUP_SIZE).max(1),
        };
        for shard in 0..shard_count {
            names.push(naming::placement_group(cluster, &pool.name, shard));
        }
    }
    names
}

/// Deterministic private IP convention: the first host address of the
/// subnet (its gateway-reserved `.1`), used as the load balancer's
/// attachment address (spec leaves LB IPAM within the private network
/// unspecified; this follows Hetzner's own convention of reserving the
/// first host address per subnet).
fn first_host_ip(cidr: &str) -> String {
    let Some((base, _)) = cidr.split_once('/') else {
        return cidr.to_string();
    };
    let mut octets: Vec<&str> = base.split('.').collect();
    if octets.len() == 4 {
        octets[3] = "1";
        octets.join(".")
    } else {
        base.to_string()
    }
}

/// Poll `host:port` with a TCP connect until it succeeds or `timeout`
/// elapses (spec §4.3 Up, step 8).
///
/// # Errors
/// Returns an error once `timeout` is spent without a successful connect.
async fn wait_for_tcp(host: &str, port: u16, timeout: Duration) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::net::TcpStream::connect(&addr).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {addr} to become reachable");
        }
        tokio::time::sleep(TCP_PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_host_ip_replaces_last_octet() {
        assert_eq!(first_host_ip("10.0.0.0/24"), "10.0.0.1");
        assert_eq!(first_host_ip("192.168.5.0/24"), "192.168.5.1");
    }

    #[test]
    fn placement_group_for_index_distributes_sharded_pools() {
        let mut groups = BTreeMap::new();
        groups.insert("workers".to_string(), vec![100, 101]);
        let pool = NodePool {
            name: "workers".into(),
            role: crate::spec::PoolRole::Worker,
            replicas: 15,
            server_type: "cx22".into(),
            location: "fsn1".into(),
            placement_group_strategy: Some(crate::spec::PlacementStrategy::Sharded),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            public_ipv4: true,
            public_ipv6: false,
        };
        assert_eq!(placement_group_for_index(&groups, &pool, 0), Some(100));
        assert_eq!(placement_group_for_index(&groups, &pool, 10), Some(101));
    }

    #[test]
    fn placement_group_names_shards_by_replica_count() {
        let pool = NodePool {
            name: "workers".into(),
            role: crate::spec::PoolRole::Worker,
            replicas: 25,
            server_type: "cx22".into(),
            location: "fsn1".into(),
            placement_group_strategy: Some(crate::spec::PlacementStrategy::Sharded),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            public_ipv4: true,
            public_ipv6: false,
        };
        let names = placement_group_names("prod", std::slice::from_ref(&pool));
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], "prod-workers-pg");
        assert_eq!(names[2], "prod-workers-pg-2");
    }
}
