//! Dependency-ordered bulk cleanup by label (C7).
//!
//! Grounded on the generic `Delete` primitive in [`crate::resources::ensure`]
//! plus the bare-metal provisioner's sequential teardown in
//! `inventory.rs`'s removal ordering, generalized to Hetzner Cloud's
//! dependency graph: servers must go before the network and firewall they
//! sit in, and firewall deletion needs its resource associations removed
//! first since Hetzner refuses to delete an attached firewall.
//!
//! Every step is independently retried (C1) so cleanup resumes cleanly
//! after a partial failure; one class failing does not abort the rest —
//! all nine steps run and their errors are aggregated into one
//! [`CleanupError`].

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cloud::CloudClient;
use crate::error::CleanupError;
use crate::naming;
use crate::resources::ensure::DeleteOp;
use crate::retry::RetryConfig;

/// Poll interval for the server-deletion convergence loop (spec §4.2 step 1,
/// scenario S4: "poll every 5s up to 5 minutes until no labelled servers
/// remain").
const SERVER_DELETE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Total budget for the server-deletion convergence poll.
const SERVER_DELETE_POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Fixed-interval retry policy for per-resource locked-retry steps that
/// spec §4.2 pins to "30 attempts, 5s apart" (volumes, firewalls): the
/// generic exponential backoff in [`crate::retry`] degenerates to a fixed
/// interval when `initial_delay == max_delay`.
fn locked_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 30,
        initial_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(5),
        jitter: false,
    }
}

/// Deterministically-named resources that cleanup cannot discover through
/// a label-based list call, since Hetzner Cloud offers no list-by-label
/// endpoint for these kinds. The reconciler builds this from the
/// `ClusterSpec` it is tearing down.
#[derive(Debug, Clone, Default)]
pub struct CleanupTargets {
    pub cluster_name: String,
    pub placement_group_names: Vec<String>,
    pub certificate_names: Vec<String>,
}

/// Delay between removing a firewall's resource associations and retrying
/// its delete, giving Hetzner time to observe the detachment (spec §4.2
/// Firewall step).
const FIREWALL_DETACH_SETTLE: Duration = Duration::from_secs(5);

/// Tear down every resource carrying `labels`, plus `targets`' singleton
/// resources, in dependency order. Refuses an empty label map outright
/// (spec §8 boundary behaviour: an empty selector matches the whole
/// project).
///
/// # Errors
/// Returns [`CleanupError`] aggregating every resource class that failed;
/// `Ok(())` means every class either had nothing to remove or succeeded.
pub async fn cleanup_by_label(
    client: &dyn CloudClient,
    labels: &BTreeMap<String, String>,
    targets: &CleanupTargets,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<(), CleanupError> {
    let selector = naming::build_label_selector(labels);
    assert!(
        !selector.is_empty(),
        "cleanup_by_label must never run with an empty label selector"
    );

    let mut failures: Vec<(String, anyhow::Error)> = Vec::new();

    if let Err(e) = delete_servers(client, &selector, cancel).await {
        failures.push(("servers".to_string(), e));
    }
    if let Err(e) = delete_volumes(client, &selector, cancel).await {
        failures.push(("volumes".to_string(), e));
    }
    if let Err(e) = delete_load_balancers(client, &selector, config, cancel).await {
        failures.push(("load_balancers".to_string(), e));
    }
    if let Err(e) = delete_foreign_load_balancers(client, config, cancel).await {
        failures.push(("foreign_load_balancers".to_string(), e));
    }
    if let Err(e) = delete_firewall(client, &targets.cluster_name, config, cancel).await {
        failures.push(("firewalls".to_string(), e));
    }
    if let Err(e) = delete_network(client, &targets.cluster_name, config, cancel).await {
        failures.push(("networks".to_string(), e));
    }
    for name in &targets.placement_group_names {
        if let Err(e) = delete_placement_group(client, name, config, cancel).await {
            failures.push((format!("placement_group:{name}"), e));
        }
    }
    if let Err(e) = delete_ssh_key(client, &targets.cluster_name, config, cancel).await {
        failures.push(("ssh_keys".to_string(), e));
    }
    for name in &targets.certificate_names {
        if let Err(e) = delete_certificate(client, name, config, cancel).await {
            failures.push((format!("certificate:{name}"), e));
        }
    }

    CleanupError::new(failures).map_or(Ok(()), Err)
}

/// Delete every labelled server, then poll until none remain. Servers are
/// *not* retried per-server (spec §4.2 step 1, scenario S4): a server stuck
/// mid-action fails its own delete call immediately, and the poll loop below
/// is the sole convergence mechanism, re-observing the cloud's state every
/// [`SERVER_DELETE_POLL_INTERVAL`] until the label selector returns nothing
/// or [`SERVER_DELETE_POLL_TIMEOUT`] is spent.
async fn delete_servers(client: &dyn CloudClient, selector: &str, cancel: &CancellationToken) -> anyhow::Result<()> {
    let servers = client.list_servers_by_label(selector).await?;
    for server in &servers {
        let action = client.delete_server(server.id).await?;
        crate::action::await_action(action.as_ref()).await?;
        if cancel.is_cancelled() {
            anyhow::bail!("cleanup cancelled while deleting servers");
        }
    }

    let deadline = tokio::time::Instant::now() + SERVER_DELETE_POLL_TIMEOUT;
    loop {
        if client.list_servers_by_label(selector).await?.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            anyhow::bail!("cleanup cancelled while polling for server deletion");
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for labelled servers to disappear");
        }
        tokio::time::sleep(SERVER_DELETE_POLL_INTERVAL).await;
    }
}

/// Per-volume 30×5s locked-retry delete (spec §4.2 step 2), since a volume
/// still attached to a just-deleted server can stay locked briefly.
async fn delete_volumes(client: &dyn CloudClient, selector: &str, cancel: &CancellationToken) -> anyhow::Result<()> {
    let config = locked_retry_config();
    let volumes = client.list_volumes_by_label(selector).await?;
    for volume in &volumes {
        let op: DeleteOp<'_, ()> = DeleteOp {
            name: volume.name.clone(),
            get: Box::new(|| Box::pin(async { Ok(Some(())) })),
            delete: {
                let id = volume.id;
                Box::new(move |_: &()| Box::pin(async move { client.delete_volume(id).await }))
            },
        };
        crate::resources::ensure::delete_with_retry(&op, &config, cancel)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(())
}

/// Deletes the cluster's own load balancer(s), discovered by the
/// `cluster=<name>` label this core applies to everything it creates.
async fn delete_load_balancers(
    client: &dyn CloudClient,
    selector: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let lbs = client.list_load_balancers_by_label(selector).await?;
    for lb in &lbs {
        let op: DeleteOp<'_, ()> = DeleteOp {
            name: lb.name.clone(),
            get: Box::new(|| Box::pin(async { Ok(Some(())) })),
            delete: {
                let id = lb.id;
                Box::new(move |_: &()| Box::pin(async move { client.delete_load_balancer(id).await }))
            },
        };
        crate::resources::ensure::delete_with_retry(&op, config, cancel)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(())
}

/// Sweeps for load balancers the Kubernetes Cloud Controller Manager
/// created on the cluster's behalf (spec §4.2 step 4). The CCM labels these
/// with its own service-uid label rather than [`naming::CLUSTER_LABEL_KEY`],
/// so they're invisible to `delete_load_balancers`' cluster-label selector;
/// this lists every load balancer in the project (empty selector) and
/// filters locally for the CCM's label key.
async fn delete_foreign_load_balancers(
    client: &dyn CloudClient,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let all_lbs = client.list_load_balancers_by_label("").await?;
    for lb in all_lbs.iter().filter(|lb| lb.labels.contains_key(naming::CCM_SERVICE_UID_LABEL_KEY)) {
        let op: DeleteOp<'_, ()> = DeleteOp {
            name: lb.name.clone(),
            get: Box::new(|| Box::pin(async { Ok(Some(())) })),
            delete: {
                let id = lb.id;
                Box::new(move |_: &()| Box::pin(async move { client.delete_load_balancer(id).await }))
            },
        };
        crate::resources::ensure::delete_with_retry(&op, config, cancel)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(())
}

async fn delete_firewall(
    client: &dyn CloudClient,
    cluster_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let name = naming::firewall(cluster_name);
    let Some(firewall) = client.get_firewall_by_name(&name).await? else {
        return Ok(());
    };

    if firewall.applied_to_label_selector.is_some() {
        let actions = client.remove_firewall_resources(firewall.id).await?;
        for action in &actions {
            crate::action::await_action(action.as_ref()).await?;
        }
        tokio::time::sleep(FIREWALL_DETACH_SETTLE).await;
    }

    let id = firewall.id;
    let op: DeleteOp<'_, ()> = DeleteOp {
        name,
        get: Box::new(|| Box::pin(async { Ok(Some(())) })),
        delete: Box::new(move |_: &()| Box::pin(async move { client.delete_firewall(id).await })),
    };
    crate::resources::ensure::delete_with_retry(&op, config, cancel)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

async fn delete_network(
    client: &dyn CloudClient,
    cluster_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let name = naming::network(cluster_name);
    let Some(network) = client.get_network_by_name(&name).await? else {
        return Ok(());
    };
    let id = network.id;
    let op: DeleteOp<'_, ()> = DeleteOp {
        name,
        get: Box::new(|| Box::pin(async { Ok(Some(())) })),
        delete: Box::new(move |_: &()| Box::pin(async move { client.delete_network(id).await })),
    };
    crate::resources::ensure::delete_with_retry(&op, config, cancel)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

async fn delete_placement_group(
    client: &dyn CloudClient,
    name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let Some(pg) = client.get_placement_group_by_name(name).await? else {
        return Ok(());
    };
    let id = pg.id;
    let op: DeleteOp<'_, ()> = DeleteOp {
        name: name.to_string(),
        get: Box::new(|| Box::pin(async { Ok(Some(())) })),
        delete: Box::new(move |_: &()| Box::pin(async move { client.delete_placement_group(id).await })),
    };
    crate::resources::ensure::delete_with_retry(&op, config, cancel)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

async fn delete_ssh_key(
    client: &dyn CloudClient,
    cluster_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let name = naming::ssh_key(cluster_name);
    let Some(key) = client.get_ssh_key_by_name(&name).await? else {
        return Ok(());
    };
    let id = key.id;
    let op: DeleteOp<'_, ()> = DeleteOp {
        name,
        get: Box::new(|| Box::pin(async { Ok(Some(())) })),
        delete: Box::new(move |_: &()| Box::pin(async move { client.delete_ssh_key(id).await })),
    };
    crate::resources::ensure::delete_with_retry(&op, config, cancel)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

async fn delete_certificate(
    client: &dyn CloudClient,
    name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let Some(cert) = client.get_certificate_by_name(name).await? else {
        return Ok(());
    };
    let id = cert.id;
    let op: DeleteOp<'_, ()> = DeleteOp {
        name: name.to_string(),
        get: Box::new(|| Box::pin(async { Ok(Some(())) })),
        delete: Box::new(move |_: &()| Box::pin(async move { client.delete_certificate(id).await })),
    };
    crate::resources::ensure::delete_with_retry(&op, config, cancel)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Count remaining resources for `labels`, formatted per spec §8
/// (`"[1 servers 2 volumes 3 SSH keys]"`, or `"no resources"` when empty).
///
/// # Errors
/// Propagates the underlying `ProviderError` from any list call.
pub async fn remaining_resources(
    client: &dyn CloudClient,
    labels: &BTreeMap<String, String>,
) -> Result<String, crate::error::ProviderError> {
    let selector = naming::build_label_selector(labels);
    let servers = client.list_servers_by_label(&selector).await?.len();
    let volumes = client.list_volumes_by_label(&selector).await?.len();
    let load_balancers = client.list_load_balancers_by_label(&selector).await?.len();

    let mut parts = Vec::new();
    if servers > 0 {
        parts.push(format!("{servers} servers"));
    }
    if volumes > 0 {
        parts.push(format!("{volumes} volumes"));
    }
    if load_balancers > 0 {
        parts.push(format!("{load_balancers} load balancers"));
    }

    Ok(if parts.is_empty() {
        "no resources".to_string()
    } else {
        format!("[{}]", parts.join(" "))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudClient;
    use crate::cloud::{Firewall, LoadBalancer, Server, Volume};
    use std::collections::BTreeMap;

    #[tokio::test]
    #[should_panic(expected = "empty label selector")]
    async fn refuses_empty_label_selector() {
        let client = MockCloudClient::new();
        let cancel = CancellationToken::new();
        let _ = cleanup_by_label(
            &client,
            &BTreeMap::new(),
            &CleanupTargets::default(),
            &RetryConfig::default(),
            &cancel,
        )
        .await;
    }

    #[tokio::test]
    async fn deletes_servers_matching_label_and_leaves_others() {
        let client = MockCloudClient::new();
        client
            .seed_server(Server {
                id: 1,
                name: "prod-cp-0".into(),
                ipv4: None,
                ipv6_network: None,
                labels: naming::cluster_labels("prod"),
            })
            .await;
        client
            .seed_server(Server {
                id: 2,
                name: "other-cp-0".into(),
                ipv4: None,
                ipv6_network: None,
                labels: naming::cluster_labels("other"),
            })
            .await;

        let cancel = CancellationToken::new();
        let targets = CleanupTargets {
            cluster_name: "prod".to_string(),
            ..Default::default()
        };
        cleanup_by_label(
            &client,
            &naming::cluster_labels("prod"),
            &targets,
            &RetryConfig::default(),
            &cancel,
        )
        .await
        .unwrap();

        let remaining = client.list_servers_by_label("cluster=prod").await.unwrap();
        assert!(remaining.is_empty());
        let untouched = client.list_servers_by_label("cluster=other").await.unwrap();
        assert_eq!(untouched.len(), 1);
    }

    #[tokio::test]
    async fn in_use_firewall_is_detached_before_delete() {
        let client = MockCloudClient::new();
        client
            .seed_firewall(Firewall {
                id: 1,
                name: naming::firewall("prod"),
                rules: Vec::new(),
                applied_to_label_selector: Some("cluster=prod".to_string()),
                labels: naming::cluster_labels("prod"),
            })
            .await;

        let cancel = CancellationToken::new();
        let targets = CleanupTargets {
            cluster_name: "prod".to_string(),
            ..Default::default()
        };
        cleanup_by_label(
            &client,
            &naming::cluster_labels("prod"),
            &targets,
            &RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
            },
            &cancel,
        )
        .await
        .unwrap();

        assert!(client.get_firewall_by_name(&naming::firewall("prod")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deletes_volumes_matching_label_and_leaves_others() {
        let client = MockCloudClient::new();
        client
            .seed_volume(Volume {
                id: 1,
                name: "prod-data".into(),
                labels: naming::cluster_labels("prod"),
            })
            .await;
        client
            .seed_volume(Volume {
                id: 2,
                name: "other-data".into(),
                labels: naming::cluster_labels("other"),
            })
            .await;

        let cancel = CancellationToken::new();
        let targets = CleanupTargets {
            cluster_name: "prod".to_string(),
            ..Default::default()
        };
        cleanup_by_label(
            &client,
            &naming::cluster_labels("prod"),
            &targets,
            &RetryConfig::default(),
            &cancel,
        )
        .await
        .unwrap();

        assert!(client.list_volumes_by_label("cluster=prod").await.unwrap().is_empty());
        assert_eq!(client.list_volumes_by_label("cluster=other").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ccm_foreign_load_balancer_is_swept_despite_missing_cluster_label() {
        let client = MockCloudClient::new();
        let mut ccm_labels = BTreeMap::new();
        ccm_labels.insert(naming::CCM_SERVICE_UID_LABEL_KEY.to_string(), "abc-123".to_string());
        client
            .seed_load_balancer(LoadBalancer {
                id: 9,
                name: "k8s-svc-lb".into(),
                public_ip: None,
                attached_network_id: None,
                service_ports: Vec::new(),
                target_label_selectors: Vec::new(),
                labels: ccm_labels,
            })
            .await;

        let cancel = CancellationToken::new();
        let targets = CleanupTargets {
            cluster_name: "prod".to_string(),
            ..Default::default()
        };
        cleanup_by_label(
            &client,
            &naming::cluster_labels("prod"),
            &targets,
            &RetryConfig::default(),
            &cancel,
        )
        .await
        .unwrap();

        assert!(client.list_load_balancers_by_label("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remaining_resources_formats_per_spec() {
        let client = MockCloudClient::new();
        assert_eq!(
            remaining_resources(&client, &naming::cluster_labels("prod")).await.unwrap(),
            "no resources"
        );

        client
            .seed_server(Server {
                id: 1,
                name: "prod-cp-0".into(),
                ipv4: None,
                ipv6_network: None,
                labels: naming::cluster_labels("prod"),
            })
            .await;
        assert_eq!(
            remaining_resources(&client, &naming::cluster_labels("prod")).await.unwrap(),
            "[1 servers]"
        );
    }
}
