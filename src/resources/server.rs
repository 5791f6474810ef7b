//! Server provisioner (C6, spec §4.1.7): dependency resolution, creation,
//! and the ancillary lifecycle operations the reconciler needs (network
//! attach, rescue, reset, power, delete).
//!
//! Grounded on the bare-metal provisioner's server-creation pipeline
//! (`providers/hetzner/client.rs`'s `to_server` request-building and
//! `activate_rescue`), generalized to Hetzner Cloud's dependency graph:
//! resolving server type, boot image, SSH keys, and location before the
//! create call, since any one of those can be a fatal misconfiguration
//! rather than a transient failure.

use std::net::Ipv6Addr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::action::await_action;
use crate::cloud::{CloudClient, CreateServerOpts, PublicIpToggle, Server};
use crate::error::{classify, EnsureError, ProviderError};
use crate::naming;
use crate::retry::{retry, RetryConfig, RetryOutcome};
use crate::spec::NodePool;

use super::ensure::{ensure, EnsureOp};

/// How long to poll for a snapshot still in `Creating` state before giving
/// up (spec §4.1.7 edge case: image not yet `available`).
const IMAGE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Resolve the boot image for `server_type`'s architecture, polling while
/// the newest match is still being processed.
///
/// Only the label-selector branch of spec §4.1.7 step 2 is wired:
/// `ClusterSpec`/`NodePool` never carries an explicit image name (spec §3),
/// so the "look up by name directly" and "re-list by name + architecture on
/// mismatch" branches have no caller that could ever reach them.
///
/// # Errors
/// Returns [`ProviderError::NotFound`] if no image ever becomes available
/// within `image_wait`, or the underlying error from `list_images_by_label`.
async fn resolve_image(
    client: &dyn CloudClient,
    label_selector: &str,
    architecture: &str,
    image_wait: Duration,
) -> Result<i64, ProviderError> {
    let deadline = tokio::time::Instant::now() + image_wait;
    loop {
        let images = client.list_images_by_label(label_selector, architecture).await?;
        if let Some(image) = images
            .into_iter()
            .find(|i| i.status == crate::cloud::ImageStatus::Available)
        {
            return Ok(image.id);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ProviderError::Timeout(image_wait));
        }
        tokio::time::sleep(IMAGE_POLL_INTERVAL).await;
    }
}

/// Map a pool's boolean public-IP flags to the tri-state toggle the SDK
/// expects. Permissive by design: `true` leaves the cloud's own default in
/// place rather than forcing `On`, so an implementer who wants strict
/// enforcement can tighten this later (spec §4.1.7 Design Note "Option
/// structs with many boolean toggles").
fn public_ip_toggle(enabled: bool) -> PublicIpToggle {
    if enabled {
        PublicIpToggle::Default
    } else {
        PublicIpToggle::Off
    }
}

/// The pool-level label key a server carries alongside its cluster
/// ownership label, letting the reconciler target a load balancer at one
/// pool's servers (e.g. the control-plane pool) rather than every server
/// in the cluster.
pub const POOL_LABEL_KEY: &str = "pool";

/// Labels every server in `pool` carries: the cluster-ownership label, the
/// pool-membership label, and whatever the operator set on the pool itself.
/// Invariant labels are applied last so user-supplied `pool.labels` cannot
/// shadow them.
#[must_use]
pub fn server_labels(cluster_name: &str, pool: &NodePool) -> std::collections::BTreeMap<String, String> {
    let mut labels = pool.labels.clone();
    labels.extend(naming::cluster_labels(cluster_name));
    labels.insert(POOL_LABEL_KEY.to_string(), pool.name.clone());
    labels
}

/// Parameters threaded through to `CreateServerOpts` beyond what's in
/// `NodePool` itself.
pub struct ServerDependencies {
    pub ssh_key_ids: Vec<i64>,
    pub placement_group_id: Option<i64>,
    pub network_id: Option<i64>,
    pub private_ip: Option<String>,
    pub user_data: String,
    pub image_label_selector: String,
    pub image_wait: Duration,
}

/// Ensure one server of `pool` at `index` exists, resolving its server
/// type, boot image, and location first.
///
/// # Errors
/// See [`EnsureOp`]; the create path additionally fails with
/// [`EnsureError::CreateFailed`] wrapping [`ProviderError::NotFound`] if
/// `pool.server_type` or `pool.location` does not resolve.
pub async fn ensure_server<'a>(
    client: &'a dyn CloudClient,
    cluster_name: &str,
    pool: &NodePool,
    index: u32,
    deps: ServerDependencies,
    retry_config: &'a RetryConfig,
    cancel: &'a CancellationToken,
) -> Result<Server, EnsureError> {
    let name = naming::server(cluster_name, &pool.name, index);
    let labels = server_labels(cluster_name, pool);

    let get_name = name.clone();
    let create_name = name.clone();
    let create_labels = labels.clone();
    let server_type_name = pool.server_type.clone();
    let location_name = pool.location.clone();
    let public_ipv4 = public_ip_toggle(pool.public_ipv4);
    let public_ipv6 = public_ip_toggle(pool.public_ipv6);

    let op: EnsureOp<'a, Server> = EnsureOp {
        name: name.clone(),
        get: Box::new(move || {
            let name = get_name.clone();
            Box::pin(async move { client.get_server_by_name(&name).await })
        }),
        create: Box::new(move || {
            let name = create_name.clone();
            let labels = create_labels.clone();
            let server_type_name = server_type_name.clone();
            let location_name = location_name.clone();
            let image_label_selector = deps.image_label_selector.clone();
            let image_wait = deps.image_wait;
            let ssh_key_ids = deps.ssh_key_ids.clone();
            let placement_group_id = deps.placement_group_id;
            let network_id = deps.network_id;
            let private_ip = deps.private_ip.clone();
            let user_data = deps.user_data.clone();

            Box::pin(async move {
                let server_type = client
                    .get_server_type_by_name(&server_type_name)
                    .await?
                    .ok_or_else(|| ProviderError::NotFound(format!("server type '{server_type_name}'")))?;
                let location = client
                    .get_location_by_name(&location_name)
                    .await?
                    .ok_or_else(|| ProviderError::NotFound(format!("location '{location_name}'")))?;
                let image_id = resolve_image(
                    client,
                    &image_label_selector,
                    &server_type.architecture,
                    image_wait,
                )
                .await?;

                let opts = CreateServerOpts {
                    name,
                    server_type_id: server_type.id,
                    image_id,
                    location_id: location.id,
                    ssh_key_ids,
                    labels,
                    user_data,
                    placement_group_id,
                    network_id,
                    private_ip,
                    public_ipv4,
                    public_ipv6,
                    start_after_create: network_id.is_none(),
                };

                retry(retry_config, cancel, "create_server", || {
                    let opts = opts.clone();
                    async move {
                        match client.create_server(opts).await {
                            Ok(result) => Ok(result),
                            Err(e) if classify(&e).is_retryable() => Err(RetryOutcome::Retryable(e)),
                            Err(e) => Err(RetryOutcome::Fatal(e)),
                        }
                    }
                })
                .await
                .map_err(|e| match e {
                    crate::retry::RetryError::Operation(e) => e,
                    crate::retry::RetryError::Cancelled => {
                        ProviderError::Config("server creation cancelled".to_string())
                    }
                })
            })
        }),
        validate: None,
        update: None,
    };

    ensure(&op).await
}

/// Attach `server` to the cluster's private network and power it on, if it
/// was created without a network (spec §4.1.7: servers joining a private
/// network must not start until attached).
///
/// # Errors
/// Propagates the underlying `ProviderError`.
pub async fn attach_and_start(
    client: &dyn CloudClient,
    server: &Server,
    network_id: i64,
    private_ip: Option<&str>,
) -> Result<(), EnsureError> {
    let attach = client
        .attach_server_to_network(server.id, network_id, private_ip)
        .await
        .map_err(|source| EnsureError::UpdateFailed {
            name: server.name.clone(),
            source,
        })?;
    await_action(attach.as_ref())
        .await
        .map_err(|e| EnsureError::ActionFailed {
            name: server.name.clone(),
            message: e.to_string(),
        })?;

    let power_on = client
        .power_on_server(server.id)
        .await
        .map_err(|source| EnsureError::UpdateFailed {
            name: server.name.clone(),
            source,
        })?;
    await_action(power_on.as_ref())
        .await
        .map_err(|e| EnsureError::ActionFailed {
            name: server.name.clone(),
            message: e.to_string(),
        })
}

/// The server's reachable public address: prefer IPv4, falling back to the
/// IPv6 `/64` prefix with `::1` substituted into the last byte, reflecting
/// the cloud's own addressing convention (spec §4.1.7 public-IP convention).
///
/// # Errors
/// Returns [`ProviderError::NotFound`] if the server has neither address
/// assigned, or [`ProviderError::Config`] if the IPv6 prefix can't be
/// parsed as a network address.
pub fn public_address(server: &Server) -> Result<String, ProviderError> {
    if let Some(ipv4) = server.ipv4.as_deref() {
        return Ok(ipv4.to_string());
    }
    let Some(prefix) = server.ipv6_network.as_deref() else {
        return Err(ProviderError::NotFound(format!(
            "no public address assigned to server '{}'",
            server.name
        )));
    };
    let network = prefix.split('/').next().unwrap_or(prefix);
    let addr: Ipv6Addr = network
        .parse()
        .map_err(|e| ProviderError::Config(format!("parsing ipv6 prefix '{prefix}': {e}")))?;
    let mut octets = addr.octets();
    octets[15] = 1;
    Ok(Ipv6Addr::from(octets).to_string())
}

/// Delete `server`, retrying while it is mid-action.
///
/// # Errors
/// Surfaces the underlying `ProviderError` once retries are exhausted.
pub async fn delete_server_with_retry(
    client: &dyn CloudClient,
    server: &Server,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<(), crate::retry::RetryError<ProviderError>> {
    retry(config, cancel, &server.name, || async {
        match client.delete_server(server.id).await {
            Ok(action) => match await_action(action.as_ref()).await {
                Ok(()) => Ok(()),
                Err(e) if classify(&e).is_retryable() => Err(RetryOutcome::Retryable(e)),
                Err(e) => Err(RetryOutcome::Fatal(e)),
            },
            Err(e) if classify(&e).is_retryable() => Err(RetryOutcome::Retryable(e)),
            Err(e) => Err(RetryOutcome::Fatal(e)),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudClient;
    use std::collections::BTreeMap;

    fn pool() -> NodePool {
        NodePool {
            name: "cp".into(),
            role: crate::spec::PoolRole::ControlPlane,
            replicas: 3,
            server_type: "cx22".into(),
            location: "fsn1".into(),
            placement_group_strategy: None,
            labels: BTreeMap::new(),
            taints: Vec::new(),
            public_ipv4: true,
            public_ipv6: false,
        }
    }

    async fn deps(client: &MockCloudClient) -> ServerDependencies {
        let _ = client
            .create_snapshot(0, "prod-talos-v1.9.0", naming::cluster_labels("prod"))
            .await
            .unwrap();
        ServerDependencies {
            ssh_key_ids: vec![],
            placement_group_id: None,
            network_id: None,
            private_ip: None,
            user_data: String::new(),
            image_label_selector: naming::build_label_selector(&naming::cluster_labels("prod")),
            image_wait: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn creates_once_and_is_idempotent() {
        let client = MockCloudClient::new();
        let deps1 = deps(&client).await;
        let retry_config = RetryConfig::default();
        let cancel = CancellationToken::new();

        let first = ensure_server(&client, "prod", &pool(), 0, deps1, &retry_config, &cancel)
            .await
            .unwrap();
        let deps2 = deps(&client).await;
        let second = ensure_server(&client, "prod", &pool(), 0, deps2, &retry_config, &cancel)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.name, "prod-cp-0");
    }

    #[tokio::test]
    async fn public_address_prefers_ipv4() {
        let server = Server {
            id: 1,
            name: "s".into(),
            ipv4: Some("1.2.3.4".into()),
            ipv6_network: Some("2001:db8::/64".into()),
            labels: BTreeMap::new(),
        };
        assert_eq!(public_address(&server).unwrap(), "1.2.3.4");
    }

    #[tokio::test]
    async fn public_address_falls_back_to_ipv6_with_host_substituted() {
        let server = Server {
            id: 1,
            name: "s".into(),
            ipv4: None,
            ipv6_network: Some("2001:db8::/64".into()),
            labels: BTreeMap::new(),
        };
        assert_eq!(public_address(&server).unwrap(), "2001:db8::1");
    }

    #[tokio::test]
    async fn public_address_errors_when_neither_assigned() {
        let server = Server {
            id: 1,
            name: "s".into(),
            ipv4: None,
            ipv6_network: None,
            labels: BTreeMap::new(),
        };
        assert!(public_address(&server).is_err());
    }
}
