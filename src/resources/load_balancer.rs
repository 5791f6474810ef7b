//! Load balancer ensure and its three follow-up operations (spec §4.1.4
//! Load balancer / Service / Target kinds, spec §4.1.6).
//!
//! `Create` resolves the load-balancer type and location via auxiliary Gets
//! before calling the SDK — either missing is a fatal misconfiguration, not
//! a retryable condition. Network attachment, service, and target are each
//! separate SDK calls with independent skip-if-exists checks, since a prior
//! run can have completed any prefix of the three before crashing.

use crate::action::await_action;
use crate::cloud::{CloudClient, CreateLoadBalancerOpts, LoadBalancer, TargetType};
use crate::error::EnsureError;
use crate::naming;
use crate::spec::ClusterSpec;

use super::ensure::{ensure, EnsureOp};

/// Ensure the cluster's kube-apiserver load balancer exists.
///
/// # Errors
/// See [`EnsureOp`]; the create path fails with
/// [`EnsureError::CreateFailed`] wrapping [`crate::error::ProviderError::NotFound`]
/// if `lb_type_name` or `location_name` does not resolve.
pub async fn ensure_load_balancer<'a>(
    client: &'a dyn CloudClient,
    spec: &ClusterSpec,
    lb_type_name: &str,
) -> Result<LoadBalancer, EnsureError> {
    let name = naming::load_balancer(&spec.cluster_name);
    let labels = naming::cluster_labels(&spec.cluster_name);
    let location_name = spec
        .control_plane_pool()
        .map_or_else(|| "fsn1".to_string(), |p| p.location.clone());

    let get_name = name.clone();
    let create_name = name.clone();
    let create_labels = labels.clone();
    let create_type_name = lb_type_name.to_string();
    let create_location_name = location_name.clone();

    let op: EnsureOp<'a, LoadBalancer> = EnsureOp {
        name: name.clone(),
        get: Box::new(move || {
            let name = get_name.clone();
            Box::pin(async move { client.get_load_balancer_by_name(&name).await })
        }),
        create: Box::new(move || {
            let name = create_name.clone();
            let labels = create_labels.clone();
            let type_name = create_type_name.clone();
            let location_name = create_location_name.clone();
            Box::pin(async move {
                let lb_type = client
                    .get_load_balancer_type_by_name(&type_name)
                    .await?
                    .ok_or_else(|| {
                        crate::error::ProviderError::NotFound(format!(
                            "load balancer type '{type_name}'"
                        ))
                    })?;
                let location = client.get_location_by_name(&location_name).await?.ok_or_else(|| {
                    crate::error::ProviderError::NotFound(format!("location '{location_name}'"))
                })?;
                client
                    .create_load_balancer(CreateLoadBalancerOpts {
                        name,
                        load_balancer_type_id: lb_type.id,
                        location_id: location.id,
                        labels,
                    })
                    .await
            })
        }),
        validate: None,
        update: None,
    };

    ensure(&op).await
}

/// Attach the load balancer to the cluster's private network, unless
/// already attached.
///
/// # Errors
/// Propagates the underlying `ProviderError`.
pub async fn ensure_network_attachment(
    client: &dyn CloudClient,
    lb: &LoadBalancer,
    network_id: i64,
    private_ip: &str,
) -> Result<(), EnsureError> {
    if lb.attached_network_id == Some(network_id) {
        return Ok(());
    }
    let action = client
        .attach_load_balancer_to_network(lb.id, network_id, private_ip)
        .await
        .map_err(|source| EnsureError::UpdateFailed {
            name: lb.name.clone(),
            source,
        })?;
    await_action(action.as_ref())
        .await
        .map_err(|e| EnsureError::ActionFailed {
            name: lb.name.clone(),
            message: e.to_string(),
        })
}

/// Add the kube-apiserver service (port 6443) to the load balancer, unless
/// already present.
///
/// # Errors
/// Propagates the underlying `ProviderError`.
pub async fn ensure_service(
    client: &dyn CloudClient,
    lb: &LoadBalancer,
    listen_port: u16,
) -> Result<(), EnsureError> {
    if lb.service_ports.contains(&listen_port) {
        return Ok(());
    }
    let action = client
        .add_load_balancer_service(lb.id, listen_port)
        .await
        .map_err(|source| EnsureError::UpdateFailed {
            name: lb.name.clone(),
            source,
        })?;
    await_action(action.as_ref())
        .await
        .map_err(|e| EnsureError::ActionFailed {
            name: lb.name.clone(),
            message: e.to_string(),
        })
}

/// Target the control-plane pool's label selector, unless already
/// targeted.
///
/// # Errors
/// Propagates the underlying `ProviderError`.
pub async fn ensure_target(
    client: &dyn CloudClient,
    lb: &LoadBalancer,
    selector: &str,
) -> Result<(), EnsureError> {
    if lb.target_label_selectors.iter().any(|s| s == selector) {
        return Ok(());
    }
    let action = client
        .add_load_balancer_target(
            lb.id,
            TargetType::LabelSelector {
                selector: selector.to_string(),
            },
        )
        .await
        .map_err(|source| EnsureError::UpdateFailed {
            name: lb.name.clone(),
            source,
        })?;
    await_action(action.as_ref())
        .await
        .map_err(|e| EnsureError::ActionFailed {
            name: lb.name.clone(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::{Call, MockCloudClient};
    use crate::spec::{FirewallSpec, NetworkSpec, NodePool, PlacementStrategy, PoolRole, TimeoutSpec};
    use std::collections::BTreeMap;

    fn test_spec() -> ClusterSpec {
        ClusterSpec {
            cluster_name: "prod".into(),
            talos_version: "v1.9.0".into(),
            kubernetes_version: "v1.31.0".into(),
            node_pools: vec![NodePool {
                name: "cp".into(),
                role: PoolRole::ControlPlane,
                replicas: 3,
                server_type: "cx22".into(),
                location: "fsn1".into(),
                placement_group_strategy: Some(PlacementStrategy::Single),
                labels: BTreeMap::new(),
                taints: Vec::new(),
                public_ipv4: true,
                public_ipv6: false,
            }],
            network: NetworkSpec {
                cidr: "10.0.0.0/8".into(),
                zone: "eu-central".into(),
                subnet_cidr: "10.0.0.0/24".into(),
            },
            firewall: FirewallSpec {
                api_allow_cidrs: vec!["0.0.0.0/0".into()],
                ssh_allow_cidrs: vec![],
            },
            timeouts: TimeoutSpec::default(),
        }
    }

    #[tokio::test]
    async fn creates_once_and_is_idempotent() {
        let client = MockCloudClient::new();
        let first = ensure_load_balancer(&client, &test_spec(), "lb11").await.unwrap();
        let second = ensure_load_balancer(&client, &test_spec(), "lb11").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(
            client.call_count(|c| matches!(c, Call::CreateLoadBalancer(_))).await,
            1
        );
    }

    #[tokio::test]
    async fn service_and_target_are_idempotent_across_refetches() {
        let client = MockCloudClient::new();
        let lb = ensure_load_balancer(&client, &test_spec(), "lb11").await.unwrap();
        ensure_service(&client, &lb, 6443).await.unwrap();
        // A second run re-fetches the live resource rather than reusing the
        // stale struct from the first call.
        let refetched = client
            .get_load_balancer_by_name(&lb.name)
            .await
            .unwrap()
            .unwrap();
        ensure_service(&client, &refetched, 6443).await.unwrap();
        assert_eq!(
            client.call_count(|c| matches!(c, Call::AddLoadBalancerService(_))).await,
            1
        );

        ensure_target(&client, &refetched, "cluster=prod").await.unwrap();
        let refetched = client
            .get_load_balancer_by_name(&lb.name)
            .await
            .unwrap()
            .unwrap();
        ensure_target(&client, &refetched, "cluster=prod").await.unwrap();
        assert_eq!(
            client.call_count(|c| matches!(c, Call::AddLoadBalancerTarget(_))).await,
            1
        );
    }
}
