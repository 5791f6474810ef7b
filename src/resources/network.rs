//! Network ensure (spec §4.1.4 Network kind).
//!
//! Grounded on the generic algorithm in [`super::ensure`]; the only
//! kind-specific logic is the CIDR-mismatch Validate check (an existing
//! network's `ip_range` differing from the desired spec is an immutable
//! property clash, so `Ensure` must abort rather than attempt an update).

use crate::cloud::{CloudClient, CreateNetworkOpts, Network, Subnet};
use crate::error::EnsureError;
use crate::naming;
use crate::spec::NetworkSpec;

use super::ensure::{ensure, BoxFuture, EnsureOp};

/// Ensure the cluster's private network and its single subnet exist.
///
/// # Errors
/// See [`EnsureOp`]; in particular [`EnsureError::ValidationFailed`] if an
/// existing network's `ip_range` does not match `network_spec.cidr`.
pub async fn ensure_network<'a>(
    client: &'a dyn CloudClient,
    cluster_name: &str,
    network_spec: &NetworkSpec,
) -> Result<Network, EnsureError> {
    let name = naming::network(cluster_name);
    let labels = naming::cluster_labels(cluster_name);
    let desired_cidr = network_spec.cidr.clone();
    let desired_subnet = Subnet {
        ip_range: network_spec.subnet_cidr.clone(),
        zone: network_spec.zone.clone(),
    };

    let get_name = name.clone();
    let create_name = name.clone();
    let create_cidr = desired_cidr.clone();
    let create_subnet = desired_subnet.clone();
    let create_labels = labels.clone();
    let validate_cidr = desired_cidr.clone();
    let update_subnet = desired_subnet.clone();

    let op: EnsureOp<'a, Network> = EnsureOp {
        name: name.clone(),
        get: Box::new(move || {
            let name = get_name.clone();
            Box::pin(async move { client.get_network_by_name(&name).await })
        }),
        create: Box::new(move || {
            let opts = CreateNetworkOpts {
                name: create_name.clone(),
                ip_range: create_cidr.clone(),
                subnets: vec![create_subnet.clone()],
                labels: create_labels.clone(),
            };
            Box::pin(async move { client.create_network(opts).await })
        }),
        validate: Some(Box::new(move |network: &Network| {
            if network.ip_range == validate_cidr {
                None
            } else {
                Some(format!(
                    "network ip_range {} does not match desired {validate_cidr}",
                    network.ip_range
                ))
            }
        })),
        update: Some(Box::new(move |network: &Network| {
            let has_subnet = network
                .subnets
                .iter()
                .any(|s| s.ip_range == update_subnet.ip_range);
            if has_subnet {
                return None;
            }
            let network_id = network.id;
            let subnet = update_subnet.clone();
            Some(Box::pin(async move {
                let action = client.add_subnet(network_id, subnet).await?;
                Ok(vec![action])
            }) as BoxFuture<'a, _>)
        })),
    };

    ensure(&op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::{Call, MockCloudClient};

    fn spec() -> NetworkSpec {
        NetworkSpec {
            cidr: "10.0.0.0/8".into(),
            zone: "eu-central".into(),
            subnet_cidr: "10.0.0.0/24".into(),
        }
    }

    #[tokio::test]
    async fn creates_network_when_absent() {
        let client = MockCloudClient::new();
        let network = ensure_network(&client, "prod", &spec()).await.unwrap();
        assert_eq!(network.ip_range, "10.0.0.0/8");
        assert_eq!(
            client.call_count(|c| matches!(c, Call::CreateNetwork(_))).await,
            1
        );
    }

    #[tokio::test]
    async fn second_ensure_is_a_noop() {
        let client = MockCloudClient::new();
        ensure_network(&client, "prod", &spec()).await.unwrap();
        ensure_network(&client, "prod", &spec()).await.unwrap();
        assert_eq!(
            client.call_count(|c| matches!(c, Call::CreateNetwork(_))).await,
            1
        );
    }

    #[tokio::test]
    async fn cidr_mismatch_fails_validation() {
        let client = MockCloudClient::new();
        ensure_network(&client, "prod", &spec()).await.unwrap();

        let mut other = spec();
        other.cidr = "192.168.0.0/16".into();
        let err = ensure_network(&client, "prod", &other).await.unwrap_err();
        assert!(matches!(err, EnsureError::ValidationFailed { .. }));
    }
}
