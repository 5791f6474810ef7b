//! Placement-group ensure (spec §4.1.4 Placement group kind).
//!
//! Simplest adapter in the set: no Validate (the group carries no mutable
//! or immutable property beyond its name) and no Update.

use crate::cloud::{CloudClient, CreatePlacementGroupOpts, PlacementGroup};
use crate::error::EnsureError;
use crate::naming;

use super::ensure::{ensure, EnsureOp};

/// Ensure one placement group exists for `(pool, shard)`.
///
/// # Errors
/// See [`EnsureOp`].
pub async fn ensure_placement_group(
    client: &dyn CloudClient,
    cluster_name: &str,
    pool_name: &str,
    shard: u32,
) -> Result<PlacementGroup, EnsureError> {
    let name = naming::placement_group(cluster_name, pool_name, shard);
    let labels = naming::cluster_labels(cluster_name);

    let get_name = name.clone();
    let create_name = name.clone();
    let create_labels = labels.clone();

    let op = EnsureOp {
        name: name.clone(),
        get: Box::new(move || {
            let name = get_name.clone();
            Box::pin(async move { client.get_placement_group_by_name(&name).await })
        }),
        create: Box::new(move || {
            let opts = CreatePlacementGroupOpts {
                name: create_name.clone(),
                labels: create_labels.clone(),
            };
            Box::pin(async move {
                let pg = client.create_placement_group(opts).await?;
                Ok(crate::action::CreationResult::without_action(pg))
            })
        }),
        validate: None,
        update: None,
    };

    ensure(&op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudClient;

    #[tokio::test]
    async fn creates_once_and_is_idempotent() {
        let client = MockCloudClient::new();
        let first = ensure_placement_group(&client, "prod", "workers", 0).await.unwrap();
        let second = ensure_placement_group(&client, "prod", "workers", 0).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn shards_are_distinct_groups() {
        let client = MockCloudClient::new();
        let shard0 = ensure_placement_group(&client, "prod", "workers", 0).await.unwrap();
        let shard1 = ensure_placement_group(&client, "prod", "workers", 1).await.unwrap();
        assert_ne!(shard0.id, shard1.id);
        assert_ne!(shard0.name, shard1.name);
    }
}
