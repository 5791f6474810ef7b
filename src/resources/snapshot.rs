//! Snapshot (Talos boot image) ensure and retrying delete (spec §4.1.4
//! Snapshot kind).
//!
//! `CreateSnapshot` is wrapped like any other Ensure, but `DeleteImage` gets
//! its own retry: a snapshot can be transiently locked by a concurrent
//! Hetzner-side export job, which C2 classifies as `RetryableLocked`.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::action::CreationResult;
use crate::cloud::{CloudClient, Image};
use crate::error::EnsureError;
use crate::naming;
use crate::resources::ensure::DeleteOp;
use crate::retry::{RetryConfig, RetryError};

use super::ensure::{ensure, EnsureOp};

/// Ensure a Talos boot snapshot exists for `talos_version`, cutting one
/// from `server_id` if absent.
///
/// # Errors
/// See [`EnsureOp`].
pub async fn ensure_snapshot(
    client: &dyn CloudClient,
    cluster_name: &str,
    talos_version: &str,
    server_id: i64,
) -> Result<Image, EnsureError> {
    let name = naming::snapshot(cluster_name, talos_version);
    let labels = naming::cluster_labels(cluster_name);

    let get_name = name.clone();
    let create_name = name.clone();
    let create_labels = labels.clone();

    let op = EnsureOp {
        name: name.clone(),
        get: Box::new(move || {
            let name = get_name.clone();
            Box::pin(async move { client.get_image_by_name(&name).await })
        }),
        create: Box::new(move || {
            let description = create_name.clone();
            let labels: BTreeMap<String, String> = create_labels.clone();
            Box::pin(async move {
                let image = client.create_snapshot(server_id, &description, labels).await?;
                Ok(CreationResult::without_action(image))
            })
        }),
        validate: None,
        update: None,
    };

    ensure(&op).await
}

/// Delete `image_id`'s snapshot, retrying while Hetzner reports it locked.
///
/// # Errors
/// Surfaces the underlying `ProviderError` once retries are exhausted.
pub async fn delete_snapshot(
    client: &dyn CloudClient,
    image_id: i64,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<(), RetryError<crate::error::ProviderError>> {
    let op: DeleteOp<'_, ()> = DeleteOp {
        name: format!("snapshot-{image_id}"),
        get: Box::new(move || Box::pin(async move { Ok(Some(())) })),
        delete: Box::new(move |_: &()| Box::pin(async move { client.delete_image(image_id).await })),
    };
    super::ensure::delete_with_retry(&op, config, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudClient;

    #[tokio::test]
    async fn creates_once_and_is_idempotent() {
        let client = MockCloudClient::new();
        let first = ensure_snapshot(&client, "prod", "v1.9.0", 1).await.unwrap();
        let second = ensure_snapshot(&client, "prod", "v1.9.0", 1).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn delete_succeeds_when_image_gone() {
        let client = MockCloudClient::new();
        let image = ensure_snapshot(&client, "prod", "v1.9.0", 1).await.unwrap();
        let cancel = CancellationToken::new();
        delete_snapshot(&client, image.id, &RetryConfig::default(), &cancel)
            .await
            .unwrap();
    }
}
