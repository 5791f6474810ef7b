//! SSH key ensure (spec §4.1.4 SSH key kind).
//!
//! No Update: a key's public material is immutable once uploaded, and a
//! mismatch here is deliberately not validated — swapping the fingerprint
//! under a stable name is an operator-driven rotation, out of this layer's
//! scope (spec §1 Non-goals, "secret material").

use crate::cloud::{CloudClient, CreateSshKeyOpts, SshKey};
use crate::error::EnsureError;
use crate::naming;

use super::ensure::{ensure, EnsureOp};

/// Ensure the cluster's SSH key exists under its deterministic name.
///
/// # Errors
/// See [`EnsureOp`].
pub async fn ensure_ssh_key(
    client: &dyn CloudClient,
    cluster_name: &str,
    public_key: &str,
) -> Result<SshKey, EnsureError> {
    let name = naming::ssh_key(cluster_name);
    let labels = naming::cluster_labels(cluster_name);
    let public_key = public_key.to_string();

    let get_name = name.clone();
    let create_name = name.clone();
    let create_key = public_key.clone();
    let create_labels = labels.clone();

    let op = EnsureOp {
        name: name.clone(),
        get: Box::new(move || {
            let name = get_name.clone();
            Box::pin(async move { client.get_ssh_key_by_name(&name).await })
        }),
        create: Box::new(move || {
            let opts = CreateSshKeyOpts {
                name: create_name.clone(),
                public_key: create_key.clone(),
                labels: create_labels.clone(),
            };
            Box::pin(async move {
                let key = client.create_ssh_key(opts).await?;
                Ok(crate::action::CreationResult::without_action(key))
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
        let first = ensure_ssh_key(&client, "prod", "ssh-ed25519 AAAA...")
            .await
            .unwrap();
        let second = ensure_ssh_key(&client, "prod", "ssh-ed25519 AAAA...")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }
}
