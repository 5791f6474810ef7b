//! Certificate ensure (spec §4.1.4 Certificate kind).
//!
//! Used when the load balancer terminates TLS in front of the Kubernetes
//! API server. Simple Ensure, matching [`super::ssh_key`]'s shape.

use crate::cloud::{Certificate, CloudClient, CreateCertificateOpts};
use crate::error::EnsureError;
use crate::naming;

use super::ensure::{ensure, EnsureOp};

/// Ensure a certificate exists under its deterministic name.
///
/// # Errors
/// See [`EnsureOp`].
pub async fn ensure_certificate(
    client: &dyn CloudClient,
    name: &str,
    cluster_name: &str,
    certificate_pem: &str,
    private_key_pem: &str,
) -> Result<Certificate, EnsureError> {
    let labels = naming::cluster_labels(cluster_name);
    let name = name.to_string();
    let certificate_pem = certificate_pem.to_string();
    let private_key_pem = private_key_pem.to_string();

    let get_name = name.clone();
    let create_name = name.clone();
    let create_cert = certificate_pem.clone();
    let create_key = private_key_pem.clone();
    let create_labels = labels.clone();

    let op = EnsureOp {
        name: name.clone(),
        get: Box::new(move || {
            let name = get_name.clone();
            Box::pin(async move { client.get_certificate_by_name(&name).await })
        }),
        create: Box::new(move || {
            let opts = CreateCertificateOpts {
                name: create_name.clone(),
                certificate_pem: create_cert.clone(),
                private_key_pem: create_key.clone(),
                labels: create_labels.clone(),
            };
            Box::pin(async move {
                let cert = client.create_certificate(opts).await?;
                Ok(crate::action::CreationResult::without_action(cert))
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
        let first = ensure_certificate(&client, "prod-api-cert", "prod", "pem", "key")
            .await
            .unwrap();
        let second = ensure_certificate(&client, "prod-api-cert", "prod", "pem", "key")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }
}
