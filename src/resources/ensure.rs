//! The generic get-or-create (C4 `Ensure`) and idempotent-delete (C4
//! `Delete`) primitives, parameterised per resource kind.
//!
//! Grounded on Design Note "Generic collection of heterogeneous resources":
//! rather than a trait object per resource (the bare-metal provisioner's
//! `Provider` trait needs only one resource shape; we need nine), each
//! resource kind supplies function-typed fields on an `EnsureOp`/`DeleteOp`
//! carrying its own Get/Create/Validate/Update/Delete closures. No
//! inheritance, no enum of resource kinds.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::action::{await_all, await_creation, Action, CreationResult};
use crate::error::{classify, EnsureError, ProviderError};
use crate::retry::{retry, RetryConfig, RetryError, RetryOutcome};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Parameters for the generic `Ensure` algorithm (spec §4.1.4).
pub struct EnsureOp<'a, T> {
    pub name: String,
    pub get: Box<dyn Fn() -> BoxFuture<'a, Result<Option<T>, ProviderError>> + Send + Sync + 'a>,
    pub create:
        Box<dyn Fn() -> BoxFuture<'a, Result<CreationResult<T>, ProviderError>> + Send + Sync + 'a>,
    /// Pure check against desired state; `Some(msg)` aborts before any write.
    pub validate: Option<Box<dyn Fn(&T) -> Option<String> + Send + Sync + 'a>>,
    /// Returns `None` when `MapUpdateOpts` would be absent for this
    /// resource (spec §4.1.4 edge case: "Update set but `MapUpdateOpts` not
    /// -> skip").
    #[allow(clippy::type_complexity)]
    pub update: Option<
        Box<dyn Fn(&T) -> Option<BoxFuture<'a, Result<Vec<Box<dyn Action>>, ProviderError>>> + Send + Sync + 'a>,
    >,
}

/// Get-or-create a resource matching `op`'s desired spec (spec §4.1.4).
///
/// # Errors
/// - [`EnsureError::GetFailed`] if the initial lookup fails.
/// - [`EnsureError::ValidationFailed`] if an existing resource differs from
///   the desired spec in an immutable property. Validate runs *before*
///   Update and nothing is written in this case.
/// - [`EnsureError::UpdateFailed`] / [`EnsureError::CreateFailed`] /
///   [`EnsureError::ActionFailed`] on downstream failures.
pub async fn ensure<T>(op: &EnsureOp<'_, T>) -> Result<T, EnsureError> {
    let existing = (op.get)().await.map_err(|source| EnsureError::GetFailed {
        name: op.name.clone(),
        source,
    })?;

    match existing {
        Some(resource) => {
            if let Some(validate) = &op.validate {
                if let Some(message) = validate(&resource) {
                    return Err(EnsureError::ValidationFailed {
                        name: op.name.clone(),
                        message,
                    });
                }
            }

            if let Some(update) = &op.update {
                if let Some(update_fut) = update(&resource) {
                    let actions = update_fut.await.map_err(|source| EnsureError::UpdateFailed {
                        name: op.name.clone(),
                        source,
                    })?;
                    let refs: Vec<&dyn Action> = actions.iter().map(AsRef::as_ref).collect();
                    await_all(&refs).await.map_err(|e| EnsureError::ActionFailed {
                        name: op.name.clone(),
                        message: e.to_string(),
                    })?;
                }
            }

            Ok(resource)
        }
        None => {
            let result = (op.create)().await.map_err(|source| EnsureError::CreateFailed {
                name: op.name.clone(),
                source,
            })?;
            await_creation(&result).await.map_err(|e| EnsureError::ActionFailed {
                name: op.name.clone(),
                message: e.to_string(),
            })?;
            Ok(result.resource)
        }
    }
}

/// Parameters for the generic `Delete` algorithm (spec §4.1.5).
pub struct DeleteOp<'a, T> {
    pub name: String,
    pub get: Box<dyn Fn() -> BoxFuture<'a, Result<Option<T>, ProviderError>> + Send + Sync + 'a>,
    pub delete: Box<dyn Fn(&T) -> BoxFuture<'a, Result<(), ProviderError>> + Send + Sync + 'a>,
}

/// Idempotent single-attempt delete: succeeds if the resource is already
/// gone. Callers that need retry wrap this with [`delete_with_retry`].
///
/// # Errors
/// Returns the classified `ProviderError` from `Get` or `Delete`; the
/// caller is expected to inspect `classify(&err)` to decide whether to
/// retry.
pub async fn delete_once<T>(op: &DeleteOp<'_, T>) -> Result<(), ProviderError> {
    let existing = (op.get)().await?;
    let Some(resource) = existing else {
        return Ok(());
    };
    (op.delete)(&resource).await
}

/// Wraps [`delete_once`] in C1's retry policy, classifying failures via C2
/// so a locked/in-use resource is retried and anything else is fatal.
///
/// # Errors
/// Surfaces the underlying `ProviderError` once retries are exhausted, or
/// `RetryError::Cancelled` if `cancel` fires first.
pub async fn delete_with_retry<T>(
    op: &DeleteOp<'_, T>,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<(), RetryError<ProviderError>> {
    retry(config, cancel, &op.name, || async {
        match delete_once(op).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if classify(&e).is_retryable() {
                    Err(RetryOutcome::Retryable(e))
                } else {
                    Err(RetryOutcome::Fatal(e))
                }
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    struct Dummy(i64);

    #[tokio::test]
    async fn ensure_creates_when_absent() {
        let creates = AtomicU32::new(0);
        let op = EnsureOp {
            name: "dummy".into(),
            get: Box::new(|| Box::pin(async { Ok(None) })),
            create: Box::new(|| {
                creates.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(CreationResult::without_action(Dummy(1))) })
            }),
            validate: None,
            update: None,
        };

        let result = ensure(&op).await.unwrap();
        assert_eq!(result, Dummy(1));
        assert_eq!(creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ensure_is_noop_when_present_and_no_update() {
        let creates = AtomicU32::new(0);
        let op = EnsureOp {
            name: "dummy".into(),
            get: Box::new(|| Box::pin(async { Ok(Some(Dummy(7))) })),
            create: Box::new(|| {
                creates.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(CreationResult::without_action(Dummy(999))) })
            }),
            validate: None,
            update: None,
        };

        let result = ensure(&op).await.unwrap();
        assert_eq!(result, Dummy(7));
        assert_eq!(creates.load(Ordering::SeqCst), 0, "Ensure must issue no Create when present");
    }

    #[tokio::test]
    async fn validate_runs_before_update_and_aborts_without_writes() {
        let update_calls = AtomicU32::new(0);
        let op = EnsureOp {
            name: "dummy".into(),
            get: Box::new(|| Box::pin(async { Ok(Some(Dummy(1))) })),
            create: Box::new(|| Box::pin(async { Ok(CreationResult::without_action(Dummy(0))) })),
            validate: Some(Box::new(|_| Some("CIDR mismatch".to_string()))),
            update: Some(Box::new(|_| {
                update_calls.fetch_add(1, Ordering::SeqCst);
                Some(Box::pin(async { Ok(vec![]) }) as BoxFuture<'_, _>)
            })),
        };

        let err = ensure(&op).await.unwrap_err();
        assert!(matches!(err, EnsureError::ValidationFailed { .. }));
        assert_eq!(update_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_skipped_when_map_update_opts_absent() {
        let op: EnsureOp<'_, Dummy> = EnsureOp {
            name: "dummy".into(),
            get: Box::new(|| Box::pin(async { Ok(Some(Dummy(5))) })),
            create: Box::new(|| Box::pin(async { Ok(CreationResult::without_action(Dummy(0))) })),
            validate: None,
            update: Some(Box::new(|_| None)),
        };

        let result = ensure(&op).await.unwrap();
        assert_eq!(result, Dummy(5));
    }

    #[tokio::test]
    async fn delete_is_idempotent_when_already_absent() {
        let op: DeleteOp<'_, Dummy> = DeleteOp {
            name: "dummy".into(),
            get: Box::new(|| Box::pin(async { Ok(None) })),
            delete: Box::new(|_| Box::pin(async { panic!("must not call delete on absent resource") })),
        };

        delete_once(&op).await.unwrap();
    }

    #[tokio::test]
    async fn delete_retries_locked_resource_then_succeeds() {
        let attempts = Mutex::new(0u32);
        let op: DeleteOp<'_, Dummy> = DeleteOp {
            name: "dummy".into(),
            get: Box::new(|| Box::pin(async { Ok(Some(Dummy(1))) })),
            delete: Box::new(move |_| {
                let mut n = attempts.lock().unwrap();
                *n += 1;
                let attempt = *n;
                Box::pin(async move {
                    if attempt < 3 {
                        Err(ProviderError::api(409, "conflict", "resource in use"))
                    } else {
                        Ok(())
                    }
                })
            }),
        };

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
            jitter: false,
        };
        let cancel = CancellationToken::new();
        delete_with_retry(&op, &config, &cancel).await.unwrap();
    }
}
