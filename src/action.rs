//! Asynchronous cloud action handles and the waiter (C3).
//!
//! Grounded on the polling idiom in the bare-metal provisioner's
//! `talos/bootstrap.rs` (`wait_for_condition`-style loops), generalized into
//! a reusable `Await` over one or many [`Action`] handles.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;

/// Terminal or in-flight state of an asynchronous cloud action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Running,
    Success,
    Error,
}

/// A handle to a single asynchronous cloud operation.
///
/// The core never caches these across operations; they are created and
/// awaited within the same `Ensure`/`Delete`/provisioner call.
#[async_trait]
pub trait Action: Send + Sync {
    /// Poll once and return the current state, or the terminal error.
    async fn poll(&self) -> Result<ActionState, ProviderError>;

    /// A human-readable description for logging (e.g. `"create_server"`).
    fn description(&self) -> &str;
}

/// A no-op action that is immediately successful. Used by resource adapters
/// whose underlying SDK call is already synchronous from the caller's
/// perspective (e.g. a validated no-change `Update`).
pub struct Immediate;

#[async_trait]
impl Action for Immediate {
    async fn poll(&self) -> Result<ActionState, ProviderError> {
        Ok(ActionState::Success)
    }

    fn description(&self) -> &str {
        "immediate"
    }
}

/// What a create call returns: the created resource, plus either a single
/// action or a set of actions — whichever the underlying API produced.
///
/// Waiter semantics: if `action` is present it takes precedence over
/// `actions`; otherwise every element of `actions` must be awaited.
pub struct CreationResult<T> {
    pub resource: T,
    pub action: Option<Box<dyn Action>>,
    pub actions: Vec<Box<dyn Action>>,
}

impl<T> CreationResult<T> {
    #[must_use]
    pub fn with_action(resource: T, action: Box<dyn Action>) -> Self {
        Self {
            resource,
            action: Some(action),
            actions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_actions(resource: T, actions: Vec<Box<dyn Action>>) -> Self {
        Self {
            resource,
            action: None,
            actions,
        }
    }

    #[must_use]
    pub fn without_action(resource: T) -> Self {
        Self {
            resource,
            action: None,
            actions: Vec::new(),
        }
    }

    /// The actions this result implies must be awaited, per the
    /// single-takes-precedence rule.
    fn actions_to_await(&self) -> Vec<&dyn Action> {
        if let Some(action) = &self.action {
            vec![action.as_ref()]
        } else {
            self.actions.iter().map(std::convert::AsRef::as_ref).collect()
        }
    }
}

/// Poll interval used while waiting for an action to reach a terminal
/// state. This is an SDK polling detail, not a retry policy (spec §4.1.3).
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Block until `action` reaches `Success` (returns `Ok`) or `Error` (returns
/// `Err`).
pub async fn await_action(action: &dyn Action) -> Result<(), ProviderError> {
    loop {
        match action.poll().await? {
            ActionState::Success => return Ok(()),
            ActionState::Error => {
                return Err(ProviderError::api(
                    0,
                    "action_failed",
                    format!("action '{}' reached error state", action.description()),
                ))
            }
            ActionState::Running => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }
}

/// Block until every action in `actions` succeeds, or return the first
/// error encountered. An empty slice is a no-op.
pub async fn await_all(actions: &[&dyn Action]) -> Result<(), ProviderError> {
    for action in actions {
        await_action(*action).await?;
    }
    Ok(())
}

/// Await the actions implied by a [`CreationResult`], per the
/// single-takes-precedence rule.
pub async fn await_creation<T>(result: &CreationResult<T>) -> Result<(), ProviderError> {
    await_all(&result.actions_to_await()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingAction {
        succeed_after: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Action for CountingAction {
        async fn poll(&self) -> Result<ActionState, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_after {
                Ok(ActionState::Success)
            } else {
                Ok(ActionState::Running)
            }
        }

        fn description(&self) -> &str {
            "counting"
        }
    }

    struct FailingAction;

    #[async_trait]
    impl Action for FailingAction {
        async fn poll(&self) -> Result<ActionState, ProviderError> {
            Ok(ActionState::Error)
        }

        fn description(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn empty_await_all_is_noop() {
        await_all(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn single_action_takes_precedence_over_set() {
        let single = CountingAction {
            succeed_after: 1,
            calls: AtomicU32::new(0),
        };
        let never_polled = FailingAction;
        let result = CreationResult {
            resource: (),
            action: Some(Box::new(single)),
            actions: vec![Box::new(never_polled)],
        };
        // Must not see the failing action in the set, since `action` wins.
        await_creation(&result).await.unwrap();
    }

    #[tokio::test]
    async fn await_set_surfaces_first_error() {
        let result: CreationResult<()> =
            CreationResult::with_actions((), vec![Box::new(FailingAction)]);
        let err = await_creation(&result).await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { .. }));
    }
}
