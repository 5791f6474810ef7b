//! Error taxonomy shared by the cloud resource layer.
//!
//! The cloud SDK (`cloud::CloudClient`) reports failures as [`ProviderError`].
//! Everything above that layer reasons about failures through [`ErrorClass`],
//! which [`classify`] derives from a `ProviderError` without any I/O.

use thiserror::Error;

/// Errors surfaced by a `CloudClient` call.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API responded with a non-2xx status.
    #[error("API error: {status} - {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Requested resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A blocking wait exceeded its budget.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed input supplied by the caller.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Response body did not match the expected shape.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    /// Build an `Api` error carrying a known Hetzner-Cloud-style error code.
    #[must_use]
    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The classification `C2` maps a `ProviderError` into.
///
/// Pure: no I/O, no retries performed here. Callers (mainly `retry::Retry`
/// and `resources::ensure`) decide what to do with the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Resource is mid-action, locked, or conflicted. Wait and retry.
    RetryableLocked,
    /// Permanent: malformed input, not-found on a write path, wrong subtype.
    FatalInvalid,
    /// Backoff and retry.
    RateLimited,
    /// Unknown shape; treated as retryable by default.
    Other,
}

impl ErrorClass {
    /// Whether `Retry` (C1) should attempt this operation again.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::FatalInvalid)
    }
}

/// Known Hetzner-Cloud-style error codes that indicate a locked/conflicted
/// resource. An implementer targeting a different cloud substitutes the
/// local codes here.
const LOCKED_CODES: &[&str] = &[
    "locked",
    "conflict",
    "resource_in_use",
    "resource_unavailable",
];

const RATE_LIMIT_CODES: &[&str] = &["rate_limit_exceeded"];

const FATAL_CODES: &[&str] = &[
    "invalid_input",
    "not_found",
    "unprocessable_entity",
    "forbidden",
    "invalid_subtype",
];

/// Classify a `ProviderError` by SDK error code / status.
#[must_use]
pub fn classify(err: &ProviderError) -> ErrorClass {
    match err {
        ProviderError::NotFound(_) => ErrorClass::FatalInvalid,
        ProviderError::Config(_) => ErrorClass::FatalInvalid,
        ProviderError::Serialization(_) => ErrorClass::FatalInvalid,
        ProviderError::Timeout(_) => ErrorClass::RetryableLocked,
        ProviderError::Http(_) => ErrorClass::Other,
        ProviderError::Api { status, code, .. } => {
            if RATE_LIMIT_CODES.contains(&code.as_str()) || *status == 429 {
                ErrorClass::RateLimited
            } else if LOCKED_CODES.contains(&code.as_str()) || *status == 409 {
                ErrorClass::RetryableLocked
            } else if FATAL_CODES.contains(&code.as_str()) || *status == 400 || *status == 422 {
                ErrorClass::FatalInvalid
            } else {
                ErrorClass::Other
            }
        }
    }
}

/// Ensure/Delete (C4) failures.
#[derive(Error, Debug)]
pub enum EnsureError {
    #[error("Get failed for {name}: {source}")]
    GetFailed {
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("validation failed for {name}: {message}")]
    ValidationFailed { name: String, message: String },

    #[error("create failed for {name}: {source}")]
    CreateFailed {
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("update failed for {name}: {source}")]
    UpdateFailed {
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("delete failed for {name}: {source}")]
    DeleteFailed {
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("await failed for {name}: {message}")]
    ActionFailed { name: String, message: String },
}

/// Aggregated per-resource-class cleanup failure (C7).
#[derive(Error, Debug)]
#[error("cleanup failed for {} resource class(es): {}", .failures.len(), join_failures(.failures))]
pub struct CleanupError {
    pub failures: Vec<(String, anyhow::Error)>,
}

fn join_failures(failures: &[(String, anyhow::Error)]) -> String {
    failures
        .iter()
        .map(|(class, err)| format!("{class}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl CleanupError {
    #[must_use]
    pub fn new(failures: Vec<(String, anyhow::Error)>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_locked_as_retryable() {
        let err = ProviderError::api(409, "conflict", "resource busy");
        assert_eq!(classify(&err), ErrorClass::RetryableLocked);
        assert!(classify(&err).is_retryable());
    }

    #[test]
    fn classifies_invalid_input_as_fatal() {
        let err = ProviderError::api(400, "invalid_input", "bad cidr");
        assert_eq!(classify(&err), ErrorClass::FatalInvalid);
        assert!(!classify(&err).is_retryable());
    }

    #[test]
    fn classifies_rate_limit() {
        let err = ProviderError::api(429, "rate_limit_exceeded", "slow down");
        assert_eq!(classify(&err), ErrorClass::RateLimited);
    }

    #[test]
    fn not_found_is_fatal_on_write_path() {
        let err = ProviderError::NotFound("server 42".into());
        assert_eq!(classify(&err), ErrorClass::FatalInvalid);
    }
}
