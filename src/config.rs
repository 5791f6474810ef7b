//! Process-wide runtime configuration, loaded once and passed by reference.
//!
//! Grounded on the Design Note "Global mutable state: none" — there is no
//! singleton; the CLI entrypoint builds one `RuntimeConfig` and threads it
//! through the reconciler and resource adapters.

use std::time::Duration;

use crate::retry::RetryConfig;

/// Per-class timeouts and the retry policy (spec §6 environment variables).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub timeout_server_create: Duration,
    pub timeout_delete: Duration,
    pub timeout_image_wait: Duration,
    pub timeout_server_ip: Duration,
    pub retry: RetryConfig,
    /// Public half of the operator SSH key the reconciler uploads for the
    /// cluster (spec §4.3 Up, step 2: "public key read from the
    /// collaborator config"). Empty means no key is configured.
    pub ssh_public_key: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout_server_create: Duration::from_secs(600),
            timeout_delete: Duration::from_secs(300),
            timeout_image_wait: Duration::from_secs(900),
            timeout_server_ip: Duration::from_secs(300),
            retry: RetryConfig::default(),
            ssh_public_key: String::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load from the `HCLOUD_TIMEOUT_*` / `HCLOUD_RETRY_*` environment
    /// variables, falling back to the documented defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout_server_create: env_duration_secs(
                "HCLOUD_TIMEOUT_SERVER_CREATE",
                defaults.timeout_server_create,
            ),
            timeout_delete: env_duration_secs("HCLOUD_TIMEOUT_DELETE", defaults.timeout_delete),
            timeout_image_wait: env_duration_secs(
                "HCLOUD_TIMEOUT_IMAGE_WAIT",
                defaults.timeout_image_wait,
            ),
            timeout_server_ip: env_duration_secs(
                "HCLOUD_TIMEOUT_SERVER_IP",
                defaults.timeout_server_ip,
            ),
            retry: RetryConfig::from_env(),
            ssh_public_key: std::env::var("HCLOUD_SSH_PUBLIC_KEY").unwrap_or_default(),
        }
    }
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_duration_like(&v))
        .unwrap_or(default)
}

/// Parses either a bare integer (seconds) or a Go-style duration suffix
/// (`10m`, `5m`, `15m`), matching the `"10m"`/`"5m"` style defaults named in
/// spec §6.
fn parse_duration_like(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(mins) = s.strip_suffix('m') {
        return mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minute_suffix() {
        assert_eq!(parse_duration_like("10m"), Some(Duration::from_secs(600)));
    }

    #[test]
    fn parses_bare_seconds() {
        assert_eq!(parse_duration_like("30"), Some(Duration::from_secs(30)));
    }

    #[test]
    fn defaults_match_spec() {
        let config = RuntimeConfig::default();
        assert_eq!(config.timeout_server_create, Duration::from_secs(600));
        assert_eq!(config.timeout_image_wait, Duration::from_secs(900));
    }
}
