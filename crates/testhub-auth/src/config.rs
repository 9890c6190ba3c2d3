//! Session timing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Assumed access-token lifetime when the token carries no readable expiry.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);
/// Tokens closer than this to expiry are refreshed by the poller.
pub const DEFAULT_REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);
/// How often the auto-refresh task checks the session.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_ttl: Duration,
    pub refresh_window: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Prefer the `exp` claim of a JWT access token over `token_ttl`
    pub trust_token_expiry: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl: DEFAULT_TOKEN_TTL,
            refresh_window: DEFAULT_REFRESH_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            trust_token_expiry: true,
        }
    }
}

impl AuthConfig {
    pub(crate) fn token_ttl_millis(&self) -> i64 {
        duration_millis(self.token_ttl)
    }

    pub(crate) fn refresh_window_millis(&self) -> i64 {
        duration_millis(self.refresh_window)
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthConfig::default();
        assert_eq!(config.token_ttl_millis(), 30 * 60 * 1000);
        assert_eq!(config.refresh_window_millis(), 5 * 60 * 1000);
        assert_eq!(config.poll_interval, Duration::from_secs(120));
        assert!(config.trust_token_expiry);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AuthConfig =
            serde_json::from_str(r#"{"trust_token_expiry": false}"#).unwrap();
        assert!(!config.trust_token_expiry);
        assert_eq!(config.token_ttl, DEFAULT_TOKEN_TTL);
    }
}
