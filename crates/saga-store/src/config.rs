//! Store configuration loaded from environment variables.

use std::time::Duration;

/// Tuning for the compare-and-swap write path.
///
/// Reads from environment variables:
/// - `SAGA_STORE_MAX_ATTEMPTS` — CAS attempts per write (default: `5`)
/// - `SAGA_STORE_RETRY_BACKOFF_MS` — backoff step, multiplied by the attempt
///   number (default: `10`)
/// - `SAGA_STORE_STEP_TTL_SECS` — step-log expiry refreshed on every write,
///   `0` disables (default: `604800`, seven days)
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub step_ttl: Option<Duration>,
}

impl StoreConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: std::env::var("SAGA_STORE_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|attempts| *attempts > 0)
                .unwrap_or(defaults.max_attempts),
            retry_backoff: std::env::var("SAGA_STORE_RETRY_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            step_ttl: match std::env::var("SAGA_STORE_STEP_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
            {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.step_ttl,
            },
        }
    }

    /// Backoff to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff * attempt
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff: Duration::from_millis(10),
            step_ttl: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = StoreConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_backoff, Duration::from_millis(10));
        assert_eq!(config.step_ttl, Some(Duration::from_secs(604_800)));
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        let config = StoreConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_millis(10));
        assert_eq!(config.backoff_for(3), Duration::from_millis(30));
    }
}
