#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Configuration for realtime client behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

/// Configuration for automatic reconnection behavior.
///
/// Delays grow as `base_delay * multiplier^(attempt - 1)`, capped at
/// `max_delay`, with no jitter. Reconnection stops after `max_attempts`
/// consecutive failures; a successful connection resets the budget.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.base_delay)
            .with_max_interval(config.max_delay)
            .with_multiplier(config.multiplier)
            // Deterministic delays; attempt bounding is handled separately
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn backoff_sequence_doubles_from_base_delay() {
        let config = ReconnectConfig {
            base_delay: Duration::from_millis(100),
            ..ReconnectConfig::default()
        };
        let mut backoff: ExponentialBackoff = config.into();

        // No jitter: delay before attempt N is exactly base * 2^(N-1)
        for expected_ms in [100, 200, 400, 800, 1600] {
            let delay = backoff.next_backoff().expect("backoff should not expire");
            assert_eq!(delay, Duration::from_millis(expected_ms));
        }
    }

    #[test]
    fn backoff_reset_restores_base_delay() {
        let config = ReconnectConfig {
            base_delay: Duration::from_millis(100),
            ..ReconnectConfig::default()
        };
        let mut backoff: ExponentialBackoff = config.into();

        let _first = backoff.next_backoff();
        let _second = backoff.next_backoff();
        backoff.reset();

        let delay = backoff.next_backoff().expect("backoff should not expire");
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn backoff_respects_max_delay() {
        let config = ReconnectConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
            multiplier: 3.0,
            max_attempts: None,
        };
        let mut backoff: ExponentialBackoff = config.into();

        for _ in 0..10 {
            let _next = backoff.next_backoff();
        }

        let delay = backoff.next_backoff().expect("backoff should not expire");
        assert!(delay <= Duration::from_secs(2), "delay exceeded cap: {delay:?}");
    }

    #[test]
    fn default_allows_five_attempts() {
        let config = Config::default();
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.reconnect.base_delay, Duration::from_secs(1));
    }
}
