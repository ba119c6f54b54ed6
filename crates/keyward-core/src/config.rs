//! Tunables for the machine and the sync driver.

use std::time::Duration;

/// Crypto machine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// One-time keys generated per upload batch
    pub one_time_keys_per_upload: usize,

    /// Upload a new batch when the server reports fewer unclaimed keys than
    /// this
    pub one_time_key_threshold: u64,

    /// Own megolm ciphertexts remembered for resolving sync echoes
    pub echo_cache_capacity: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self { one_time_keys_per_upload: 4, one_time_key_threshold: 2, echo_cache_capacity: 256 }
    }
}

/// Sync driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Long-poll timeout passed to the server
    pub timeout: Duration,

    /// First backoff after a transient failure
    pub initial_backoff: Duration,

    /// Backoff ceiling
    pub max_backoff: Duration,

    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_consecutive_failures: None,
        }
    }
}

impl SyncConfig {
    /// Backoff after `failures` consecutive failures (1-based), doubling
    /// from `initial_backoff` and capped at `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << shift).min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let config = SyncConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(700),
            ..SyncConfig::default()
        };

        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(700));
        assert_eq!(config.backoff(40), Duration::from_millis(700));
    }
}
