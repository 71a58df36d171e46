// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 15;
const DEFAULT_COMPENSATING_ATTEMPTS: u32 = 60;
const DEFAULT_COMPENSATING_INTERVAL_MILLIS: u64 = 500;
const DEFAULT_OUTBOX_BATCH_SIZE: usize = 20;

/// Cluster store-and-forward configuration.
#[derive(Debug, Clone)]
pub struct CsafConfig {
    /// Name of this node, recorded on every session registered here.
    pub nodename: String,
    /// Delivery attempts an outbox message gets before it is dead-lettered.
    pub max_delivery_attempts: u32,
    /// How many times a compensating transaction is tried before the session is given up.
    pub compensating_attempts: u32,
    /// Pause between compensating attempts.
    pub compensating_interval: Duration,
    /// Messages fetched from the outbox per round.
    pub outbox_batch_size: usize,
}

impl CsafConfig {
    /// Configuration with defaults for everything but the node name.
    pub fn new(nodename: impl Into<String>) -> Self {
        Self {
            nodename: nodename.into(),
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            compensating_attempts: DEFAULT_COMPENSATING_ATTEMPTS,
            compensating_interval: Duration::from_millis(DEFAULT_COMPENSATING_INTERVAL_MILLIS),
            outbox_batch_size: DEFAULT_OUTBOX_BATCH_SIZE,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `MATS_CSAF_NODENAME`: name of this node in the cluster
    ///
    /// Optional (with defaults):
    /// - `MATS_CSAF_MAX_DELIVERY_ATTEMPTS` (default: 15)
    /// - `MATS_CSAF_COMPENSATING_ATTEMPTS` (default: 60)
    /// - `MATS_CSAF_COMPENSATING_INTERVAL_MILLIS` (default: 500)
    pub fn from_env() -> Result<Self, ConfigError> {
        let nodename = std::env::var("MATS_CSAF_NODENAME")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .ok_or(ConfigError::Missing("MATS_CSAF_NODENAME"))?;

        let max_delivery_attempts = positive("MATS_CSAF_MAX_DELIVERY_ATTEMPTS", DEFAULT_MAX_DELIVERY_ATTEMPTS)?;
        let compensating_attempts = positive("MATS_CSAF_COMPENSATING_ATTEMPTS", DEFAULT_COMPENSATING_ATTEMPTS)?;

        let compensating_interval: u64 = std::env::var("MATS_CSAF_COMPENSATING_INTERVAL_MILLIS")
            .unwrap_or_else(|_| DEFAULT_COMPENSATING_INTERVAL_MILLIS.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "MATS_CSAF_COMPENSATING_INTERVAL_MILLIS",
                    "must be a non-negative integer",
                )
            })?;

        Ok(Self {
            nodename,
            max_delivery_attempts,
            compensating_attempts,
            compensating_interval: Duration::from_millis(compensating_interval),
            outbox_batch_size: DEFAULT_OUTBOX_BATCH_SIZE,
        })
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts.max(1);
        self
    }

    pub fn with_compensating(mut self, attempts: u32, interval: Duration) -> Self {
        self.compensating_attempts = attempts.max(1);
        self.compensating_interval = interval;
        self
    }

    pub fn with_outbox_batch_size(mut self, batch_size: usize) -> Self {
        self.outbox_batch_size = batch_size.max(1);
        self
    }
}

fn positive(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<u32>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError::Invalid(key, "must be a positive integer")),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 4] = [
        "MATS_CSAF_NODENAME",
        "MATS_CSAF_MAX_DELIVERY_ATTEMPTS",
        "MATS_CSAF_COMPENSATING_ATTEMPTS",
        "MATS_CSAF_COMPENSATING_INTERVAL_MILLIS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in KEYS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("MATS_CSAF_NODENAME", "node-a");

        let config = CsafConfig::from_env().unwrap();

        assert_eq!(config.nodename, "node-a");
        assert_eq!(config.max_delivery_attempts, 15);
        assert_eq!(config.compensating_attempts, 60);
        assert_eq!(config.compensating_interval, Duration::from_millis(500));
        assert_eq!(config.outbox_batch_size, 20);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("MATS_CSAF_NODENAME", "node-b");
        guard.set("MATS_CSAF_MAX_DELIVERY_ATTEMPTS", "3");
        guard.set("MATS_CSAF_COMPENSATING_ATTEMPTS", "5");
        guard.set("MATS_CSAF_COMPENSATING_INTERVAL_MILLIS", "0");

        let config = CsafConfig::from_env().unwrap();

        assert_eq!(config.max_delivery_attempts, 3);
        assert_eq!(config.compensating_attempts, 5);
        assert_eq!(config.compensating_interval, Duration::ZERO);
    }

    #[test]
    fn test_config_missing_nodename() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("MATS_CSAF_NODENAME", "  ");

        let err = CsafConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("MATS_CSAF_NODENAME")));
    }

    #[test]
    fn test_config_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("MATS_CSAF_NODENAME", "node-c");
        guard.set("MATS_CSAF_MAX_DELIVERY_ATTEMPTS", "0");

        let err = CsafConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("MATS_CSAF_MAX_DELIVERY_ATTEMPTS", _)));

        guard.set("MATS_CSAF_MAX_DELIVERY_ATTEMPTS", "4");
        guard.set("MATS_CSAF_COMPENSATING_INTERVAL_MILLIS", "soon");
        let err = CsafConfig::from_env().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for MATS_CSAF_COMPENSATING_INTERVAL_MILLIS: must be a non-negative integer"
        );
    }

    #[test]
    fn test_builder_setters_clamp_to_one() {
        let config = CsafConfig::new("node")
            .with_max_delivery_attempts(0)
            .with_compensating(0, Duration::from_millis(5))
            .with_outbox_batch_size(0);

        assert_eq!(config.max_delivery_attempts, 1);
        assert_eq!(config.compensating_attempts, 1);
        assert_eq!(config.compensating_interval, Duration::from_millis(5));
        assert_eq!(config.outbox_batch_size, 1);
    }
}
