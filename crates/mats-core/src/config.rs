// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Factory configuration, from code or from environment variables.

use std::time::Duration;

const DEFAULT_DESTINATION_PREFIX: &str = "mats.";
const DEFAULT_TRACE_KEY: &str = "mats:trace";
const DEFAULT_GRACEFUL_SHUTDOWN_MILLIS: u64 = 7500;

/// Settings shared by every endpoint, stage and initiator of one factory.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Name of the factory, shows up in thread names and logs.
    pub name: String,
    pub app_name: String,
    pub app_version: String,
    /// Identifies this node (host) in debug info of outgoing calls.
    pub nodename: String,
    /// Prepended to every stage id to form the broker destination name.
    pub destination_prefix: String,
    /// Map-message key holding the serialized trace; `<key>:meta` holds its encoding.
    pub trace_key: String,
    /// Default number of processors per stage.
    pub concurrency: usize,
    /// Phase 1 budget when stopping stages.
    pub graceful_shutdown: Duration,
    /// Lower bound of the randomized backoff after a session crash.
    pub chill_wait: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            name: "MatsFactory".to_string(),
            app_name: "mats-app".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            nodename: default_nodename(),
            destination_prefix: DEFAULT_DESTINATION_PREFIX.to_string(),
            trace_key: DEFAULT_TRACE_KEY.to_string(),
            concurrency: default_concurrency(),
            graceful_shutdown: Duration::from_millis(DEFAULT_GRACEFUL_SHUTDOWN_MILLIS),
            chill_wait: Duration::from_millis(4500),
        }
    }
}

impl FactoryConfig {
    /// Load configuration from environment variables.
    ///
    /// All optional (with defaults):
    /// - `MATS_FACTORY_NAME` (default: `MatsFactory`)
    /// - `MATS_APP_NAME` (default: `mats-app`)
    /// - `MATS_APP_VERSION` (default: crate version)
    /// - `MATS_NODENAME` (default: `HOSTNAME`, else `localhost`)
    /// - `MATS_DESTINATION_PREFIX` (default: `mats.`)
    /// - `MATS_TRACE_KEY` (default: `mats:trace`)
    /// - `MATS_CONCURRENCY`: processors per stage (default: 2 x available parallelism)
    /// - `MATS_GRACEFUL_SHUTDOWN_MILLIS` (default: 7500)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let concurrency = match std::env::var("MATS_CONCURRENCY") {
            Ok(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid(
                        "MATS_CONCURRENCY",
                        "must be a positive integer",
                    ));
                }
            },
            Err(_) => defaults.concurrency,
        };

        let graceful_shutdown = match std::env::var("MATS_GRACEFUL_SHUTDOWN_MILLIS") {
            Ok(raw) => Duration::from_millis(raw.parse().map_err(|_| {
                ConfigError::Invalid(
                    "MATS_GRACEFUL_SHUTDOWN_MILLIS",
                    "must be a non-negative integer",
                )
            })?),
            Err(_) => defaults.graceful_shutdown,
        };

        let trace_key = std::env::var("MATS_TRACE_KEY").unwrap_or(defaults.trace_key);
        if trace_key.is_empty() {
            return Err(ConfigError::Invalid("MATS_TRACE_KEY", "must not be empty"));
        }

        Ok(Self {
            name: std::env::var("MATS_FACTORY_NAME").unwrap_or(defaults.name),
            app_name: std::env::var("MATS_APP_NAME").unwrap_or(defaults.app_name),
            app_version: std::env::var("MATS_APP_VERSION").unwrap_or(defaults.app_version),
            nodename: std::env::var("MATS_NODENAME").unwrap_or(defaults.nodename),
            destination_prefix: std::env::var("MATS_DESTINATION_PREFIX")
                .unwrap_or(defaults.destination_prefix),
            trace_key,
            concurrency,
            graceful_shutdown,
            chill_wait: defaults.chill_wait,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_app(mut self, app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self.app_version = app_version.into();
        self
    }

    pub fn with_nodename(mut self, nodename: impl Into<String>) -> Self {
        self.nodename = nodename.into();
        self
    }

    pub fn with_destination_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.destination_prefix = prefix.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_graceful_shutdown(mut self, graceful: Duration) -> Self {
        self.graceful_shutdown = graceful;
        self
    }

    pub fn with_chill_wait(mut self, chill_wait: Duration) -> Self {
        self.chill_wait = chill_wait;
        self
    }

    /// Key of the map-message entry carrying the trace encoding metadata.
    pub fn trace_meta_key(&self) -> String {
        format!("{}:meta", self.trace_key)
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

fn default_nodename() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
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

    const ALL_VARS: &[&str] = &[
        "MATS_FACTORY_NAME",
        "MATS_APP_NAME",
        "MATS_APP_VERSION",
        "MATS_NODENAME",
        "MATS_DESTINATION_PREFIX",
        "MATS_TRACE_KEY",
        "MATS_CONCURRENCY",
        "MATS_GRACEFUL_SHUTDOWN_MILLIS",
    ];

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_VARS {
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
        let _guard = EnvGuard::clean();

        let config = FactoryConfig::from_env().unwrap();

        assert_eq!(config.name, "MatsFactory");
        assert_eq!(config.destination_prefix, "mats.");
        assert_eq!(config.trace_key, "mats:trace");
        assert_eq!(config.trace_meta_key(), "mats:trace:meta");
        assert_eq!(config.graceful_shutdown, Duration::from_millis(7500));
        assert!(config.concurrency >= 2);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("MATS_FACTORY_NAME", "OrderFactory");
        guard.set("MATS_APP_NAME", "orders");
        guard.set("MATS_APP_VERSION", "3.1.4");
        guard.set("MATS_NODENAME", "node-7");
        guard.set("MATS_DESTINATION_PREFIX", "acme.");
        guard.set("MATS_TRACE_KEY", "acme:trace");
        guard.set("MATS_CONCURRENCY", "5");
        guard.set("MATS_GRACEFUL_SHUTDOWN_MILLIS", "250");

        let config = FactoryConfig::from_env().unwrap();

        assert_eq!(config.name, "OrderFactory");
        assert_eq!(config.app_name, "orders");
        assert_eq!(config.app_version, "3.1.4");
        assert_eq!(config.nodename, "node-7");
        assert_eq!(config.destination_prefix, "acme.");
        assert_eq!(config.trace_meta_key(), "acme:trace:meta");
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.graceful_shutdown, Duration::from_millis(250));
    }

    #[test]
    fn test_config_invalid_concurrency() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("MATS_CONCURRENCY", "0");
        let err = FactoryConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("MATS_CONCURRENCY", _)));

        guard.set("MATS_CONCURRENCY", "many");
        let err = FactoryConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("MATS_CONCURRENCY", _)));
    }

    #[test]
    fn test_config_invalid_shutdown_millis() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("MATS_GRACEFUL_SHUTDOWN_MILLIS", "-1");
        let err = FactoryConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("MATS_GRACEFUL_SHUTDOWN_MILLIS", _)
        ));
    }

    #[test]
    fn test_config_empty_trace_key_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("MATS_TRACE_KEY", "");
        assert!(FactoryConfig::from_env().is_err());
    }

    #[test]
    fn test_builder_setters() {
        let config = FactoryConfig::default()
            .with_name("F")
            .with_app("app", "1.0")
            .with_concurrency(0)
            .with_chill_wait(Duration::from_millis(10));
        assert_eq!(config.name, "F");
        assert_eq!(config.app_version, "1.0");
        assert_eq!(config.concurrency, 1, "concurrency is clamped to at least one");
        assert_eq!(config.chill_wait, Duration::from_millis(10));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
