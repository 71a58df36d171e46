// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for mats-core integration tests.
//!
//! Provides [`Rig`] for setting up an in-memory broker, a factory on top of it
//! and channels for collecting what terminators receive.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};

use mats_core::{FactoryConfig, InMemoryBroker, InMemoryKeyValueStore, MatsFactory};

/// Upper bound for anything a test waits for.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub const SERVICE: &str = "Test.service";
pub const LEAF: &str = "Test.leaf";
pub const TERMINATOR: &str = "Test.terminator";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTO {
    pub number: f64,
    pub string: String,
}

impl DataTO {
    pub fn new(number: f64, string: &str) -> Self {
        Self {
            number,
            string: string.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateTO {
    pub number1: i32,
    pub number2: f64,
}

impl StateTO {
    pub fn new(number1: i32, number2: f64) -> Self {
        Self { number1, number2 }
    }
}

/// Routes tracing output through the test harness. `RUST_LOG` selects levels.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config(name: &str) -> FactoryConfig {
    FactoryConfig::default()
        .with_name(name)
        .with_app("mats-core-tests", "0.0.0")
        .with_concurrency(1)
        .with_graceful_shutdown(Duration::from_secs(2))
        .with_chill_wait(Duration::from_millis(50))
}

/// A factory on an in-memory broker, optionally with a key/value store as
/// external resource.
pub struct Rig {
    pub broker: Arc<InMemoryBroker>,
    pub store: Option<InMemoryKeyValueStore>,
    pub factory: MatsFactory,
}

impl Rig {
    pub fn new() -> Self {
        Self::build(Arc::new(InMemoryBroker::new()), None)
    }

    pub fn with_store() -> Self {
        Self::build(
            Arc::new(InMemoryBroker::new()),
            Some(InMemoryKeyValueStore::new()),
        )
    }

    pub fn with_broker(broker: Arc<InMemoryBroker>) -> Self {
        Self::build(broker, None)
    }

    pub fn build(broker: Arc<InMemoryBroker>, store: Option<InMemoryKeyValueStore>) -> Self {
        init_tracing();
        let mut builder = MatsFactory::builder()
            .broker(broker.clone())
            .config(test_config("test-factory"));
        if let Some(store) = &store {
            builder = builder.resource(Arc::new(store.clone()));
        }
        let factory = builder.build().expect("factory should build");
        Self {
            broker,
            store,
            factory,
        }
    }

    pub fn store(&self) -> &InMemoryKeyValueStore {
        self.store.as_ref().expect("rig was built without a store")
    }

    /// Starts the factory and waits until every stage is receiving.
    pub fn start(&self) {
        self.factory.start();
        assert!(
            self.factory.wait_for_receiving(TIMEOUT),
            "stages did not start receiving in time"
        );
    }

    pub fn stop(&self) -> bool {
        self.factory.stop(Duration::from_secs(5))
    }
}

pub fn collector<T>() -> (Sender<T>, Receiver<T>) {
    channel::unbounded()
}

/// Receives one item or fails the test.
pub fn expect_one<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(TIMEOUT)
        .expect("nothing arrived within the timeout")
}

/// Asserts that nothing arrives within `wait`.
pub fn expect_none<T: std::fmt::Debug>(rx: &Receiver<T>, wait: Duration) {
    if let Ok(item) = rx.recv_timeout(wait) {
        panic!("expected nothing, got {item:?}");
    }
}

/// Polls `check` until it holds or the timeout passes.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + TIMEOUT;
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
