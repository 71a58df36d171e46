// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for mats-websocket integration tests.
//!
//! A [`Cluster`] is two node handles on one store, so tests can move sessions
//! between nodes. [`backend_tests!`] runs one async scenario against every backend.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use mats_websocket::{
    ClientInfo, ClusterStoreAndForward, CsafConfig, InMemoryStore, MessageType, OutboxMessage,
    SqliteStore, migrations,
};

pub const NODE_A: &str = "node-a";
pub const NODE_B: &str = "node-b";

/// Routes tracing output through the test harness. `RUST_LOG` selects levels.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create an in-memory SQLite pool with the schema applied.
pub async fn sqlite_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Two nodes sharing one store.
pub struct Cluster {
    pub node_a: Arc<dyn ClusterStoreAndForward>,
    pub node_b: Arc<dyn ClusterStoreAndForward>,
}

pub fn memory_cluster() -> Cluster {
    init_tracing();
    let store = InMemoryStore::new(NODE_A);
    Cluster {
        node_b: Arc::new(store.for_node(NODE_B)),
        node_a: Arc::new(store),
    }
}

pub async fn sqlite_cluster() -> Cluster {
    init_tracing();
    let pool = sqlite_pool().await;
    Cluster {
        node_a: Arc::new(SqliteStore::new(pool.clone(), NODE_A)),
        node_b: Arc::new(SqliteStore::new(pool, NODE_B)),
    }
}

pub fn client() -> ClientInfo {
    ClientInfo::new("MatsSocket.rs,v0.9", "shop", "1.2.0")
}

/// Config with tight compensating retries.
pub fn test_config() -> CsafConfig {
    CsafConfig::new(NODE_A)
        .with_max_delivery_attempts(3)
        .with_compensating(3, Duration::from_millis(1))
}

pub fn outbox_message(session_id: &str, server_message_id: &str) -> OutboxMessage {
    OutboxMessage {
        session_id: session_id.to_string(),
        server_message_id: server_message_id.to_string(),
        client_message_id: None,
        trace_id: format!("trace-{server_message_id}"),
        message_type: MessageType::Send,
        envelope: r#"{"t":"SEND","eid":"Client.terminator"}"#.to_string(),
        message_text: Some(format!(r#"{{"id":"{server_message_id}"}}"#)),
        message_binary: None,
    }
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

/// Generates one `#[tokio::test]` per backend for each listed scenario
/// `async fn(Cluster)`. Pull it in with `#[macro_use] mod common;`.
macro_rules! backend_tests {
    ($($scenario:ident),* $(,)?) => {
        $(
            mod $scenario {
                #[tokio::test]
                async fn in_memory() {
                    super::$scenario(super::common::memory_cluster()).await;
                }

                #[tokio::test]
                async fn sqlite() {
                    super::$scenario(super::common::sqlite_cluster().await).await;
                }
            }
        )*
    };
}
