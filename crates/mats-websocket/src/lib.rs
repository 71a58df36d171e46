// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster store-and-forward for the Mats WebSocket gateway.
//!
//! A client session may be connected to any node of a cluster, and may move
//! between nodes when it reconnects. This crate keeps what must survive such
//! moves in a shared store:
//!
//! ```text
//! ┌──────────────┐ register / deregister ┌──────────────────────────────┐
//! │  node A      │──────────────────────▶│ ClusterStoreAndForward       │
//! │  (live conn) │◀── OutboxForwarder ───│  sessions                    │
//! └──────────────┘                       │  inbox    (client msg ids)   │
//! ┌──────────────┐ store_message_in_     │  outbox   (server → client)  │
//! │  node B      │──── outbox ──────────▶│  requests (correlations)     │
//! └──────────────┘                       └──────────────────────────────┘
//! ```
//!
//! - [`ClusterStoreAndForward`] is the store contract, with [`InMemoryStore`]
//!   and [`SqliteStore`] backends.
//! - [`OutboxForwarder`] runs the delivery-attempt protocol towards the
//!   client through a [`ClientDelivery`] sink, dead-lettering messages that
//!   exhaust their delivery budget.
//! - [`IncomingHandler`] makes processing of client messages idempotent and
//!   compensates its bookkeeping when processing fails.
//!
//! # Configuration
//!
//! [`CsafConfig::from_env`] reads:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `MATS_CSAF_NODENAME` | required |
//! | `MATS_CSAF_MAX_DELIVERY_ATTEMPTS` | 15 |
//! | `MATS_CSAF_COMPENSATING_ATTEMPTS` | 60 |
//! | `MATS_CSAF_COMPENSATING_INTERVAL_MILLIS` | 500 |

pub mod config;
pub mod error;
pub mod forwarder;
pub mod incoming;
pub mod migrations;
pub mod store;

pub use config::{ConfigError, CsafConfig};
pub use error::{CsafError, Result};
pub use forwarder::{ClientDelivery, ForwardReport, OutboxForwarder};
pub use incoming::{HandledReply, IncomingError, IncomingHandler, IncomingMessage, IncomingOutcome};
pub use store::{
    ClientInfo, ClusterStoreAndForward, CsafSession, CurrentNode, InMemoryStore, MessageType,
    OutboxMessage, RequestCorrelation, SessionFilter, SqliteStore, StoredInMessage,
    StoredOutMessage,
};
