// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mats Core - Transactional Message-Based RPC
//!
//! This crate lets services talk to each other by request/reply over a message
//! broker while their code reads like a sequence of method calls. Every message
//! carries a *call trace* holding the call history, a stack of reply addresses
//! and a per-level state, so stages are stateless and any node can process any
//! message of a flow.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  request   ┌────────────────────────────────────────┐
//! │   MatsInitiator  │───────────►│ Endpoint "Svc"                         │
//! │  (outside flows) │            │  ┌────────┐  next  ┌──────────────┐    │
//! └──────────────────┘            │  │ Svc    │───────►│ Svc.stage1   │    │
//!          ▲                      │  └───┬────┘        └──────┬───────┘    │
//!          │                      │      │ request            │ reply      │
//!          │                      └──────┼────────────────────┼────────────┘
//!          │                             ▼                    │
//!          │                      ┌─────────────┐             │
//!          │                      │ Endpoint    │── reply ───►│ (pops stack)
//!          │                      │ "Leaf"      │
//!          │                      └─────────────┘
//!          │          reply (stack empty → replyTo of the initiation)
//!          └──────────────────── Terminator ◄──────────────────────────────
//! ```
//!
//! # Transactions
//!
//! Each stage invocation, and each initiation, runs in one transaction that
//! spans the broker session and an optional [`ExternalResource`]. Receive,
//! resource work and all outgoing messages commit together, or the received
//! message is rolled back for redelivery. A lambda that returns
//! [`ProcessContext::refuse`]'s error sends the message straight to the
//! dead-letter queue instead.
//!
//! # Call Types
//!
//! | Call | Stack effect | Typical origin |
//! |------|--------------|----------------|
//! | `REQUEST` | pushes the caller's state and the reply address | `ctx.request`, `init.request` |
//! | `SEND` | none | `init.send` |
//! | `NEXT` | replaces the state at the current level | `ctx.next` |
//! | `REPLY` | pops one level | `ctx.reply`, last stage return value |
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MATS_FACTORY_NAME` | `MatsFactory` | Factory name in thread names and logs |
//! | `MATS_APP_NAME` | `mats-app` | Application name in call debug info |
//! | `MATS_APP_VERSION` | crate version | Application version in call debug info |
//! | `MATS_NODENAME` | `HOSTNAME` | Node name in call debug info |
//! | `MATS_DESTINATION_PREFIX` | `mats.` | Prefix of every broker destination |
//! | `MATS_TRACE_KEY` | `mats:trace` | Map-message key of the serialized trace |
//! | `MATS_CONCURRENCY` | 2 x cores | Processors per stage |
//! | `MATS_GRACEFUL_SHUTDOWN_MILLIS` | `7500` | Budget for stages to finish in-flight work |
//!
//! # Modules
//!
//! - [`trace`]: the call trace and its state stack
//! - [`serializer`]: trace and DTO serialization
//! - [`broker`]: broker abstraction and an in-process broker
//! - [`transaction`]: transaction manager and external resources
//! - [`stash`]: binary stash of a stage context for later resumption
//! - [`factory`]: endpoints, stages, initiators and their lifecycle

/// Factory configuration loaded from code or environment variables.
pub mod config;

/// Error types with error code mapping.
pub mod error;

/// Call trace: calls, the reply stack and per-level state.
pub mod trace;

/// Trace and DTO serialization.
pub mod serializer;

/// Message broker abstraction and the in-process broker.
pub mod broker;

/// Transaction manager spanning the broker session and an external resource.
pub mod transaction;

/// Binary stash format for resuming a stage from outside a flow.
pub mod stash;

mod envelope;

/// Stage lambda context: replies, requests, next, side-loads.
pub mod context;

/// Initiation of new flows.
pub mod initiate;

/// Stages and their processor threads.
pub mod stage;

/// Endpoints and the endpoint builder.
pub mod endpoint;

/// Factory owning endpoints and initiators.
pub mod factory;

pub use broker::{InMemoryBroker, MessageBroker};
pub use config::{ConfigError, FactoryConfig};
pub use context::{NoReply, ProcessContext};
pub use endpoint::{EndpointBuilder, MatsEndpoint};
pub use error::{InitiateError, MatsError, RefuseMessage, TransactionError};
pub use factory::{MatsFactory, MatsFactoryBuilder};
pub use initiate::{MatsInitiate, MatsInitiator, MessageReference};
pub use stage::{MatsStage, ProcessorState};
pub use trace::{KeepTrace, Trace};
pub use transaction::{ExternalResource, InMemoryKeyValueStore, KeyValueTransaction};
