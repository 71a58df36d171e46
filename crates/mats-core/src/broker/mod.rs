// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker transport abstraction.
//!
//! The engine needs very little from a message broker: a transacted session
//! per processor, a blocking consumer on one destination, and sends that only
//! become visible when the session commits. Everything here is blocking; each
//! processor is an OS thread that owns its session exclusively.

mod memory;

pub use memory::{DLQ_PREFIX, InMemoryBroker};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BrokerError;
use crate::trace::MessagingModel;

/// Where a message goes: a broker destination name plus queue/topic semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub name: String,
    pub model: MessagingModel,
}

impl Destination {
    pub fn new(name: impl Into<String>, model: MessagingModel) -> Self {
        Self {
            name: name.into(),
            model,
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(name, MessagingModel::Queue)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, MessagingModel::Topic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageValue {
    Bytes(Vec<u8>),
    Text(String),
}

/// The envelope kind Mats messages travel in: named entries plus delivery flags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MapMessage {
    /// Broker-assigned id; empty until sent.
    pub message_id: String,
    entries: BTreeMap<String, MessageValue>,
    pub persistent: bool,
    /// 0-9; interactive flows go out with a higher priority.
    pub priority: u8,
    pub time_to_live: Option<Duration>,
    /// How many times this message was handed out before and rolled back.
    pub redelivery_count: u32,
}

impl MapMessage {
    pub fn new() -> Self {
        Self {
            persistent: true,
            priority: 4,
            ..Self::default()
        }
    }

    pub fn set_bytes(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.entries.insert(key.into(), MessageValue::Bytes(value));
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .insert(key.into(), MessageValue::Text(value.into()));
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(MessageValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(MessageValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &MessageValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Anything a consumer may receive. Only [`BrokerMessage::Map`] is a valid Mats envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMessage {
    Map(MapMessage),
    Text(String),
    Bytes(Vec<u8>),
}

impl BrokerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Map(_) => "MapMessage",
            Self::Text(_) => "TextMessage",
            Self::Bytes(_) => "BytesMessage",
        }
    }

    pub fn as_map(&self) -> Option<&MapMessage> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// How received-but-uncommitted messages are treated on rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackDisposition {
    /// Make them available again, subject to the broker's redelivery budget.
    Redeliver,
    /// Do not retry: route them straight to the dead-letter queue.
    Refuse,
}

/// Hands out transacted sessions.
pub trait MessageBroker: Send + Sync {
    fn create_session(&self) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// One transacted session. Every received message and every send is part of
/// the current transaction until `commit` or `rollback`.
pub trait BrokerSession: Send + Sync {
    fn create_consumer(&self, destination: &Destination) -> Result<Box<dyn BrokerConsumer>, BrokerError>;

    /// Stages `message` for delivery at commit. Returns the assigned message id.
    fn send(&self, destination: &Destination, message: MapMessage) -> Result<String, BrokerError>;

    fn commit(&self) -> Result<(), BrokerError>;

    fn rollback(&self, disposition: RollbackDisposition) -> Result<(), BrokerError>;

    /// Closes the session, rolling back any open transaction. Unblocks a pending receive.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

pub trait BrokerConsumer: Send {
    /// Blocks until a message arrives. `Ok(None)` means the session was closed.
    fn receive(&self) -> Result<Option<BrokerMessage>, BrokerError>;
}
