// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster store-and-forward: the store abstraction and its backends.
//!
//! A session is registered at exactly one node at a time. Messages for the
//! client are stored in the session's outbox by whichever node produces them,
//! and forwarded by the node holding the live connection. Incoming client
//! message ids are recorded in the inbox to detect double deliveries, and
//! server-to-client requests leave a correlation behind to route the reply.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Number of partitions the inbox, outbox and request tables are split over.
pub const SHARD_COUNT: usize = 7;

/// Partition of a session's box rows.
pub fn shard_for(session_id: &str) -> usize {
    let digest = Sha256::digest(session_id.as_bytes());
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    head as usize % SHARD_COUNT
}

/// Kind of a MatsSocket envelope, as stored in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Send,
    Request,
    Resolve,
    Reject,
    Ack,
    Nack,
    Retry,
    Pub,
}

impl MessageType {
    /// Returns the string representation of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "SEND",
            Self::Request => "REQUEST",
            Self::Resolve => "RESOLVE",
            Self::Reject => "REJECT",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Retry => "RETRY",
            Self::Pub => "PUB",
        }
    }

    /// Parse a type from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "SEND" => Self::Send,
            "REQUEST" => Self::Request,
            "RESOLVE" => Self::Resolve,
            "REJECT" => Self::Reject,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "RETRY" => Self::Retry,
            "PUB" => Self::Pub,
            _ => return None,
        })
    }
}

/// The node and connection a session is currently registered at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentNode {
    pub nodename: String,
    pub connection_id: String,
}

/// What the client told about itself when the session was (re)registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client library name and version, e.g. `MatsSocket.js,v0.10.0`.
    pub client_lib: String,
    pub app_name: String,
    pub app_version: String,
}

impl ClientInfo {
    pub fn new(
        client_lib: impl Into<String>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            client_lib: client_lib.into(),
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// A session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsafSession {
    pub session_id: String,
    pub user_id: String,
    /// Empty when the session is not registered at any node.
    pub nodename: Option<String>,
    pub connection_id: Option<String>,
    pub client: ClientInfo,
    /// When the session was first registered; survives reconnects.
    pub created_at: DateTime<Utc>,
    pub liveliness_at: DateTime<Utc>,
}

/// Filter for [`ClusterStoreAndForward::get_sessions`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Only sessions currently registered at a node.
    pub only_active: bool,
    pub user_id: Option<String>,
    pub app_name: Option<String>,
    /// Lexicographic lower bound on the application version.
    pub app_version_at_or_above: Option<String>,
}

impl SessionFilter {
    pub fn active() -> Self {
        Self {
            only_active: true,
            ..Default::default()
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn app(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn app_version_at_or_above(mut self, version: impl Into<String>) -> Self {
        self.app_version_at_or_above = Some(version.into());
        self
    }

    pub(crate) fn matches(&self, session: &CsafSession) -> bool {
        (!self.only_active || session.nodename.is_some())
            && self.user_id.as_deref().is_none_or(|u| session.user_id == u)
            && self.app_name.as_deref().is_none_or(|a| session.client.app_name == a)
            && self
                .app_version_at_or_above
                .as_deref()
                .is_none_or(|v| session.client.app_version.as_str() >= v)
    }
}

/// An inbox row: a client message id, plus the answer given to it if that was
/// anything but a plain acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInMessage {
    pub session_id: String,
    pub client_message_id: String,
    pub stored_at: DateTime<Utc>,
    pub full_envelope: Option<String>,
    pub message_binary: Option<Vec<u8>>,
}

/// A message to put in a session's outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub session_id: String,
    /// Unique within the session.
    pub server_message_id: String,
    /// Set when this answers a client request.
    pub client_message_id: Option<String>,
    pub trace_id: String,
    pub message_type: MessageType,
    /// The serialized envelope, without the message body.
    pub envelope: String,
    pub message_text: Option<String>,
    pub message_binary: Option<Vec<u8>>,
}

/// An outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOutMessage {
    pub message: OutboxMessage,
    pub stored_at: DateTime<Utc>,
    /// Set while a delivery attempt is outstanding.
    pub attempt_at: Option<DateTime<Utc>>,
    /// Number of times the message was marked attempted; never reset.
    pub delivery_count: u32,
}

impl StoredOutMessage {
    pub fn server_message_id(&self) -> &str {
        &self.message.server_message_id
    }
}

/// Where the reply to a server-to-client request shall go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCorrelation {
    pub session_id: String,
    pub server_message_id: String,
    pub requested_at: DateTime<Utc>,
    pub reply_terminator_id: String,
    pub correlation_text: Option<String>,
    pub correlation_binary: Option<Vec<u8>>,
}

/// Cluster-wide store of sessions and their message boxes.
///
/// Each backend instance acts on behalf of one node ([`Self::nodename`]).
/// Outbox consumption for a session is assumed to happen from the node holding
/// its live connection, while any node may produce into any outbox.
#[async_trait]
pub trait ClusterStoreAndForward: Send + Sync {
    /// The node this store registers sessions at.
    fn nodename(&self) -> &str;

    // ---------- Sessions ----------

    /// Registers the session at this node with the given connection, returning
    /// the session's original creation time.
    ///
    /// Last writer wins, but only for the user that created the session: any
    /// other user gets [`CsafError::WrongUser`](crate::CsafError::WrongUser) and
    /// the stored registration is left untouched.
    async fn register_session_at_this_node(
        &self,
        session_id: &str,
        user_id: &str,
        connection_id: &str,
        client: &ClientInfo,
    ) -> Result<DateTime<Utc>>;

    /// Clears the session's node, but only if it is still registered at this
    /// node with `connection_id`; a stale deregister is a no-op.
    async fn deregister_session_from_this_node(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<()>;

    async fn get_current_registered_node_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CurrentNode>>;

    /// Whether the session exists, registered at a node or not.
    async fn is_session_exists(&self, session_id: &str) -> Result<bool>;

    /// Bumps the liveliness timestamp of the given sessions.
    async fn notify_session_liveliness(&self, session_ids: &[String]) -> Result<()>;

    /// Removes the session along with everything in its boxes.
    async fn close_session(&self, session_id: &str) -> Result<()>;

    async fn get_sessions(&self, filter: &SessionFilter) -> Result<Vec<CsafSession>>;

    async fn get_sessions_count(&self, filter: &SessionFilter) -> Result<usize>;

    // ---------- Inbox ----------

    /// Records an incoming client message id. Fails with
    /// [`CsafError::ClientMessageIdAlreadyExists`](crate::CsafError::ClientMessageIdAlreadyExists)
    /// on a double delivery.
    async fn store_message_id_in_inbox(&self, session_id: &str, client_message_id: &str)
    -> Result<()>;

    /// Stores the answer given to an incoming message, for replay on double deliveries.
    async fn update_message_in_inbox(
        &self,
        session_id: &str,
        client_message_id: &str,
        full_envelope: Option<&str>,
        message_binary: Option<&[u8]>,
    ) -> Result<()>;

    async fn get_message_from_inbox(
        &self,
        session_id: &str,
        client_message_id: &str,
    ) -> Result<Option<StoredInMessage>>;

    /// Forgets client message ids the client will never send again.
    async fn delete_message_ids_from_inbox(
        &self,
        session_id: &str,
        client_message_ids: &[String],
    ) -> Result<()>;

    // ---------- Outbox ----------

    /// Stores the message and returns where the session is registered, so the
    /// caller can nudge that node. A message for a session that does not exist
    /// is dropped and `None` returned.
    async fn store_message_in_outbox(&self, message: &OutboxMessage) -> Result<Option<CurrentNode>>;

    /// Up to `max` messages in stored order, excluding those with an
    /// outstanding delivery attempt and those dead-lettered.
    async fn get_messages_from_outbox(
        &self,
        session_id: &str,
        max: usize,
    ) -> Result<Vec<StoredOutMessage>>;

    /// Marks the messages attempted and bumps their delivery count.
    async fn outbox_messages_attempted_delivery(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()>;

    /// Clears every attempt mark of the session; delivery counts stay.
    async fn outbox_messages_unmark_attempted_delivery(&self, session_id: &str) -> Result<()>;

    /// Clears the attempt marks of just these messages; delivery counts stay.
    async fn outbox_messages_unmark_attempted_delivery_ids(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()>;

    /// The messages are delivered; removes them.
    async fn outbox_messages_complete(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()>;

    /// The messages overran their delivery budget; they are kept but never fetched again.
    async fn outbox_messages_dead_letter_queue(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()>;

    // ---------- Request correlations ----------

    async fn store_request_correlation(&self, correlation: &RequestCorrelation) -> Result<()>;

    /// Returns and removes the correlation; a second call for the same reply yields `None`.
    async fn get_and_delete_request_correlation(
        &self,
        session_id: &str,
        server_message_id: &str,
    ) -> Result<Option<RequestCorrelation>>;
}

/// Milliseconds since the epoch to a timestamp, as stored by the SQL backend.
pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Current time truncated to milliseconds, so stored and returned values agree.
pub(crate) fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}
