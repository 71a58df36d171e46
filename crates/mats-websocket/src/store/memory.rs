// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store, shared by every node handle created from it.
//!
//! Meant for tests and single-process setups. Handles obtained through
//! [`InMemoryStore::for_node`] see the same sessions and boxes, which makes a
//! cluster of nodes easy to simulate.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::{
    ClientInfo, ClusterStoreAndForward, CsafSession, CurrentNode, OutboxMessage,
    RequestCorrelation, SessionFilter, StoredInMessage, StoredOutMessage, now,
};
use crate::error::{CsafError, Result};

type BoxKey = (String, String);

struct OutboxRow {
    stored: StoredOutMessage,
    dead_lettered_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tables {
    sessions: DashMap<String, CsafSession>,
    inbox: DashMap<BoxKey, StoredInMessage>,
    /// Rows per session in stored order.
    outbox: DashMap<String, Vec<OutboxRow>>,
    correlations: DashMap<BoxKey, RequestCorrelation>,
    failures: AtomicUsize,
}

/// [`ClusterStoreAndForward`] kept in process memory.
#[derive(Clone)]
pub struct InMemoryStore {
    nodename: String,
    tables: Arc<Tables>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("nodename", &self.nodename)
            .field("sessions", &self.tables.sessions.len())
            .finish()
    }
}

impl InMemoryStore {
    pub fn new(nodename: impl Into<String>) -> Self {
        Self {
            nodename: nodename.into(),
            tables: Arc::new(Tables::default()),
        }
    }

    /// A handle acting as another node on the same data.
    pub fn for_node(&self, nodename: impl Into<String>) -> Self {
        Self {
            nodename: nodename.into(),
            tables: self.tables.clone(),
        }
    }

    /// Makes the next `n` operations, on any node handle, fail with a data access error.
    pub fn fail_next_operations(&self, n: usize) {
        self.tables.failures.store(n, Ordering::SeqCst);
    }

    /// Messages of the session that were dead-lettered, in stored order.
    pub fn dead_letters(&self, session_id: &str) -> Vec<StoredOutMessage> {
        self.tables
            .outbox
            .get(session_id)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.dead_lettered_at.is_some())
                    .map(|row| row.stored.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check(&self, operation: &str) -> Result<()> {
        let failing = self
            .tables
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            debug!(operation, nodename = %self.nodename, "Injected store failure");
            return Err(CsafError::data_access(operation, "injected failure"));
        }
        Ok(())
    }

    fn current_node(session: &CsafSession) -> Option<CurrentNode> {
        match (&session.nodename, &session.connection_id) {
            (Some(nodename), Some(connection_id)) => Some(CurrentNode {
                nodename: nodename.clone(),
                connection_id: connection_id.clone(),
            }),
            _ => None,
        }
    }

    fn with_outbox_rows(
        &self,
        session_id: &str,
        server_message_ids: &[String],
        mut apply: impl FnMut(&mut OutboxRow),
    ) {
        if let Some(mut rows) = self.tables.outbox.get_mut(session_id) {
            for row in rows
                .iter_mut()
                .filter(|row| server_message_ids.contains(&row.stored.message.server_message_id))
            {
                apply(row);
            }
        }
    }
}

#[async_trait]
impl ClusterStoreAndForward for InMemoryStore {
    fn nodename(&self) -> &str {
        &self.nodename
    }

    async fn register_session_at_this_node(
        &self,
        session_id: &str,
        user_id: &str,
        connection_id: &str,
        client: &ClientInfo,
    ) -> Result<DateTime<Utc>> {
        self.check("register_session")?;
        let now = now();
        match self.tables.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                if session.user_id != user_id {
                    return Err(CsafError::WrongUser {
                        session_id: session_id.to_string(),
                        user_id: user_id.to_string(),
                    });
                }
                session.nodename = Some(self.nodename.clone());
                session.connection_id = Some(connection_id.to_string());
                session.client = client.clone();
                session.liveliness_at = now;
                Ok(session.created_at)
            }
            Entry::Vacant(entry) => {
                entry.insert(CsafSession {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    nodename: Some(self.nodename.clone()),
                    connection_id: Some(connection_id.to_string()),
                    client: client.clone(),
                    created_at: now,
                    liveliness_at: now,
                });
                Ok(now)
            }
        }
    }

    async fn deregister_session_from_this_node(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<()> {
        self.check("deregister_session")?;
        if let Some(mut session) = self.tables.sessions.get_mut(session_id)
            && session.nodename.as_deref() == Some(self.nodename.as_str())
            && session.connection_id.as_deref() == Some(connection_id)
        {
            session.nodename = None;
        }
        Ok(())
    }

    async fn get_current_registered_node_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CurrentNode>> {
        self.check("get_current_node")?;
        Ok(self
            .tables
            .sessions
            .get(session_id)
            .and_then(|session| Self::current_node(&session)))
    }

    async fn is_session_exists(&self, session_id: &str) -> Result<bool> {
        self.check("is_session_exists")?;
        Ok(self.tables.sessions.contains_key(session_id))
    }

    async fn notify_session_liveliness(&self, session_ids: &[String]) -> Result<()> {
        self.check("notify_session_liveliness")?;
        let now = now();
        for session_id in session_ids {
            if let Some(mut session) = self.tables.sessions.get_mut(session_id) {
                session.liveliness_at = now;
            }
        }
        Ok(())
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        self.check("close_session")?;
        self.tables.sessions.remove(session_id);
        self.tables.inbox.retain(|(session, _), _| session != session_id);
        self.tables.outbox.remove(session_id);
        self.tables
            .correlations
            .retain(|(session, _), _| session != session_id);
        Ok(())
    }

    async fn get_sessions(&self, filter: &SessionFilter) -> Result<Vec<CsafSession>> {
        self.check("get_sessions")?;
        let mut sessions: Vec<_> = self
            .tables
            .sessions
            .iter()
            .filter(|session| filter.matches(session))
            .map(|session| session.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn get_sessions_count(&self, filter: &SessionFilter) -> Result<usize> {
        self.check("get_sessions_count")?;
        Ok(self
            .tables
            .sessions
            .iter()
            .filter(|session| filter.matches(session))
            .count())
    }

    async fn store_message_id_in_inbox(
        &self,
        session_id: &str,
        client_message_id: &str,
    ) -> Result<()> {
        self.check("store_message_id_in_inbox")?;
        match self
            .tables
            .inbox
            .entry((session_id.to_string(), client_message_id.to_string()))
        {
            Entry::Occupied(_) => Err(CsafError::ClientMessageIdAlreadyExists {
                session_id: session_id.to_string(),
                client_message_id: client_message_id.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(StoredInMessage {
                    session_id: session_id.to_string(),
                    client_message_id: client_message_id.to_string(),
                    stored_at: now(),
                    full_envelope: None,
                    message_binary: None,
                });
                Ok(())
            }
        }
    }

    async fn update_message_in_inbox(
        &self,
        session_id: &str,
        client_message_id: &str,
        full_envelope: Option<&str>,
        message_binary: Option<&[u8]>,
    ) -> Result<()> {
        self.check("update_message_in_inbox")?;
        let key = (session_id.to_string(), client_message_id.to_string());
        if let Some(mut stored) = self.tables.inbox.get_mut(&key) {
            stored.full_envelope = full_envelope.map(str::to_string);
            stored.message_binary = message_binary.map(<[u8]>::to_vec);
        }
        Ok(())
    }

    async fn get_message_from_inbox(
        &self,
        session_id: &str,
        client_message_id: &str,
    ) -> Result<Option<StoredInMessage>> {
        self.check("get_message_from_inbox")?;
        let key = (session_id.to_string(), client_message_id.to_string());
        Ok(self.tables.inbox.get(&key).map(|stored| stored.value().clone()))
    }

    async fn delete_message_ids_from_inbox(
        &self,
        session_id: &str,
        client_message_ids: &[String],
    ) -> Result<()> {
        self.check("delete_message_ids_from_inbox")?;
        for client_message_id in client_message_ids {
            self.tables
                .inbox
                .remove(&(session_id.to_string(), client_message_id.clone()));
        }
        Ok(())
    }

    async fn store_message_in_outbox(&self, message: &OutboxMessage) -> Result<Option<CurrentNode>> {
        self.check("store_message_in_outbox")?;
        let node = match self.tables.sessions.get(&message.session_id) {
            Some(session) => Self::current_node(&session),
            None => {
                debug!(
                    session_id = %message.session_id,
                    server_message_id = %message.server_message_id,
                    "Session gone, dropping outbox message"
                );
                return Ok(None);
            }
        };

        let mut rows = self
            .tables
            .outbox
            .entry(message.session_id.clone())
            .or_default();
        if rows
            .iter()
            .any(|row| row.stored.message.server_message_id == message.server_message_id)
        {
            return Err(CsafError::data_access(
                "store_message_in_outbox",
                format!("server message id '{}' already stored", message.server_message_id),
            ));
        }
        rows.push(OutboxRow {
            stored: StoredOutMessage {
                message: message.clone(),
                stored_at: now(),
                attempt_at: None,
                delivery_count: 0,
            },
            dead_lettered_at: None,
        });
        Ok(node)
    }

    async fn get_messages_from_outbox(
        &self,
        session_id: &str,
        max: usize,
    ) -> Result<Vec<StoredOutMessage>> {
        self.check("get_messages_from_outbox")?;
        Ok(self
            .tables
            .outbox
            .get(session_id)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.stored.attempt_at.is_none() && row.dead_lettered_at.is_none())
                    .take(max)
                    .map(|row| row.stored.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn outbox_messages_attempted_delivery(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()> {
        self.check("outbox_messages_attempted_delivery")?;
        let now = now();
        self.with_outbox_rows(session_id, server_message_ids, |row| {
            row.stored.attempt_at = Some(now);
            row.stored.delivery_count += 1;
        });
        Ok(())
    }

    async fn outbox_messages_unmark_attempted_delivery(&self, session_id: &str) -> Result<()> {
        self.check("outbox_messages_unmark_attempted_delivery")?;
        if let Some(mut rows) = self.tables.outbox.get_mut(session_id) {
            for row in rows.iter_mut() {
                row.stored.attempt_at = None;
            }
        }
        Ok(())
    }

    async fn outbox_messages_unmark_attempted_delivery_ids(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()> {
        self.check("outbox_messages_unmark_attempted_delivery_ids")?;
        if let Some(mut rows) = self.tables.outbox.get_mut(session_id) {
            for row in rows.iter_mut() {
                if server_message_ids.contains(&row.stored.message.server_message_id) {
                    row.stored.attempt_at = None;
                }
            }
        }
        Ok(())
    }

    async fn outbox_messages_complete(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()> {
        self.check("outbox_messages_complete")?;
        if let Some(mut rows) = self.tables.outbox.get_mut(session_id) {
            rows.retain(|row| !server_message_ids.contains(&row.stored.message.server_message_id));
        }
        Ok(())
    }

    async fn outbox_messages_dead_letter_queue(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()> {
        self.check("outbox_messages_dead_letter_queue")?;
        let now = now();
        self.with_outbox_rows(session_id, server_message_ids, |row| {
            row.dead_lettered_at = Some(now);
        });
        Ok(())
    }

    async fn store_request_correlation(&self, correlation: &RequestCorrelation) -> Result<()> {
        self.check("store_request_correlation")?;
        self.tables.correlations.insert(
            (
                correlation.session_id.clone(),
                correlation.server_message_id.clone(),
            ),
            correlation.clone(),
        );
        Ok(())
    }

    async fn get_and_delete_request_correlation(
        &self,
        session_id: &str,
        server_message_id: &str,
    ) -> Result<Option<RequestCorrelation>> {
        self.check("get_and_delete_request_correlation")?;
        Ok(self
            .tables
            .correlations
            .remove(&(session_id.to_string(), server_message_id.to_string()))
            .map(|(_, correlation)| correlation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageType;

    #[tokio::test]
    async fn test_node_handles_share_data() {
        let node_a = InMemoryStore::new("node-a");
        let node_b = node_a.for_node("node-b");

        node_a
            .register_session_at_this_node("s1", "alice", "c1", &ClientInfo::default())
            .await
            .unwrap();

        assert!(node_b.is_session_exists("s1").await.unwrap());
        assert_eq!(node_b.nodename(), "node-b");
        assert_eq!(
            node_b
                .get_current_registered_node_for_session("s1")
                .await
                .unwrap()
                .map(|n| n.nodename),
            Some("node-a".to_string())
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted_down() {
        let store = InMemoryStore::new("node");
        store.fail_next_operations(2);

        assert!(store.is_session_exists("s").await.is_err());
        let err = store.is_session_exists("s").await.unwrap_err();
        assert_eq!(err.error_code(), "DATA_ACCESS");
        assert!(!store.is_session_exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_server_message_id_is_rejected() {
        let store = InMemoryStore::new("node");
        store
            .register_session_at_this_node("s", "u", "c", &ClientInfo::default())
            .await
            .unwrap();
        let message = OutboxMessage {
            session_id: "s".into(),
            server_message_id: "m1".into(),
            client_message_id: None,
            trace_id: "t".into(),
            message_type: MessageType::Send,
            envelope: "{}".into(),
            message_text: None,
            message_binary: None,
        };

        store.store_message_in_outbox(&message).await.unwrap();
        let err = store.store_message_in_outbox(&message).await.unwrap_err();
        assert!(matches!(err, CsafError::DataAccess { .. }));
        assert_eq!(store.get_messages_from_outbox("s", 10).await.unwrap().len(), 1);
    }
}
