// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotent handling of information-bearing client messages.
//!
//! A client SEND or REQUEST is first recorded in the session's inbox; a second
//! arrival of the same client message id is answered from the inbox without
//! running the business logic again. A client RESOLVE or REJECT consumes the
//! correlation left by the server's request; a second arrival finds none and
//! is acknowledged as already done.
//!
//! When processing fails after that bookkeeping, the bookkeeping is undone
//! (the inbox id deleted, or the correlation put back) so the client's retry
//! is processed afresh. That compensating step is retried a bounded number of
//! times; if it never succeeds the session cannot be trusted any more and must
//! be terminated.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mats_core::InitiateError;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::CsafConfig;
use crate::error::CsafError;
use crate::store::{ClusterStoreAndForward, MessageType, RequestCorrelation};

/// An incoming client message, as far as idempotency is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub session_id: String,
    pub message_type: MessageType,
    pub client_message_id: String,
    /// For RESOLVE and REJECT: the server request being answered.
    pub server_message_id: Option<String>,
}

impl IncomingMessage {
    pub fn new(
        session_id: impl Into<String>,
        message_type: MessageType,
        client_message_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_type,
            client_message_id: client_message_id.into(),
            server_message_id: None,
        }
    }

    pub fn in_reply_to(mut self, server_message_id: impl Into<String>) -> Self {
        self.server_message_id = Some(server_message_id.into());
        self
    }

    fn is_client_initiated(&self) -> bool {
        matches!(self.message_type, MessageType::Send | MessageType::Request)
    }
}

/// The answer to give the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandledReply {
    #[serde(rename = "t")]
    pub message_type: MessageType,
    /// Serialized reply envelope, for anything richer than an acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<String>,
}

impl HandledReply {
    pub fn ack() -> Self {
        Self {
            message_type: MessageType::Ack,
            envelope: None,
        }
    }

    pub fn new(message_type: MessageType, envelope: impl Into<String>) -> Self {
        Self {
            message_type,
            envelope: Some(envelope.into()),
        }
    }
}

/// Why processing an incoming message failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IncomingError {
    /// Nothing was committed; the client may simply retry.
    #[error("backend failure, nothing committed: {0}")]
    Backend(String),

    /// The database committed, but the messages were not sent.
    #[error("resource committed, but the messages were not sent: {0}")]
    MessageSend(String),

    /// The business logic did not accept the message.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<InitiateError> for IncomingError {
    fn from(err: InitiateError) -> Self {
        match err {
            InitiateError::Backend(details) => IncomingError::Backend(details),
            InitiateError::MessageSend(e) => IncomingError::MessageSend(e.to_string()),
            other => IncomingError::Rejected(other.to_string()),
        }
    }
}

/// What to tell the client, and whether the session survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// Processed now.
    Handled(HandledReply),
    /// A double delivery, answered like the first time.
    Duplicate(HandledReply),
    /// Ask the client to send again.
    Retry(String),
    Nack(String),
    /// The bookkeeping could not be undone; close the session.
    SessionMustTerminate(String),
}

/// Runs business logic for incoming client messages at most once per client message id.
pub struct IncomingHandler {
    store: Arc<dyn ClusterStoreAndForward>,
    compensating_attempts: u32,
    compensating_interval: Duration,
}

impl std::fmt::Debug for IncomingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingHandler")
            .field("store", &"...")
            .field("compensating_attempts", &self.compensating_attempts)
            .field("compensating_interval", &self.compensating_interval)
            .finish()
    }
}

impl IncomingHandler {
    pub fn new(store: Arc<dyn ClusterStoreAndForward>, config: &CsafConfig) -> Self {
        Self {
            store,
            compensating_attempts: config.compensating_attempts.max(1),
            compensating_interval: config.compensating_interval,
        }
    }

    /// Handles `message`, invoking `process` only if it was not handled before.
    ///
    /// `process` receives the request correlation when the message answers a
    /// server request. Any reply other than a plain ACK is kept in the inbox
    /// so a double delivery gets the same answer.
    pub async fn handle_idempotently<F, Fut>(
        &self,
        message: &IncomingMessage,
        process: F,
    ) -> IncomingOutcome
    where
        F: FnOnce(Option<RequestCorrelation>) -> Fut,
        Fut: Future<Output = Result<HandledReply, IncomingError>>,
    {
        let session_id = message.session_id.as_str();
        let client_message_id = message.client_message_id.as_str();

        let correlation = match message.message_type {
            MessageType::Send | MessageType::Request => {
                match self
                    .store
                    .store_message_id_in_inbox(session_id, client_message_id)
                    .await
                {
                    Ok(()) => None,
                    Err(CsafError::ClientMessageIdAlreadyExists { .. }) => {
                        return self.replay(message).await;
                    }
                    Err(e) => {
                        warn!(session_id, client_message_id, error = %e, "Could not store client message id in inbox, asking client to retry");
                        return IncomingOutcome::Retry(e.to_string());
                    }
                }
            }
            MessageType::Resolve | MessageType::Reject => {
                let Some(server_message_id) = message.server_message_id.as_deref() else {
                    return IncomingOutcome::Nack(format!(
                        "{} without the server message id it answers",
                        message.message_type.as_str()
                    ));
                };
                match self
                    .store
                    .get_and_delete_request_correlation(session_id, server_message_id)
                    .await
                {
                    Ok(Some(correlation)) => Some(correlation),
                    Ok(None) => {
                        info!(session_id, client_message_id, server_message_id, "Double delivery of client reply, already processed");
                        return IncomingOutcome::Duplicate(HandledReply::ack());
                    }
                    Err(e) => {
                        warn!(session_id, server_message_id, error = %e, "Could not fetch request correlation, asking client to retry");
                        return IncomingOutcome::Retry(e.to_string());
                    }
                }
            }
            other => {
                return IncomingOutcome::Nack(format!(
                    "{} is not an information-bearing client message",
                    other.as_str()
                ));
            }
        };

        match process(correlation.clone()).await {
            Ok(reply) => {
                if reply.message_type != MessageType::Ack && message.is_client_initiated() {
                    self.remember_reply(message, &reply).await;
                }
                IncomingOutcome::Handled(reply)
            }
            Err(err) => {
                warn!(session_id, client_message_id, error = %err, "Processing of incoming message failed, compensating");
                if !self.compensate(message, correlation.as_ref()).await {
                    return IncomingOutcome::SessionMustTerminate(format!(
                        "could not undo bookkeeping after: {err}"
                    ));
                }
                match err {
                    IncomingError::Rejected(reason) => IncomingOutcome::Nack(reason),
                    other => IncomingOutcome::Retry(other.to_string()),
                }
            }
        }
    }

    async fn replay(&self, message: &IncomingMessage) -> IncomingOutcome {
        let session_id = message.session_id.as_str();
        let client_message_id = message.client_message_id.as_str();
        let stored = match self
            .store
            .get_message_from_inbox(session_id, client_message_id)
            .await
        {
            Ok(stored) => stored,
            Err(e) => return IncomingOutcome::Retry(e.to_string()),
        };

        match stored.and_then(|stored| stored.full_envelope) {
            None => {
                info!(session_id, client_message_id, "Double delivery, it was acknowledged last time");
                IncomingOutcome::Duplicate(HandledReply::ack())
            }
            Some(json) => match serde_json::from_str::<HandledReply>(&json) {
                Ok(reply) => {
                    info!(session_id, client_message_id, reply = reply.message_type.as_str(), "Double delivery, replaying the stored answer");
                    IncomingOutcome::Duplicate(reply)
                }
                Err(e) => {
                    error!(session_id, client_message_id, error = %e, "Stored answer is unreadable");
                    IncomingOutcome::Nack(format!("stored answer is unreadable: {e}"))
                }
            },
        }
    }

    async fn remember_reply(&self, message: &IncomingMessage, reply: &HandledReply) {
        let stored = match serde_json::to_string(reply) {
            Ok(json) => {
                self.store
                    .update_message_in_inbox(
                        &message.session_id,
                        &message.client_message_id,
                        Some(&json),
                        None,
                    )
                    .await
            }
            Err(e) => Err(e.into()),
        };
        // The client still gets its answer now; only a replay would degrade to ACK.
        if let Err(e) = stored {
            warn!(
                session_id = %message.session_id,
                client_message_id = %message.client_message_id,
                error = %e,
                "Could not store the answer in the inbox"
            );
        }
    }

    /// Undoes the inbox or correlation bookkeeping. Returns false when every attempt failed.
    async fn compensate(
        &self,
        message: &IncomingMessage,
        correlation: Option<&RequestCorrelation>,
    ) -> bool {
        for attempt in 1..=self.compensating_attempts {
            let result = match correlation {
                Some(correlation) => self.store.store_request_correlation(correlation).await,
                None => {
                    self.store
                        .delete_message_ids_from_inbox(
                            &message.session_id,
                            std::slice::from_ref(&message.client_message_id),
                        )
                        .await
                }
            };
            match result {
                Ok(()) => {
                    debug!(session_id = %message.session_id, attempt, "Compensating transaction done");
                    return true;
                }
                Err(e) if attempt < self.compensating_attempts => {
                    warn!(session_id = %message.session_id, attempt, error = %e, "Compensating transaction failed, trying again");
                    tokio::time::sleep(self.compensating_interval).await;
                }
                Err(e) => {
                    error!(session_id = %message.session_id, attempt, error = %e, "Compensating transaction failed for the last time");
                }
            }
        }
        false
    }
}
