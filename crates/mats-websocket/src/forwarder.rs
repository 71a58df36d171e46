// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbox forwarding: moves stored messages to the client connected at this node.
//!
//! One round fetches what is not yet attempted, marks it attempted, and hands
//! it to the [`ClientDelivery`] sink. Delivered messages stay marked until the
//! client acknowledges them ([`OutboxForwarder::acknowledge`]) or the session
//! reconnects ([`OutboxForwarder::reconnected`]), which makes them eligible
//! again. A message whose delivery count has reached the budget is
//! dead-lettered instead of sent once more.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::CsafConfig;
use crate::error::Result;
use crate::store::{ClusterStoreAndForward, StoredOutMessage};

/// Sink pushing outbox messages over the session's live connection.
#[async_trait]
pub trait ClientDelivery: Send + Sync {
    /// Sends the messages in order. An error means none of them can be assumed delivered.
    async fn deliver(&self, session_id: &str, messages: &[StoredOutMessage]) -> anyhow::Result<()>;
}

/// Outcome of one [`OutboxForwarder::forward`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReport {
    /// Handed to the client, awaiting acknowledgement.
    pub delivered: usize,
    pub dead_lettered: usize,
    /// Handed to the sink, which failed; unmarked for a later attempt.
    pub failed: usize,
}

/// Drives the delivery-attempt protocol of a session's outbox.
pub struct OutboxForwarder {
    store: Arc<dyn ClusterStoreAndForward>,
    delivery: Arc<dyn ClientDelivery>,
    max_delivery_attempts: u32,
    batch_size: usize,
}

impl std::fmt::Debug for OutboxForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxForwarder")
            .field("store", &"...")
            .field("delivery", &"...")
            .field("max_delivery_attempts", &self.max_delivery_attempts)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl OutboxForwarder {
    pub fn new(
        store: Arc<dyn ClusterStoreAndForward>,
        delivery: Arc<dyn ClientDelivery>,
        config: &CsafConfig,
    ) -> Self {
        Self {
            store,
            delivery,
            max_delivery_attempts: config.max_delivery_attempts,
            batch_size: config.outbox_batch_size,
        }
    }

    /// Forwards everything currently eligible in the session's outbox.
    ///
    /// Stops at the first failing delivery; the failed batch is unmarked so a
    /// later round picks it up again with its delivery count raised.
    pub async fn forward(&self, session_id: &str) -> Result<ForwardReport> {
        let mut report = ForwardReport::default();

        loop {
            let batch = self
                .store
                .get_messages_from_outbox(session_id, self.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let (exhausted, deliverable): (Vec<_>, Vec<_>) = batch
                .into_iter()
                .partition(|message| message.delivery_count >= self.max_delivery_attempts);

            if !exhausted.is_empty() {
                let ids = server_message_ids(&exhausted);
                warn!(
                    session_id,
                    server_message_ids = ?ids,
                    max_delivery_attempts = self.max_delivery_attempts,
                    "Outbox messages overran their delivery budget, dead-lettering"
                );
                self.store
                    .outbox_messages_dead_letter_queue(session_id, &ids)
                    .await?;
                report.dead_lettered += ids.len();
            }

            if deliverable.is_empty() {
                continue;
            }

            let ids = server_message_ids(&deliverable);
            self.store
                .outbox_messages_attempted_delivery(session_id, &ids)
                .await?;

            match self.delivery.deliver(session_id, &deliverable).await {
                Ok(()) => {
                    debug!(session_id, count = ids.len(), "Delivered outbox messages");
                    report.delivered += ids.len();
                }
                Err(e) => {
                    warn!(
                        session_id,
                        count = ids.len(),
                        error = %e,
                        "Delivery to client failed, unmarking the batch for a later attempt"
                    );
                    // Earlier batches of this round reached the client and await their ack.
                    self.store
                        .outbox_messages_unmark_attempted_delivery_ids(session_id, &ids)
                        .await?;
                    report.failed += ids.len();
                    break;
                }
            }
        }

        if report != ForwardReport::default() {
            info!(
                session_id,
                delivered = report.delivered,
                dead_lettered = report.dead_lettered,
                failed = report.failed,
                "Outbox forwarding round finished"
            );
        }
        Ok(report)
    }

    /// The client confirmed reception; the messages are done.
    pub async fn acknowledge(&self, session_id: &str, server_message_ids: &[String]) -> Result<()> {
        self.store
            .outbox_messages_complete(session_id, server_message_ids)
            .await
    }

    /// The session came back on a new connection: unacknowledged messages get another attempt.
    pub async fn reconnected(&self, session_id: &str) -> Result<()> {
        self.store
            .outbox_messages_unmark_attempted_delivery(session_id)
            .await
    }
}

fn server_message_ids(messages: &[StoredOutMessage]) -> Vec<String> {
    messages
        .iter()
        .map(|message| message.server_message_id().to_string())
        .collect()
}
