// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Best-effort one-phase commit spanning the broker session and an optional
//! external resource.
//!
//! Commit order is resource first, broker last. A failing resource commit
//! therefore never loses the incoming message; a failing broker commit after
//! a successful resource commit is the documented dual-write hazard and is
//! reported as [`TransactionError::MessageSend`].

mod memory;

pub use memory::{InMemoryKeyValueStore, KeyValueTransaction};

use std::any::Any;
use std::sync::Arc;

use tracing::{error, warn};

use crate::broker::{BrokerSession, RollbackDisposition};
use crate::error::{RefuseMessage, ResourceError, TransactionError};

/// A transactional resource (database, key/value store) joined to message processing.
pub trait ExternalResource: Send + Sync {
    fn name(&self) -> &str;

    fn begin(&self) -> Result<Box<dyn ResourceTransaction>, ResourceError>;
}

/// One open unit of work on an [`ExternalResource`].
pub trait ResourceTransaction: Send {
    /// Lets user code reach the concrete transaction type through [`TransactionScope::resource`].
    fn as_any(&self) -> &dyn Any;

    fn commit(self: Box<Self>) -> Result<(), ResourceError>;

    fn rollback(self: Box<Self>) -> Result<(), ResourceError>;
}

/// What transactional work can see. Lives exactly as long as the work closure runs.
pub struct TransactionScope<'a> {
    resource: Option<&'a dyn ResourceTransaction>,
}

impl<'a> TransactionScope<'a> {
    /// The open resource transaction, if one is configured and is a `T`.
    pub fn resource<T: 'static>(&self) -> Option<&'a T> {
        self.resource.and_then(|tx| tx.as_any().downcast_ref::<T>())
    }
}

#[derive(Clone, Default)]
pub struct TransactionManager {
    resource: Option<Arc<dyn ExternalResource>>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("resource", &self.resource.as_ref().map(|r| r.name()))
            .finish()
    }
}

impl TransactionManager {
    pub fn new(resource: Option<Arc<dyn ExternalResource>>) -> Self {
        Self { resource }
    }

    /// Runs `work` inside one transaction on `session` (and the resource, if any).
    ///
    /// The broker transaction is implicitly open on the session: whatever was
    /// received and sent on it since the last commit belongs to this unit.
    pub fn do_transaction<T, F>(&self, session: &dyn BrokerSession, work: F) -> Result<T, TransactionError>
    where
        F: FnOnce(&TransactionScope<'_>) -> anyhow::Result<T>,
    {
        let resource_tx = match &self.resource {
            Some(resource) => match resource.begin() {
                Ok(tx) => Some(tx),
                Err(e) => {
                    if let Err(rollback_err) = session.rollback(RollbackDisposition::Redeliver) {
                        warn!(error = %rollback_err, "Broker rollback failed after resource begin failure");
                    }
                    return Err(TransactionError::ResourceBegin(e));
                }
            },
            None => None,
        };

        let outcome = {
            let scope = TransactionScope {
                resource: resource_tx.as_deref(),
            };
            work(&scope)
        };

        match outcome {
            Ok(value) => {
                let resource_committed = match resource_tx {
                    Some(tx) => {
                        if let Err(e) = tx.commit() {
                            if let Err(rollback_err) =
                                session.rollback(RollbackDisposition::Redeliver)
                            {
                                warn!(error = %rollback_err, "Broker rollback failed after resource commit failure");
                            }
                            return Err(TransactionError::ResourceCommit(e));
                        }
                        true
                    }
                    None => false,
                };

                if let Err(e) = session.commit() {
                    if resource_committed {
                        error!(
                            error = %e,
                            "VERY BAD! External resource was committed, but broker commit failed. \
                             Side effects are durable, outgoing messages were NOT sent."
                        );
                        return Err(TransactionError::MessageSend(e));
                    }
                    return Err(TransactionError::Commit(e));
                }
                Ok(value)
            }
            Err(err) => {
                let refused = err.downcast_ref::<RefuseMessage>().cloned();
                if let Some(tx) = resource_tx
                    && let Err(e) = tx.rollback()
                {
                    warn!(error = %e, "External resource rollback failed");
                }
                let disposition = if refused.is_some() {
                    RollbackDisposition::Refuse
                } else {
                    RollbackDisposition::Redeliver
                };
                if let Err(e) = session.rollback(disposition) {
                    return Err(TransactionError::Rollback(e));
                }
                Err(match refused {
                    Some(refuse) => TransactionError::Refused(refuse),
                    None => TransactionError::Work(err),
                })
            }
        }
    }
}
