// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for mats-core.
//!
//! Each concern gets its own enum so callers can tell a poison message from a
//! transient failure from the dual-write hazard without string matching.

use crate::trace::CallType;

/// Result type for factory and processing-context operations.
pub type Result<T> = std::result::Result<T, MatsError>;

/// Errors building, reading or (de)serializing a [`Trace`](crate::trace::Trace).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TraceError {
    /// A `from`, `to` or `replyTo` identifier was empty or contained whitespace.
    #[error("malformed '{field}' for {call_type} call: '{value}'")]
    MalformedCall {
        call_type: CallType,
        field: &'static str,
        value: String,
    },

    /// A REPLY was attempted, but no one is waiting for it.
    #[error("cannot add REPLY call: the reply stack is empty")]
    EmptyStack,

    /// The trace carries no calls at all.
    #[error("trace has no current call")]
    NoCurrentCall,

    /// The serializer does not understand the trace encoding metadata.
    #[error("unsupported trace encoding '{0}'")]
    UnknownMeta(String),

    /// JSON (de)serialization of the trace, a DTO or a state object failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors parsing a stash blob.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StashError {
    #[error("stash is too short to be valid: {len} bytes")]
    TooShort { len: usize },

    #[error("stash magic mismatch at byte {index}: expected {expected}, got {actual}")]
    BadMagic { index: usize, expected: u8, actual: u8 },

    #[error("unsupported stash version {0}")]
    UnsupportedVersion(u8),

    #[error("stash declares {0} metadata fields, at least 6 are required")]
    TooFewFields(u8),

    #[error("stash is missing the NUL delimiter after field #{0}")]
    MissingDelimiter(usize),

    #[error("stash field '{field}' is not valid UTF-8")]
    Utf8 { field: &'static str },
}

/// Broker session or connection level failures.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// A session could not be created (connection down, broker unavailable).
    #[error("broker session unavailable: {0}")]
    SessionUnavailable(String),

    /// The operation was attempted on a closed session.
    #[error("broker session is closed")]
    SessionClosed,

    /// Committing the broker transaction failed.
    #[error("broker commit failed: {0}")]
    CommitFailed(String),

    /// Any other I/O-ish failure during a broker operation.
    #[error("broker error during '{operation}': {details}")]
    Io {
        operation: &'static str,
        details: String,
    },
}

/// Failures of the external transactional resource.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ResourceError {
    #[error("could not begin transaction on '{resource}': {details}")]
    Begin { resource: String, details: String },

    #[error("commit failed on '{resource}': {details}")]
    Commit { resource: String, details: String },

    #[error("rollback failed on '{resource}': {details}")]
    Rollback { resource: String, details: String },
}

/// Explicit "do not retry" signal raised by user code.
///
/// Return it through `anyhow` from a stage lambda; the processor downcasts and
/// rolls back with a refuse disposition, sending the message straight to the
/// dead-letter queue.
#[derive(Debug, Clone, thiserror::Error)]
#[error("message refused: {reason}")]
pub struct RefuseMessage {
    pub reason: String,
}

impl RefuseMessage {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed [`TransactionManager::do_transaction`](crate::transaction::TransactionManager::do_transaction).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransactionError {
    /// The work failed with an ordinary error; everything was rolled back and
    /// the incoming message is eligible for redelivery.
    #[error("transactional work failed, rolled back: {0:#}")]
    Work(anyhow::Error),

    /// The work refused the message; rolled back with the refuse disposition.
    #[error(transparent)]
    Refused(RefuseMessage),

    /// The external resource failed to begin; the broker transaction was rolled back.
    #[error("external resource unavailable, rolled back: {0}")]
    ResourceBegin(ResourceError),

    /// The external resource failed to commit; the broker transaction was rolled back.
    #[error("external resource commit failed, broker rolled back: {0}")]
    ResourceCommit(ResourceError),

    /// The external resource COMMITTED, then the broker commit failed.
    ///
    /// This is the dual-write hazard: side effects are durable but no
    /// outgoing message was sent and the incoming one will be redelivered.
    #[error("VERY BAD! external resource committed, but broker commit failed: {0}")]
    MessageSend(BrokerError),

    /// The broker commit failed and no external resource had committed.
    #[error("broker commit failed, nothing committed: {0}")]
    Commit(BrokerError),

    /// Rolling back the broker transaction failed after the work failed.
    #[error("rollback failed: {0}")]
    Rollback(BrokerError),
}

impl TransactionError {
    /// True when the broker session itself is suspect and should be crashed.
    pub fn is_session_failure(&self) -> bool {
        match self {
            Self::Commit(_) | Self::Rollback(_) | Self::MessageSend(_) => true,
            Self::Work(err) => err.downcast_ref::<BrokerError>().is_some(),
            _ => false,
        }
    }
}

/// Errors raised synchronously to initiating code.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InitiateError {
    /// A required builder field was not set before the terminal operation.
    #[error("missing required field '{field}' for {operation}(..)")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },

    /// Mutually exclusive settings were combined.
    #[error("illegal combination: {0}")]
    IllegalCombination(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Session acquisition or resource problems; nothing was committed.
    #[error("backend failure, nothing committed: {0}")]
    Backend(String),

    /// The dual-write hazard: the external resource committed, the messages were NOT sent.
    #[error("VERY BAD! external resource committed, but the messages were not sent: {0}")]
    MessageSend(BrokerError),

    /// The initiation lambda raised an error; everything was rolled back.
    #[error("initiation failed, rolled back: {0:#}")]
    Lambda(anyhow::Error),

    #[error("unparseable stash: {0}")]
    Stash(#[from] StashError),

    /// The DTO, state or trace could not be serialized.
    #[error(transparent)]
    Trace(#[from] TraceError),

    /// A resumed (unstashed) lambda tried to refuse its message.
    #[error("cannot refuse a message while unstashing: {0}")]
    RefuseWhileUnstashing(String),
}

impl InitiateError {
    /// Stable code for this error kind, suitable for logs and metrics labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "MISSING_FIELD",
            Self::IllegalCombination(_) => "ILLEGAL_COMBINATION",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Backend(_) => "BACKEND",
            Self::MessageSend(_) => "MESSAGE_SEND",
            Self::Lambda(_) => "LAMBDA",
            Self::Stash(_) => "STASH",
            Self::Trace(_) => "TRACE",
            Self::RefuseWhileUnstashing(_) => "REFUSE_WHILE_UNSTASHING",
        }
    }
}

impl From<TransactionError> for InitiateError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::Work(err) => match err.downcast::<InitiateError>() {
                Ok(initiate) => initiate,
                Err(other) => InitiateError::Lambda(other),
            },
            TransactionError::Refused(refuse) => InitiateError::Lambda(refuse.into()),
            TransactionError::ResourceBegin(e) | TransactionError::ResourceCommit(e) => {
                InitiateError::Backend(e.to_string())
            }
            TransactionError::Commit(e) | TransactionError::Rollback(e) => {
                InitiateError::Backend(e.to_string())
            }
            TransactionError::MessageSend(e) => InitiateError::MessageSend(e),
        }
    }
}

/// Errors from the factory, endpoints and the processing context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MatsError {
    #[error("endpoint '{0}' is already registered")]
    DuplicateEndpoint(String),

    #[error("endpoint '{0}' has no stages")]
    NoStages(String),

    /// `next(..)` or `request(..)` was invoked from the last stage of an endpoint.
    #[error("stage '{stage_id}' has no next stage")]
    NoNextStage { stage_id: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl MatsError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateEndpoint(_) => "DUPLICATE_ENDPOINT",
            Self::NoStages(_) => "NO_STAGES",
            Self::NoNextStage { .. } => "NO_NEXT_STAGE",
            Self::Configuration(_) => "CONFIGURATION",
            Self::Trace(_) => "TRACE",
            Self::Broker(_) => "BROKER",
        }
    }
}
