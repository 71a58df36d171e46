// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Starting flows: the [`MatsInitiate`] builder and the [`MatsInitiator`] that
//! runs initiation lambdas in their own transaction.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, info_span, warn};

use crate::broker::BrokerSession;
use crate::context::{AfterCommit, ProcessContext};
use crate::envelope::{IncomingMessage, OutgoingMessage, send_outgoing};
use crate::error::{InitiateError, RefuseMessage};
use crate::factory::FactoryShared;
use crate::serializer::{deserialize_object, deserialize_state, serialize_object};
use crate::stage::StageInfo;
use crate::stash::StashedContext;
use crate::trace::{
    CallMeta, Channel, InitiatorInfo, KeepTrace, MessagingModel, Trace, new_flow_id,
    new_message_id,
};
use crate::transaction::TransactionScope;

/// Identifies a message that was queued for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReference {
    message_id: String,
}

impl MessageReference {
    pub(crate) fn new(message_id: String) -> Self {
        Self { message_id }
    }

    /// The globally unique Mats message id.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

/// The stage an initiation happens inside of.
pub(crate) struct InitiateParent<'a> {
    pub(crate) trace: &'a Trace,
    pub(crate) stage_id: &'a str,
    /// Trace properties of the incoming message merged with those set in the stage.
    pub(crate) props: &'a BTreeMap<String, String>,
}

struct ReplyTo {
    channel: Channel,
    state: String,
}

#[derive(Default)]
struct Draft {
    trace_id: Option<String>,
    keep_trace: KeepTrace,
    non_persistent: bool,
    time_to_live: Duration,
    interactive: bool,
    no_audit: bool,
    from: Option<String>,
    to: Option<String>,
    reply_to: Option<ReplyTo>,
    props: BTreeMap<String, String>,
    bytes: BTreeMap<String, Vec<u8>>,
    strings: BTreeMap<String, String>,
    /// First serialization failure of a builder method, reported at the terminal call.
    deferred: Option<InitiateError>,
}

#[derive(Clone, Copy)]
enum Kind {
    Request,
    Send,
    Publish,
}

impl Kind {
    fn operation(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Send => "send",
            Self::Publish => "publish",
        }
    }
}

/// Builder for new messages. Single-use per message: every terminal call
/// (`request`, `send`, `publish`) resets it, so one instance can queue many messages.
pub struct MatsInitiate<'a> {
    shared: &'a FactoryShared,
    scope: &'a TransactionScope<'a>,
    sink: &'a mut Vec<OutgoingMessage>,
    after_commit: &'a mut Vec<AfterCommit>,
    parent: Option<InitiateParent<'a>>,
    draft: Draft,
}

impl<'a> MatsInitiate<'a> {
    pub(crate) fn new(
        shared: &'a FactoryShared,
        scope: &'a TransactionScope<'a>,
        sink: &'a mut Vec<OutgoingMessage>,
        after_commit: &'a mut Vec<AfterCommit>,
        parent: Option<InitiateParent<'a>>,
    ) -> Self {
        let mut init = Self {
            shared,
            scope,
            sink,
            after_commit,
            parent,
            draft: Draft::default(),
        };
        init.reset();
        init
    }

    fn reset(&mut self) {
        self.draft = Draft {
            from: self.parent.as_ref().map(|p| p.stage_id.to_string()),
            ..Draft::default()
        };
    }

    /// Sets the trace id. Inside a stage it is appended to the current one with `|`.
    pub fn trace_id(&mut self, trace_id: impl Into<String>) -> &mut Self {
        let trace_id = trace_id.into();
        self.draft.trace_id = Some(match &self.parent {
            Some(parent) => format!("{}|{}", parent.trace.trace_id(), trace_id),
            None => trace_id,
        });
        self
    }

    pub fn keep_trace(&mut self, keep_trace: KeepTrace) -> &mut Self {
        self.draft.keep_trace = keep_trace;
        self
    }

    pub fn non_persistent(&mut self) -> &mut Self {
        self.draft.non_persistent = true;
        self
    }

    /// Only allowed together with [`non_persistent`](Self::non_persistent).
    pub fn time_to_live(&mut self, ttl: Duration) -> &mut Self {
        self.draft.time_to_live = ttl;
        self
    }

    pub fn interactive(&mut self) -> &mut Self {
        self.draft.interactive = true;
        self
    }

    pub fn no_audit(&mut self) -> &mut Self {
        self.draft.no_audit = true;
        self
    }

    pub fn from(&mut self, initiator_id: impl Into<String>) -> &mut Self {
        self.draft.from = Some(initiator_id.into());
        self
    }

    pub fn to(&mut self, endpoint_id: impl Into<String>) -> &mut Self {
        self.draft.to = Some(endpoint_id.into());
        self
    }

    /// Where the reply of a `request` goes, and the state it brings along.
    pub fn reply_to<S: Serialize + ?Sized>(&mut self, endpoint_id: impl Into<String>, reply_state: &S) -> &mut Self {
        self.set_reply_to(Channel::queue(endpoint_id), reply_state)
    }

    /// Like [`reply_to`](Self::reply_to), but the reply is published to a subscription terminator.
    pub fn reply_to_subscription<S: Serialize + ?Sized>(
        &mut self,
        endpoint_id: impl Into<String>,
        reply_state: &S,
    ) -> &mut Self {
        self.set_reply_to(Channel::topic(endpoint_id), reply_state)
    }

    fn set_reply_to<S: Serialize + ?Sized>(&mut self, channel: Channel, reply_state: &S) -> &mut Self {
        match serialize_object(reply_state) {
            Ok(state) => self.draft.reply_to = Some(ReplyTo { channel, state }),
            Err(e) => self.defer(e.into()),
        }
        self
    }

    pub fn set_trace_property<T: Serialize + ?Sized>(&mut self, name: impl Into<String>, value: &T) -> &mut Self {
        match serialize_object(value) {
            Ok(json) => {
                self.draft.props.insert(name.into(), json);
            }
            Err(e) => self.defer(e.into()),
        }
        self
    }

    pub fn add_bytes(&mut self, key: impl Into<String>, payload: Vec<u8>) -> &mut Self {
        self.draft.bytes.insert(key.into(), payload);
        self
    }

    pub fn add_string(&mut self, key: impl Into<String>, payload: impl Into<String>) -> &mut Self {
        self.draft.strings.insert(key.into(), payload.into());
        self
    }

    fn defer(&mut self, err: InitiateError) {
        if self.draft.deferred.is_none() {
            self.draft.deferred = Some(err);
        }
    }

    /// The open transaction of the external resource, if it is a `T`.
    pub fn resource<T: 'static>(&self) -> Option<&'a T> {
        self.scope.resource::<T>()
    }

    /// Queues a REQUEST to `to`; requires `reply_to`.
    pub fn request<T: Serialize + ?Sized>(&mut self, dto: &T) -> Result<MessageReference, InitiateError> {
        self.produce(Kind::Request, dto, None)
    }

    pub fn request_with_initial_state<T, S>(&mut self, dto: &T, initial_target_state: &S) -> Result<MessageReference, InitiateError>
    where
        T: Serialize + ?Sized,
        S: Serialize + ?Sized,
    {
        let initial = serialize_object(initial_target_state).map_err(InitiateError::from);
        self.produce_with(Kind::Request, dto, initial)
    }

    /// Queues a fire-and-forget SEND to a queue-based endpoint.
    pub fn send<T: Serialize + ?Sized>(&mut self, dto: &T) -> Result<MessageReference, InitiateError> {
        self.produce(Kind::Send, dto, None)
    }

    pub fn send_with_initial_state<T, S>(&mut self, dto: &T, initial_target_state: &S) -> Result<MessageReference, InitiateError>
    where
        T: Serialize + ?Sized,
        S: Serialize + ?Sized,
    {
        let initial = serialize_object(initial_target_state).map_err(InitiateError::from);
        self.produce_with(Kind::Send, dto, initial)
    }

    /// Queues a SEND to a subscription terminator (topic).
    pub fn publish<T: Serialize + ?Sized>(&mut self, dto: &T) -> Result<MessageReference, InitiateError> {
        self.produce(Kind::Publish, dto, None)
    }

    pub fn publish_with_initial_state<T, S>(&mut self, dto: &T, initial_target_state: &S) -> Result<MessageReference, InitiateError>
    where
        T: Serialize + ?Sized,
        S: Serialize + ?Sized,
    {
        let initial = serialize_object(initial_target_state).map_err(InitiateError::from);
        self.produce_with(Kind::Publish, dto, initial)
    }

    fn produce_with<T: Serialize + ?Sized>(
        &mut self,
        kind: Kind,
        dto: &T,
        initial: Result<String, InitiateError>,
    ) -> Result<MessageReference, InitiateError> {
        match initial {
            Ok(initial) => self.produce(kind, dto, Some(initial)),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn produce<T: Serialize + ?Sized>(
        &mut self,
        kind: Kind,
        dto: &T,
        initial_target_state: Option<String>,
    ) -> Result<MessageReference, InitiateError> {
        let draft = std::mem::take(&mut self.draft);
        self.reset();

        if let Some(err) = draft.deferred {
            return Err(err);
        }
        let operation = kind.operation();
        let missing = |field: &'static str| InitiateError::MissingField { operation, field };
        let trace_id = draft.trace_id.ok_or_else(|| missing("traceId"))?;
        let from = draft.from.ok_or_else(|| missing("from"))?;
        let to = draft.to.ok_or_else(|| missing("to"))?;
        let reply_to = match (kind, draft.reply_to) {
            (Kind::Request, Some(reply_to)) => Some(reply_to),
            (Kind::Request, None) => return Err(missing("replyTo")),
            (_, Some(_)) => {
                return Err(InitiateError::IllegalCombination(format!(
                    "replyTo is set, but {operation}(..) expects no reply"
                )));
            }
            (_, None) => None,
        };
        if !draft.time_to_live.is_zero() && !draft.non_persistent {
            return Err(InitiateError::IllegalCombination(
                "timeToLive requires nonPersistent: a persistent message cannot expire".to_string(),
            ));
        }

        let flow_id = new_flow_id();
        let mut trace = Trace::new(
            trace_id,
            flow_id.clone(),
            draft.keep_trace,
            draft.non_persistent,
            draft.interactive,
            draft.time_to_live.as_millis() as u64,
            draft.no_audit,
        )
        .with_initiator(InitiatorInfo {
            app_name: self.shared.config.app_name.clone(),
            app_version: self.shared.config.app_version.clone(),
            host: self.shared.config.nodename.clone(),
            initiator_id: from.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        if let Some(parent) = &self.parent {
            for (key, value) in parent.props {
                trace.set_trace_property(key.clone(), value.clone());
            }
        }
        for (key, value) in draft.props {
            trace.set_trace_property(key, value);
        }

        let message_id = new_message_id(&flow_id, 1);
        let meta = CallMeta {
            message_id: message_id.clone(),
            debug: Some(self.shared.debug_info()),
        };
        let data = Some(serialize_object(dto)?);
        let built = match (kind, reply_to) {
            (Kind::Request, Some(reply_to)) => trace.add_request_call(
                &from,
                Channel::queue(to),
                reply_to.channel,
                data,
                Some(reply_to.state),
                initial_target_state,
                meta,
            ),
            (Kind::Publish, _) => {
                trace.add_send_call(&from, Channel::topic(to), data, initial_target_state, meta)
            }
            (_, _) => trace.add_send_call(&from, Channel::queue(to), data, initial_target_state, meta),
        };
        let trace = built.map_err(|e| InitiateError::InvalidArgument(e.to_string()))?;

        self.sink.push(OutgoingMessage {
            trace,
            bytes: draft.bytes,
            strings: draft.strings,
        });
        Ok(MessageReference::new(message_id))
    }

    /// Resumes a stage that was [stashed](ProcessContext::stash).
    ///
    /// `lambda` runs as if it were the stashed stage receiving the stashed
    /// message again: it gets the same state and incoming DTO, and its
    /// requests, nexts and replies continue the original flow. They commit
    /// with this initiation. Refusing is not possible anymore at this point.
    pub fn unstash<R, S, I, F>(&mut self, stash: &[u8], lambda: F) -> Result<(), InitiateError>
    where
        S: Serialize + DeserializeOwned + Default,
        I: DeserializeOwned,
        F: FnOnce(&mut ProcessContext<'_, R>, &mut S, I) -> anyhow::Result<()>,
    {
        let stashed = StashedContext::decode(stash)?;
        let deserialized = self
            .shared
            .serializer
            .deserialize_trace(&stashed.trace_bytes, &stashed.trace_meta)?;
        let stage = StageInfo {
            endpoint_id: stashed.endpoint_id,
            stage_id: stashed.stage_id,
            next_stage_id: stashed.next_stage_id,
            model: MessagingModel::Queue,
            subscription: false,
        };
        let incoming = IncomingMessage {
            trace: deserialized.trace,
            trace_meta: stashed.trace_meta,
            trace_bytes: stashed.trace_bytes,
            system_message_id: stashed.message_id,
            redelivery_count: 0,
            bytes: BTreeMap::new(),
            strings: BTreeMap::new(),
            millis_deserialization: deserialized.millis_deserialization,
        };

        let mut state: S = deserialize_state(incoming.trace.current_state())?;
        let dto: I = deserialize_object(
            incoming
                .trace
                .current_call()
                .and_then(|call| call.data.as_deref()),
        )?;

        info!(
            stage_id = %stage.stage_id,
            trace_id = %incoming.trace.trace_id(),
            "Unstashing stage context"
        );
        let mut ctx = ProcessContext::<R>::new(&stage, self.shared, &incoming, self.scope);
        if let Err(err) = lambda(&mut ctx, &mut state, dto) {
            if let Some(refuse) = err.downcast_ref::<RefuseMessage>() {
                return Err(InitiateError::RefuseWhileUnstashing(refuse.reason.clone()));
            }
            return Err(InitiateError::Lambda(err));
        }
        let outcome = ctx.finish(&state)?;
        self.sink.extend(outcome.messages);
        self.after_commit.extend(outcome.after_commit);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs initiation lambdas, each in its own transaction on a broker session
/// owned by this initiator.
pub struct MatsInitiator {
    name: String,
    shared: Arc<FactoryShared>,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
}

impl std::fmt::Debug for MatsInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatsInitiator")
            .field("name", &self.name)
            .finish()
    }
}

impl MatsInitiator {
    pub(crate) fn new(name: String, shared: Arc<FactoryShared>) -> Self {
        Self {
            name,
            shared,
            session: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `lambda`; every message it queues is sent atomically when it
    /// returns `Ok`, together with the external resource commit.
    ///
    /// Initiations on one initiator are serialized.
    pub fn initiate<F>(&self, lambda: F) -> Result<(), InitiateError>
    where
        F: FnOnce(&mut MatsInitiate<'_>) -> anyhow::Result<()>,
    {
        let span = info_span!("mats.initiate", initiator = %self.name);
        let _entered = span.enter();

        let mut slot = lock(&self.session);
        let session = match slot.as_ref() {
            Some(session) if !session.is_closed() => session.clone(),
            _ => {
                let session = self
                    .shared
                    .broker
                    .create_session()
                    .map_err(|e| InitiateError::Backend(e.to_string()))?;
                *slot = Some(session.clone());
                session
            }
        };

        let shared = self.shared.as_ref();
        let result = shared.transactions.do_transaction(session.as_ref(), |scope| {
            let mut messages = Vec::new();
            let mut after_commit = Vec::new();
            {
                let mut init = MatsInitiate::new(shared, scope, &mut messages, &mut after_commit, None);
                lambda(&mut init)?;
            }
            let count = messages.len();
            send_outgoing(shared, session.as_ref(), messages)?;
            Ok((count, after_commit))
        });

        match result {
            Ok((count, after_commit)) => {
                info!(messages = count, "Initiation committed");
                run_after_commit(after_commit);
                Ok(())
            }
            Err(err) => {
                if err.is_session_failure() {
                    warn!(error = %err, "Initiation failed on the broker session, discarding it");
                    session.close();
                    *slot = None;
                }
                Err(InitiateError::from(err))
            }
        }
    }

    /// Closes the initiator's broker session.
    pub fn close(&self) {
        if let Some(session) = lock(&self.session).take() {
            session.close();
        }
    }
}

pub(crate) fn run_after_commit(after_commit: Vec<AfterCommit>) {
    for work in after_commit {
        if let Err(e) = work() {
            warn!(error = %e, "Work registered to run after commit failed, ignoring");
        }
    }
}
