// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! What a stage lambda can do while processing one message.
//!
//! Nothing is sent while the lambda runs. Requests, nexts and replies are
//! recorded and turned into outgoing traces only after the lambda returned,
//! so they carry the state object as it was at that point. The processor
//! then hands them to the broker inside the same transaction.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::envelope::{IncomingMessage, OutgoingMessage};
use crate::error::{MatsError, RefuseMessage, TraceError};
use crate::factory::FactoryShared;
use crate::initiate::{InitiateParent, MatsInitiate, MessageReference};
use crate::serializer::{deserialize_object, serialize_object};
use crate::stage::StageInfo;
use crate::trace::{CallMeta, Channel, Trace, new_message_id};
use crate::transaction::TransactionScope;

/// Work deferred until the transaction has committed.
pub(crate) type AfterCommit = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Reply type of endpoints that never reply. Uninhabited, so a
/// `ProcessContext<NoReply>` offers no `reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoReply {}

enum FlowCall {
    Request {
        to: String,
        reply_to: String,
        initial_state: Option<String>,
    },
    Next {
        to: String,
    },
    Reply,
}

struct PendingFlow {
    call: FlowCall,
    data: String,
    message_id: String,
    props: BTreeMap<String, String>,
    bytes: BTreeMap<String, Vec<u8>>,
    strings: BTreeMap<String, String>,
}

enum Produced {
    Flow(PendingFlow),
    Ready(OutgoingMessage),
}

pub(crate) struct ProcessOutcome {
    pub(crate) messages: Vec<OutgoingMessage>,
    pub(crate) after_commit: Vec<AfterCommit>,
}

pub struct ProcessContext<'a, R> {
    stage: &'a StageInfo,
    shared: &'a FactoryShared,
    incoming: &'a IncomingMessage,
    scope: &'a TransactionScope<'a>,
    props: BTreeMap<String, String>,
    out_bytes: BTreeMap<String, Vec<u8>>,
    out_strings: BTreeMap<String, String>,
    produced: Vec<Produced>,
    after_commit: Vec<AfterCommit>,
    _reply: PhantomData<fn(R)>,
}

impl<'a, R> ProcessContext<'a, R> {
    pub(crate) fn new(
        stage: &'a StageInfo,
        shared: &'a FactoryShared,
        incoming: &'a IncomingMessage,
        scope: &'a TransactionScope<'a>,
    ) -> Self {
        Self {
            stage,
            shared,
            incoming,
            scope,
            props: BTreeMap::new(),
            out_bytes: BTreeMap::new(),
            out_strings: BTreeMap::new(),
            produced: Vec::new(),
            after_commit: Vec::new(),
            _reply: PhantomData,
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.stage.endpoint_id
    }

    pub fn stage_id(&self) -> &str {
        &self.stage.stage_id
    }

    pub fn next_stage_id(&self) -> Option<&str> {
        self.stage.next_stage_id.as_deref()
    }

    /// The stage or initiator that sent the message being processed.
    pub fn from_stage_id(&self) -> &str {
        self.incoming
            .trace
            .current_call()
            .map_or("", |call| call.from.as_str())
    }

    pub fn trace_id(&self) -> &str {
        self.incoming.trace.trace_id()
    }

    pub fn flow_id(&self) -> &str {
        self.incoming.trace.flow_id()
    }

    /// Broker-assigned id of the incoming message.
    pub fn system_message_id(&self) -> &str {
        &self.incoming.system_message_id
    }

    /// Mats message id of the incoming call.
    pub fn mats_message_id(&self) -> &str {
        self.incoming
            .trace
            .current_call()
            .map_or("", |call| call.message_id.as_str())
    }

    pub fn redelivery_count(&self) -> u32 {
        self.incoming.redelivery_count
    }

    /// The trace as received, for debugging and assertions.
    pub fn trace(&self) -> &Trace {
        &self.incoming.trace
    }

    /// Binary side-load of the incoming message.
    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.incoming.bytes.get(key).map(Vec::as_slice)
    }

    /// String side-load of the incoming message.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.incoming.strings.get(key).map(String::as_str)
    }

    /// Attaches a binary side-load to every message produced after this call.
    pub fn add_bytes(&mut self, key: impl Into<String>, payload: Vec<u8>) {
        self.out_bytes.insert(key.into(), payload);
    }

    pub fn add_string(&mut self, key: impl Into<String>, payload: impl Into<String>) {
        self.out_strings.insert(key.into(), payload.into());
    }

    /// Reads a trace property, preferring one set earlier in this stage.
    pub fn trace_property<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TraceError> {
        let raw = self
            .props
            .get(name)
            .map(String::as_str)
            .or_else(|| self.incoming.trace.trace_property(name));
        raw.map(|json| deserialize_object(Some(json))).transpose()
    }

    /// Sets a trace property on every message produced after this call,
    /// including initiations from this stage.
    pub fn set_trace_property<T: Serialize + ?Sized>(&mut self, name: impl Into<String>, value: &T) -> Result<(), TraceError> {
        self.props.insert(name.into(), serialize_object(value)?);
        Ok(())
    }

    /// The open transaction of the external resource, if it is a `T`.
    pub fn resource<T: 'static>(&self) -> Option<&'a T> {
        self.scope.resource::<T>()
    }

    /// Builds the error that refuses the message: no redelivery, straight to the DLQ.
    pub fn refuse(&self, reason: impl Into<String>) -> anyhow::Error {
        RefuseMessage::new(reason).into()
    }

    /// Runs `work` after the transaction committed. Failures are logged, not propagated.
    pub fn do_after_commit<F>(&mut self, work: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.after_commit.push(Box::new(work));
    }

    /// Invokes `endpoint_id`; its reply arrives at the next stage with the
    /// state this stage ends with.
    pub fn request<T: Serialize + ?Sized>(&mut self, endpoint_id: &str, dto: &T) -> Result<MessageReference, MatsError> {
        self.request_internal(endpoint_id, dto, None)
    }

    /// Like [`request`](Self::request), also seeding the target endpoint's initial state.
    pub fn request_with_initial_state<T, S>(
        &mut self,
        endpoint_id: &str,
        dto: &T,
        initial_target_state: &S,
    ) -> Result<MessageReference, MatsError>
    where
        T: Serialize + ?Sized,
        S: Serialize + ?Sized,
    {
        let initial = serialize_object(initial_target_state)?;
        self.request_internal(endpoint_id, dto, Some(initial))
    }

    fn request_internal<T: Serialize + ?Sized>(
        &mut self,
        endpoint_id: &str,
        dto: &T,
        initial_state: Option<String>,
    ) -> Result<MessageReference, MatsError> {
        let reply_to = self.require_next_stage()?;
        self.push_flow(
            FlowCall::Request {
                to: endpoint_id.to_string(),
                reply_to,
                initial_state,
            },
            dto,
        )
    }

    /// Passes `dto` on to the next stage of this endpoint.
    pub fn next<T: Serialize + ?Sized>(&mut self, dto: &T) -> Result<MessageReference, MatsError> {
        let to = self.require_next_stage()?;
        self.push_flow(FlowCall::Next { to }, dto)
    }

    /// Starts new flows from inside this stage.
    ///
    /// Trace ids given to the builder are appended to this flow's trace id,
    /// and trace properties set so far are inherited. The messages commit
    /// together with this stage's transaction.
    pub fn initiate<F>(&mut self, lambda: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut MatsInitiate<'_>) -> anyhow::Result<()>,
    {
        let incoming = self.incoming;
        let stage = self.stage;
        let mut props = incoming.trace.trace_properties().clone();
        props.extend(self.props.iter().map(|(k, v)| (k.clone(), v.clone())));
        let parent = InitiateParent {
            trace: &incoming.trace,
            stage_id: &stage.stage_id,
            props: &props,
        };
        let mut messages = Vec::new();
        {
            let mut init = MatsInitiate::new(
                self.shared,
                self.scope,
                &mut messages,
                &mut self.after_commit,
                Some(parent),
            );
            lambda(&mut init)?;
        }
        self.produced
            .extend(messages.into_iter().map(Produced::Ready));
        Ok(())
    }

    /// Serializes everything needed to resume this stage later via
    /// [`MatsInitiate::unstash`]. Typically stored by user code, after which the
    /// stage returns without producing a message.
    pub fn stash(&self) -> Vec<u8> {
        crate::stash::StashedContext {
            endpoint_id: self.stage.endpoint_id.clone(),
            stage_id: self.stage.stage_id.clone(),
            next_stage_id: self.stage.next_stage_id.clone(),
            trace_meta: self.incoming.trace_meta.clone(),
            message_id: self.incoming.system_message_id.clone(),
            trace_bytes: self.incoming.trace_bytes.clone(),
        }
        .encode()
    }

    fn require_next_stage(&self) -> Result<String, MatsError> {
        self.stage
            .next_stage_id
            .clone()
            .ok_or_else(|| MatsError::NoNextStage {
                stage_id: self.stage.stage_id.clone(),
            })
    }

    fn push_flow<T: Serialize + ?Sized>(&mut self, call: FlowCall, dto: &T) -> Result<MessageReference, MatsError> {
        let trace = &self.incoming.trace;
        let message_id = new_message_id(trace.flow_id(), trace.call_number() + 1);
        self.produced.push(Produced::Flow(PendingFlow {
            call,
            data: serialize_object(dto)?,
            message_id: message_id.clone(),
            props: self.props.clone(),
            bytes: self.out_bytes.clone(),
            strings: self.out_strings.clone(),
        }));
        Ok(MessageReference::new(message_id))
    }

    /// Turns recorded flow calls into outgoing traces, embedding `state`.
    pub(crate) fn finish<S: Serialize + ?Sized>(self, state: &S) -> Result<ProcessOutcome, TraceError> {
        let needs_state = self.produced.iter().any(|p| {
            matches!(
                p,
                Produced::Flow(PendingFlow {
                    call: FlowCall::Request { .. } | FlowCall::Next { .. },
                    ..
                })
            )
        });
        let state_json = if needs_state {
            Some(serialize_object(state)?)
        } else {
            None
        };

        let from = self.stage.stage_id.as_str();
        let mut messages = Vec::with_capacity(self.produced.len());
        for produced in self.produced {
            let flow = match produced {
                Produced::Ready(message) => {
                    messages.push(message);
                    continue;
                }
                Produced::Flow(flow) => flow,
            };
            let mut trace = self.incoming.trace.clone();
            for (key, value) in flow.props {
                trace.set_trace_property(key, value);
            }
            let meta = CallMeta {
                message_id: flow.message_id,
                debug: Some(self.shared.debug_info()),
            };
            let data = Some(flow.data);
            let trace = match flow.call {
                FlowCall::Request {
                    to,
                    reply_to,
                    initial_state,
                } => trace.add_request_call(
                    from,
                    Channel::queue(to),
                    Channel::queue(reply_to),
                    data,
                    state_json.clone(),
                    initial_state,
                    meta,
                )?,
                FlowCall::Next { to } => {
                    trace.add_next_call(from, Channel::queue(to), data, state_json.clone(), meta)?
                }
                FlowCall::Reply => trace.add_reply_call(from, data, meta)?,
            };
            messages.push(OutgoingMessage {
                trace,
                bytes: flow.bytes,
                strings: flow.strings,
            });
        }

        Ok(ProcessOutcome {
            messages,
            after_commit: self.after_commit,
        })
    }
}

impl<R: Serialize> ProcessContext<'_, R> {
    /// Replies to whoever requested this endpoint.
    ///
    /// When nobody is waiting (the flow was started with a send), the reply is
    /// dropped and `None` is returned.
    pub fn reply(&mut self, dto: &R) -> Result<Option<MessageReference>, MatsError> {
        if self.incoming.trace.current_stack_height() == 0 {
            info!(
                stage_id = %self.stage.stage_id,
                "Stage replied, but the reply stack is empty: dropping the reply"
            );
            return Ok(None);
        }
        self.push_flow(FlowCall::Reply, dto).map(Some)
    }
}
