// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The call trace carried in every message of a flow.
//!
//! A [`Trace`] is an append-only log of [`Call`]s plus an explicit state stack.
//! Request/reply over one-way messaging is implemented purely as data:
//!
//! - every call carries the *reply stack*, the pending return addresses;
//! - state frames are tagged with the stack height they belong to;
//! - the state of the stage about to process the current call is the most
//!   recent frame at the current height, as long as no frame of a *lower*
//!   height was pushed after it.
//!
//! The last rule is what keeps sibling requests from seeing each other's
//! leftovers without ever deleting history in FULL mode.
//!
//! Traces are values: the `add_*_call` methods consume the trace and return
//! the next version. Callers clone when one incoming trace fans out into
//! several outgoing messages.

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::error::TraceError;

/// Retention policy for call history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeepTrace {
    /// Every call with its data, every state frame.
    #[default]
    Full,
    /// Every call's metadata, but only the current call's data.
    Compact,
    /// Only the current call, only the state frames still needed.
    Minimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagingModel {
    Queue,
    Topic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    Request,
    Send,
    Next,
    Reply,
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "REQUEST",
            Self::Send => "SEND",
            Self::Next => "NEXT",
            Self::Reply => "REPLY",
        };
        f.write_str(name)
    }
}

/// A stage id plus how it is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub model: MessagingModel,
}

impl Channel {
    pub fn queue(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: MessagingModel::Queue,
        }
    }

    pub fn topic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: MessagingModel::Topic,
        }
    }
}

/// A serialized state object, tagged with the stack height it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackState {
    pub height: usize,
    pub state: Option<String>,
}

/// Who produced a call, for debugging a flow after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallDebugInfo {
    pub app_name: String,
    pub app_version: String,
    pub host: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

/// Identity of a call about to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMeta {
    pub message_id: String,
    pub debug: Option<CallDebugInfo>,
}

/// One hop of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub call_type: CallType,
    pub from: String,
    pub to: Channel,
    /// Serialized DTO. `None` once redacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Pending return addresses, innermost last.
    #[serde(default)]
    pub reply_stack: Vec<Channel>,
    pub call_number: u64,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<CallDebugInfo>,
}

impl Call {
    pub fn reply_stack_height(&self) -> usize {
        self.reply_stack.len()
    }
}

/// Who started the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorInfo {
    pub app_name: String,
    pub app_version: String,
    pub host: String,
    /// The `from` of the initiation, i.e. the initiator id or the initiating stage.
    pub initiator_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    trace_id: String,
    flow_id: String,
    #[serde(default)]
    keep_trace: KeepTrace,
    #[serde(default)]
    non_persistent: bool,
    #[serde(default)]
    interactive: bool,
    #[serde(default)]
    time_to_live_millis: u64,
    #[serde(default)]
    no_audit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    initiator: Option<InitiatorInfo>,
    #[serde(default)]
    call_number: u64,
    #[serde(default)]
    calls: Vec<Call>,
    #[serde(default)]
    stack_states: Vec<StackState>,
    #[serde(default)]
    trace_props: BTreeMap<String, String>,
}

impl Trace {
    /// A fresh trace with zero calls.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trace_id: impl Into<String>,
        flow_id: impl Into<String>,
        keep_trace: KeepTrace,
        non_persistent: bool,
        interactive: bool,
        time_to_live_millis: u64,
        no_audit: bool,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            flow_id: flow_id.into(),
            keep_trace,
            non_persistent,
            interactive,
            time_to_live_millis,
            no_audit,
            initiator: None,
            call_number: 0,
            calls: Vec::new(),
            stack_states: Vec::new(),
            trace_props: BTreeMap::new(),
        }
    }

    pub fn with_initiator(mut self, initiator: InitiatorInfo) -> Self {
        self.initiator = Some(initiator);
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn keep_trace(&self) -> KeepTrace {
        self.keep_trace
    }

    pub fn is_non_persistent(&self) -> bool {
        self.non_persistent
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn time_to_live_millis(&self) -> u64 {
        self.time_to_live_millis
    }

    pub fn is_no_audit(&self) -> bool {
        self.no_audit
    }

    pub fn initiator(&self) -> Option<&InitiatorInfo> {
        self.initiator.as_ref()
    }

    /// Number of calls ever added to this flow, including redacted ones.
    pub fn call_number(&self) -> u64 {
        self.call_number
    }

    /// The calls still retained under this trace's [`KeepTrace`] mode.
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn stack_states(&self) -> &[StackState] {
        &self.stack_states
    }

    pub fn current_call(&self) -> Option<&Call> {
        self.calls.last()
    }

    /// Height of the reply stack of the current call, 0 for a fresh trace.
    pub fn current_stack_height(&self) -> usize {
        self.current_call()
            .map(Call::reply_stack_height)
            .unwrap_or(0)
    }

    /// The state the stage receiving the current call starts with.
    pub fn current_state(&self) -> Option<&str> {
        let height = self.current_stack_height();
        for frame in self.stack_states.iter().rev() {
            if frame.height > height {
                continue;
            }
            if frame.height == height {
                return frame.state.as_deref();
            }
            return None;
        }
        None
    }

    pub fn trace_property(&self, key: &str) -> Option<&str> {
        self.trace_props.get(key).map(String::as_str)
    }

    pub fn trace_properties(&self) -> &BTreeMap<String, String> {
        &self.trace_props
    }

    /// Sets a serialized trace property; it rides along for the rest of the flow.
    pub fn set_trace_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.trace_props.insert(key.into(), value.into());
    }

    /// Appends a REQUEST: `to` is invoked, its reply will come back to `reply_to`
    /// carrying `reply_state`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_request_call(
        mut self,
        from: &str,
        to: Channel,
        reply_to: Channel,
        data: Option<String>,
        reply_state: Option<String>,
        initial_target_state: Option<String>,
        meta: CallMeta,
    ) -> Result<Self, TraceError> {
        validate_id(CallType::Request, "from", from)?;
        validate_id(CallType::Request, "to", &to.id)?;
        validate_id(CallType::Request, "replyTo", &reply_to.id)?;

        let mut reply_stack = self.current_reply_stack();
        // The reply state belongs to the frame we return to, below the new call.
        self.stack_states.push(StackState {
            height: reply_stack.len(),
            state: reply_state,
        });
        reply_stack.push(reply_to);
        if let Some(initial) = initial_target_state {
            self.stack_states.push(StackState {
                height: reply_stack.len(),
                state: Some(initial),
            });
        }
        self.push_call(CallType::Request, from, to, data, reply_stack, meta);
        Ok(self)
    }

    /// Appends a SEND (queue) or PUBLISH (topic). Nobody waits for a reply.
    pub fn add_send_call(
        mut self,
        from: &str,
        to: Channel,
        data: Option<String>,
        initial_target_state: Option<String>,
        meta: CallMeta,
    ) -> Result<Self, TraceError> {
        validate_id(CallType::Send, "from", from)?;
        validate_id(CallType::Send, "to", &to.id)?;

        let reply_stack = self.current_reply_stack();
        if let Some(initial) = initial_target_state {
            self.stack_states.push(StackState {
                height: reply_stack.len(),
                state: Some(initial),
            });
        }
        self.push_call(CallType::Send, from, to, data, reply_stack, meta);
        Ok(self)
    }

    /// Appends a NEXT to the following stage of the same endpoint, handing over `state`.
    pub fn add_next_call(
        mut self,
        from: &str,
        to: Channel,
        data: Option<String>,
        state: Option<String>,
        meta: CallMeta,
    ) -> Result<Self, TraceError> {
        validate_id(CallType::Next, "from", from)?;
        validate_id(CallType::Next, "to", &to.id)?;

        let reply_stack = self.current_reply_stack();
        self.stack_states.push(StackState {
            height: reply_stack.len(),
            state,
        });
        self.push_call(CallType::Next, from, to, data, reply_stack, meta);
        Ok(self)
    }

    /// Appends a REPLY to the innermost pending return address, popping it.
    pub fn add_reply_call(
        mut self,
        from: &str,
        data: Option<String>,
        meta: CallMeta,
    ) -> Result<Self, TraceError> {
        validate_id(CallType::Reply, "from", from)?;

        let mut reply_stack = self.current_reply_stack();
        let to = reply_stack.pop().ok_or(TraceError::EmptyStack)?;
        self.push_call(CallType::Reply, from, to, data, reply_stack, meta);
        Ok(self)
    }

    fn current_reply_stack(&self) -> Vec<Channel> {
        self.current_call()
            .map(|call| call.reply_stack.clone())
            .unwrap_or_default()
    }

    fn push_call(
        &mut self,
        call_type: CallType,
        from: &str,
        to: Channel,
        data: Option<String>,
        reply_stack: Vec<Channel>,
        meta: CallMeta,
    ) {
        self.call_number += 1;
        self.calls.push(Call {
            call_type,
            from: from.to_string(),
            to,
            data,
            reply_stack,
            call_number: self.call_number,
            message_id: meta.message_id,
            debug: meta.debug,
        });
        self.apply_retention();
    }

    fn apply_retention(&mut self) {
        match self.keep_trace {
            KeepTrace::Full => {}
            KeepTrace::Compact => {
                let last = self.calls.len().saturating_sub(1);
                for call in &mut self.calls[..last] {
                    call.data = None;
                    call.reply_stack.clear();
                }
                self.prune_stack_states();
            }
            KeepTrace::Minimal => {
                let keep_from = self.calls.len().saturating_sub(1);
                self.calls.drain(..keep_from);
                self.prune_stack_states();
            }
        }
    }

    /// Keeps exactly the frames [`current_state`](Self::current_state) can still
    /// reach now or after future replies: walking backwards, a frame survives
    /// only if its height is lower than every frame kept so far.
    fn prune_stack_states(&mut self) {
        let mut ceiling = self.current_stack_height() + 1;
        let mut kept = Vec::new();
        for frame in self.stack_states.drain(..).rev() {
            if frame.height < ceiling {
                ceiling = frame.height;
                kept.push(frame);
            }
            if ceiling == 0 {
                break;
            }
        }
        kept.reverse();
        self.stack_states = kept;
    }
}

fn validate_id(call_type: CallType, field: &'static str, value: &str) -> Result<(), TraceError> {
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(TraceError::MalformedCall {
            call_type,
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// A new globally unique flow id: `m_<uuid>_T<millis>`.
pub fn new_flow_id() -> String {
    format!(
        "m_{}_T{}",
        uuid::Uuid::new_v4().simple(),
        chrono::Utc::now().timestamp_millis()
    )
}

/// Message id of call number `call_number` within `flow_id`.
pub fn new_message_id(flow_id: &str, call_number: u64) -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{flow_id}_{call_number}_{random}")
}
