// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mapping between traces and broker map messages.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::info;

use crate::broker::{BrokerMessage, BrokerSession, MapMessage, MessageValue};
use crate::error::{RefuseMessage, TraceError};
use crate::factory::FactoryShared;
use crate::serializer::DeserializedTrace;
use crate::trace::Trace;

const PRIORITY_INTERACTIVE: u8 = 9;
const PRIORITY_NORMAL: u8 = 4;

/// A message produced by user code, sent when the transaction commits.
#[derive(Debug, Clone)]
pub(crate) struct OutgoingMessage {
    pub(crate) trace: Trace,
    pub(crate) bytes: BTreeMap<String, Vec<u8>>,
    pub(crate) strings: BTreeMap<String, String>,
}

/// A received message, validated and with its trace decoded.
#[derive(Debug, Clone)]
pub(crate) struct IncomingMessage {
    pub(crate) trace: Trace,
    pub(crate) trace_meta: String,
    pub(crate) trace_bytes: Vec<u8>,
    pub(crate) system_message_id: String,
    pub(crate) redelivery_count: u32,
    pub(crate) bytes: BTreeMap<String, Vec<u8>>,
    pub(crate) strings: BTreeMap<String, String>,
    pub(crate) millis_deserialization: f64,
}

/// Stages every message on `session`; they go out when the session commits.
pub(crate) fn send_outgoing(
    shared: &FactoryShared,
    session: &dyn BrokerSession,
    messages: Vec<OutgoingMessage>,
) -> anyhow::Result<()> {
    let meta_key = shared.config.trace_meta_key();
    for outgoing in messages {
        let call = outgoing
            .trace
            .current_call()
            .ok_or(TraceError::NoCurrentCall)?;
        let serialized = shared.serializer.serialize_trace(&outgoing.trace)?;
        let size = serialized.bytes.len();

        let mut message = MapMessage::new();
        message.set_bytes(shared.config.trace_key.clone(), serialized.bytes);
        message.set_string(meta_key.clone(), serialized.meta);
        for (key, value) in outgoing.bytes {
            message.set_bytes(key, value);
        }
        for (key, value) in outgoing.strings {
            message.set_string(key, value);
        }
        message.persistent = !outgoing.trace.is_non_persistent();
        message.priority = if outgoing.trace.is_interactive() {
            PRIORITY_INTERACTIVE
        } else {
            PRIORITY_NORMAL
        };
        let ttl = outgoing.trace.time_to_live_millis();
        message.time_to_live = (ttl > 0).then(|| Duration::from_millis(ttl));

        let destination = shared.destination_for(&call.to);
        let system_message_id = session.send(&destination, message)?;
        info!(
            call_type = %call.call_type,
            from = %call.from,
            to = %call.to.id,
            destination = %destination.name,
            mats_message_id = %call.message_id,
            system_message_id = %system_message_id,
            size,
            millis_serialization = serialized.millis_serialization,
            "SENDING message"
        );
    }
    Ok(())
}

/// Validates the envelope, decodes the trace and checks it is addressed to `stage_id`.
///
/// Any failure here is a poison message, hence [`RefuseMessage`].
pub(crate) fn read_incoming(
    shared: &FactoryShared,
    message: &BrokerMessage,
    stage_id: &str,
) -> Result<IncomingMessage, RefuseMessage> {
    let map = message.as_map().ok_or_else(|| {
        RefuseMessage::new(format!(
            "got {}, only MapMessage is a valid envelope",
            message.kind()
        ))
    })?;

    let trace_key = shared.config.trace_key.as_str();
    let meta_key = shared.config.trace_meta_key();
    let (trace_bytes, trace_meta) = match (map.bytes(trace_key), map.string(&meta_key)) {
        (Some(bytes), Some(meta)) => (bytes.to_vec(), meta.to_string()),
        _ => {
            return Err(RefuseMessage::new(format!(
                "MapMessage is missing '{trace_key}' or '{meta_key}'"
            )));
        }
    };

    let DeserializedTrace {
        trace,
        millis_deserialization,
        ..
    } = shared
        .serializer
        .deserialize_trace(&trace_bytes, &trace_meta)
        .map_err(|e| RefuseMessage::new(format!("could not deserialize trace: {e}")))?;

    let call = trace
        .current_call()
        .ok_or_else(|| RefuseMessage::new("trace has no current call"))?;
    if call.to.id != stage_id {
        return Err(RefuseMessage::new(format!(
            "message is addressed to '{}', but was received by stage '{stage_id}'",
            call.to.id
        )));
    }

    let mut bytes = BTreeMap::new();
    let mut strings = BTreeMap::new();
    for (key, value) in map.entries() {
        if key == trace_key || key == meta_key {
            continue;
        }
        match value {
            MessageValue::Bytes(b) => {
                bytes.insert(key.to_string(), b.clone());
            }
            MessageValue::Text(s) => {
                strings.insert(key.to_string(), s.clone());
            }
        }
    }

    Ok(IncomingMessage {
        trace,
        trace_meta,
        trace_bytes,
        system_message_id: map.message_id.clone(),
        redelivery_count: map.redelivery_count,
        bytes,
        strings,
        millis_deserialization,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::broker::{Destination, InMemoryBroker, MessageBroker};
    use crate::config::FactoryConfig;
    use crate::serializer::{JsonMatsSerializer, MatsSerializer};
    use crate::trace::{CallMeta, Channel, KeepTrace};
    use crate::transaction::TransactionManager;

    fn shared(broker: Arc<InMemoryBroker>) -> FactoryShared {
        FactoryShared {
            config: FactoryConfig::default(),
            broker,
            serializer: Arc::new(JsonMatsSerializer),
            transactions: TransactionManager::default(),
        }
    }

    fn send_trace(to: &str, interactive: bool, ttl: u64) -> Trace {
        Trace::new("T-env", "flow-env", KeepTrace::Full, ttl > 0, interactive, ttl, false)
            .add_send_call(
                "client",
                Channel::queue(to),
                Some("42".to_string()),
                None,
                CallMeta {
                    message_id: "flow-env_1_abcdefgh".to_string(),
                    debug: None,
                },
            )
            .unwrap()
    }

    fn envelope(shared: &FactoryShared, trace: &Trace) -> MapMessage {
        let serialized = shared.serializer.serialize_trace(trace).unwrap();
        let mut map = MapMessage::new();
        map.set_bytes(shared.config.trace_key.clone(), serialized.bytes);
        map.set_string(shared.config.trace_meta_key(), serialized.meta);
        map
    }

    #[test]
    fn test_send_outgoing_sets_envelope_and_qos() {
        let broker = Arc::new(InMemoryBroker::new());
        let shared = shared(broker.clone());
        let session = broker.create_session().unwrap();

        let mut bytes = BTreeMap::new();
        bytes.insert("pdf".to_string(), vec![1, 2, 3]);
        let mut strings = BTreeMap::new();
        strings.insert("note".to_string(), "hello".to_string());
        let outgoing = OutgoingMessage {
            trace: send_trace("Svc", true, 30_000),
            bytes,
            strings,
        };
        send_outgoing(&shared, session.as_ref(), vec![outgoing]).unwrap();
        assert_eq!(broker.queue_depth("mats.Svc"), 0, "sends wait for commit");
        session.commit().unwrap();
        assert_eq!(broker.queue_depth("mats.Svc"), 1);

        let consumer = session
            .create_consumer(&Destination::queue("mats.Svc"))
            .unwrap();
        let received = consumer.receive().unwrap().unwrap();
        let map = received.as_map().unwrap();
        assert_eq!(map.priority, PRIORITY_INTERACTIVE);
        assert!(!map.persistent);
        assert_eq!(map.time_to_live, Some(Duration::from_secs(30)));
        assert_eq!(map.string("mats:trace:meta"), Some("json"));
        assert_eq!(map.bytes("pdf"), Some(&[1u8, 2, 3][..]));
        assert_eq!(map.string("note"), Some("hello"));
        session.commit().unwrap();
    }

    #[test]
    fn test_read_incoming_extracts_trace_and_side_loads() {
        let broker = Arc::new(InMemoryBroker::new());
        let shared = shared(broker);
        let mut map = envelope(&shared, &send_trace("Svc", false, 0));
        map.set_string("note", "hello");
        map.set_bytes("blob", vec![9]);
        map.message_id = "ID:1".to_string();

        let incoming = read_incoming(&shared, &BrokerMessage::Map(map), "Svc").unwrap();
        assert_eq!(incoming.trace.trace_id(), "T-env");
        assert_eq!(incoming.system_message_id, "ID:1");
        assert_eq!(incoming.trace_meta, "json");
        assert_eq!(incoming.strings.get("note").map(String::as_str), Some("hello"));
        assert_eq!(incoming.bytes.get("blob"), Some(&vec![9]));
        assert!(!incoming.strings.contains_key("mats:trace:meta"));
    }

    #[test]
    fn test_read_incoming_refuses_non_map_messages() {
        let shared = shared(Arc::new(InMemoryBroker::new()));
        let refuse = read_incoming(&shared, &BrokerMessage::Text("hi".into()), "Svc").unwrap_err();
        assert!(refuse.reason.contains("TextMessage"));
    }

    #[test]
    fn test_read_incoming_refuses_missing_trace() {
        let shared = shared(Arc::new(InMemoryBroker::new()));
        let mut map = MapMessage::new();
        map.set_string("something", "else");
        let refuse = read_incoming(&shared, &BrokerMessage::Map(map), "Svc").unwrap_err();
        assert!(refuse.reason.contains("mats:trace"));
    }

    #[test]
    fn test_read_incoming_refuses_undecodable_trace() {
        let shared = shared(Arc::new(InMemoryBroker::new()));
        let mut map = MapMessage::new();
        map.set_bytes("mats:trace", b"{not json".to_vec());
        map.set_string("mats:trace:meta", "json");
        let refuse = read_incoming(&shared, &BrokerMessage::Map(map), "Svc").unwrap_err();
        assert!(refuse.reason.contains("could not deserialize trace"));
    }

    #[test]
    fn test_read_incoming_refuses_misaddressed_message() {
        let shared = shared(Arc::new(InMemoryBroker::new()));
        let map = envelope(&shared, &send_trace("Other", false, 0));
        let refuse = read_incoming(&shared, &BrokerMessage::Map(map), "Svc").unwrap_err();
        assert!(refuse.reason.contains("'Other'"));
    }
}
