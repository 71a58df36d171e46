// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire encoding of traces, DTOs and state objects.

use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::TraceError;
use crate::trace::Trace;

/// Encoding tag of [`JsonMatsSerializer`].
pub const META_JSON: &str = "json";

/// A trace ready to be put into a message.
#[derive(Debug, Clone)]
pub struct SerializedTrace {
    pub bytes: Vec<u8>,
    /// Short encoding tag, readable without decoding `bytes`.
    pub meta: String,
    pub millis_serialization: f64,
}

#[derive(Debug, Clone)]
pub struct DeserializedTrace {
    pub trace: Trace,
    pub size_incoming: usize,
    pub millis_deserialization: f64,
}

/// Turns traces into bytes and back.
pub trait MatsSerializer: Send + Sync {
    fn serialize_trace(&self, trace: &Trace) -> Result<SerializedTrace, TraceError>;

    fn deserialize_trace(&self, bytes: &[u8], meta: &str) -> Result<DeserializedTrace, TraceError>;
}

/// Plain JSON, no compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMatsSerializer;

impl MatsSerializer for JsonMatsSerializer {
    fn serialize_trace(&self, trace: &Trace) -> Result<SerializedTrace, TraceError> {
        let started = Instant::now();
        let bytes = serde_json::to_vec(trace)?;
        Ok(SerializedTrace {
            bytes,
            meta: META_JSON.to_string(),
            millis_serialization: millis_since(started),
        })
    }

    fn deserialize_trace(&self, bytes: &[u8], meta: &str) -> Result<DeserializedTrace, TraceError> {
        if meta != META_JSON {
            return Err(TraceError::UnknownMeta(meta.to_string()));
        }
        let started = Instant::now();
        let trace = serde_json::from_slice(bytes)?;
        Ok(DeserializedTrace {
            trace,
            size_incoming: bytes.len(),
            millis_deserialization: millis_since(started),
        })
    }
}

/// Serializes a DTO or state object for embedding in a trace.
pub fn serialize_object<T: Serialize + ?Sized>(value: &T) -> Result<String, TraceError> {
    Ok(serde_json::to_string(value)?)
}

/// Deserializes a DTO; a missing payload is read as JSON `null`.
pub fn deserialize_object<T: DeserializeOwned>(data: Option<&str>) -> Result<T, TraceError> {
    Ok(serde_json::from_str(data.unwrap_or("null"))?)
}

/// Deserializes a state object; no state at all yields `S::default()`.
pub fn deserialize_state<S: DeserializeOwned + Default>(state: Option<&str>) -> Result<S, TraceError> {
    match state {
        None | Some("null") => Ok(S::default()),
        Some(json) => Ok(serde_json::from_str(json)?),
    }
}

pub(crate) fn millis_since(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{CallMeta, Channel, KeepTrace};
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct StateTo {
        counter: i32,
    }

    #[test]
    fn test_trace_roundtrip_through_json() {
        let trace = Trace::new("T", "F", KeepTrace::Full, false, false, 0, false)
            .add_send_call(
                "Init",
                Channel::queue("E"),
                Some("1".into()),
                None,
                CallMeta {
                    message_id: "m1".into(),
                    debug: None,
                },
            )
            .unwrap();
        let serializer = JsonMatsSerializer;
        let serialized = serializer.serialize_trace(&trace).unwrap();
        assert_eq!(serialized.meta, META_JSON);

        let back = serializer
            .deserialize_trace(&serialized.bytes, &serialized.meta)
            .unwrap();
        assert_eq!(back.trace, trace);
        assert_eq!(back.size_incoming, serialized.bytes.len());
    }

    #[test]
    fn test_unknown_meta_rejected() {
        let err = JsonMatsSerializer
            .deserialize_trace(b"{}", "json;zip")
            .unwrap_err();
        assert!(matches!(err, TraceError::UnknownMeta(m) if m == "json;zip"));
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        let err = JsonMatsSerializer
            .deserialize_trace(b"not json", META_JSON)
            .unwrap_err();
        assert!(matches!(err, TraceError::Serialization(_)));
    }

    #[test]
    fn test_missing_state_is_default() {
        let state: StateTo = deserialize_state(None).unwrap();
        assert_eq!(state, StateTo::default());
        let state: StateTo = deserialize_state(Some("null")).unwrap();
        assert_eq!(state, StateTo::default());
        let state: StateTo = deserialize_state(Some("{\"counter\":3}")).unwrap();
        assert_eq!(state.counter, 3);
    }

    #[test]
    fn test_missing_dto_reads_as_null() {
        let dto: Option<StateTo> = deserialize_object(None).unwrap();
        assert!(dto.is_none());
        deserialize_object::<()>(None).unwrap();
    }
}
