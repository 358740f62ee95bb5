use std::sync::Arc;

use serde_json::{json, Value};

use super::clock::Timestamp;
use super::metadata::EventDescriptor;
use super::value::{
    FieldValue, StructValue, EVENT_CONTEXT, EVENT_FIELDS, STREAM_EVENT_CONTEXT,
    STREAM_EVENT_HEADER, STREAM_PACKET_CONTEXT, TRACE_PACKET_HEADER,
};

/// Framing of one packet, shared by every event decoded from it.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    /// Position of the packet within its stream, from zero.
    pub ordinal: u64,
    pub stream_id: u64,
    /// Byte offset of the packet start within the stream.
    pub offset: u64,
    pub total_bits: Option<u64>,
    pub content_bits: Option<u64>,
    pub header: Option<StructValue>,
    pub context: Option<StructValue>,
    pub begin: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

/// The packet a cursor is currently reading events from.
#[derive(Debug)]
pub(crate) struct Packet {
    pub info: Arc<PacketInfo>,
    pub events: u64,
}

impl Packet {
    pub fn new(info: PacketInfo) -> Self {
        Self {
            info: Arc::new(info),
            events: 0,
        }
    }

    /// Bits of the packet that hold events.
    pub fn content_bits(&self) -> Option<u64> {
        self.info.content_bits
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub descriptor: Arc<EventDescriptor>,
    pub header: Option<StructValue>,
    pub stream_context: Option<StructValue>,
    pub context: Option<StructValue>,
    pub payload: Option<StructValue>,
    pub timestamp: Timestamp,
}

impl Event {
    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Payload field at a dotted path.
    pub fn field(&self, path: &str) -> Option<&FieldValue> {
        self.payload.as_ref()?.find(path)
    }

    /// Resolves a path the way it would resolve while decoding the payload:
    /// absolute paths name a dynamic scope, relative ones are searched from
    /// the payload outwards to the packet header.
    pub fn find<'a>(&'a self, packet: &'a PacketInfo, path: &str) -> Option<&'a FieldValue> {
        let scopes = [
            (EVENT_FIELDS, self.payload.as_ref()),
            (EVENT_CONTEXT, self.context.as_ref()),
            (STREAM_EVENT_CONTEXT, self.stream_context.as_ref()),
            (STREAM_EVENT_HEADER, self.header.as_ref()),
            (STREAM_PACKET_CONTEXT, packet.context.as_ref()),
            (TRACE_PACKET_HEADER, packet.header.as_ref()),
        ];

        for (name, fields) in scopes {
            if let Some(rest) = path.strip_prefix(name).and_then(|r| r.strip_prefix('.')) {
                return fields?.find(rest);
            }
        }
        scopes
            .iter()
            .filter_map(|(_, fields)| *fields)
            .find_map(|fields| fields.find(path))
    }

    pub fn to_json(&self) -> Value {
        let scope = |fields: &Option<StructValue>| {
            fields.as_ref().map_or(Value::Null, StructValue::to_json)
        };
        json!({
            "name": self.name(),
            "id": self.id(),
            "timestamp_ns": self.timestamp.ns(),
            "timestamp_raw": self.timestamp.raw(),
            "clock": self.timestamp.clock().name,
            "header": scope(&self.header),
            "stream_context": scope(&self.stream_context),
            "context": scope(&self.context),
            "payload": scope(&self.payload),
        })
    }
}
