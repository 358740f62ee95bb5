//! Producer-specific framing.
//!
//! Where the packet size lives, how an event names its descriptor and how
//! its timestamp is encoded all vary between tracers. The cursor asks a
//! [`TraceHook`] for each of these; [`StandardHook`] implements the field
//! names conventional in CTF 1.8 traces.

use std::path::Path;
use std::sync::Arc;

use super::clock::Timestamp;
use super::error::{CtfError, Result};
use super::metadata::{EventDescriptor, Metadata, StreamClass};
use super::value::{IntegerValue, StructValue};

/// Packet header magic number of CTF 1.8.
pub const CTF_MAGIC: u64 = 0xC1FC_1FC1;

const EVENT_ID_PATHS: [&str; 2] = ["v.extended.id", "id"];
const TIMESTAMP_PATHS: [&str; 3] = ["timestamp", "v.extended.timestamp", "v.compact.timestamp"];

/// Packet length as declared by its header or context, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketBits {
    /// `None` means the packet runs to the end of the stream.
    pub total: Option<u64>,
    /// Bits holding events; the rest of the packet is padding.
    pub content: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct PacketTimestamps {
    pub begin: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

pub trait TraceHook: Send + Sync {
    fn parse_metadata(&self, path: &Path) -> Result<Metadata> {
        Metadata::load(path)
    }

    /// Rejects packets whose header is not from this producer.
    fn check_packet_header(&self, _header: Option<&StructValue>) -> Result<()> {
        Ok(())
    }

    fn stream_id(&self, header: Option<&StructValue>, metadata: &Metadata) -> Result<u64>;

    fn packet_bits(
        &self,
        header: Option<&StructValue>,
        context: Option<&StructValue>,
    ) -> Result<PacketBits>;

    fn packet_timestamps(
        &self,
        context: Option<&StructValue>,
        metadata: &Metadata,
    ) -> Result<PacketTimestamps>;

    fn event_descriptor(
        &self,
        header: Option<&StructValue>,
        stream: &StreamClass,
    ) -> Result<Arc<EventDescriptor>>;

    /// `previous` is the last timestamp seen on this stream, or the packet's
    /// begin timestamp for its first event.
    fn event_timestamp(
        &self,
        header: Option<&StructValue>,
        previous: Option<&Timestamp>,
        metadata: &Metadata,
    ) -> Result<Timestamp>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardHook;

impl TraceHook for StandardHook {
    fn check_packet_header(&self, header: Option<&StructValue>) -> Result<()> {
        if let Some(magic) = header.and_then(|h| h.integer("magic")) {
            if magic.as_u64() != CTF_MAGIC {
                return Err(CtfError::corrupt(format!(
                    "packet magic {:#x} is not {CTF_MAGIC:#x}",
                    magic.as_u64()
                )));
            }
        }
        Ok(())
    }

    fn stream_id(&self, header: Option<&StructValue>, metadata: &Metadata) -> Result<u64> {
        if let Some(id) = header.and_then(|h| h.integer("stream_id")) {
            return Ok(id.as_u64());
        }
        let mut streams = metadata.streams();
        match (streams.next(), streams.next()) {
            (Some(only), None) => Ok(only.id),
            _ => Err(CtfError::corrupt(format!(
                "packet header has no stream_id and the trace declares {} stream classes",
                metadata.streams().count()
            ))),
        }
    }

    fn packet_bits(
        &self,
        _header: Option<&StructValue>,
        context: Option<&StructValue>,
    ) -> Result<PacketBits> {
        let total = context
            .and_then(|c| c.integer("packet_size"))
            .map(IntegerValue::as_u64);
        let content = context
            .and_then(|c| c.integer("content_size"))
            .map(IntegerValue::as_u64)
            .or(total);

        if let (Some(total), Some(content)) = (total, content) {
            if content > total {
                return Err(CtfError::corrupt(format!(
                    "packet content of {content} bits exceeds packet size of {total} bits"
                )));
            }
        }
        Ok(PacketBits { total, content })
    }

    fn packet_timestamps(
        &self,
        context: Option<&StructValue>,
        metadata: &Metadata,
    ) -> Result<PacketTimestamps> {
        let read = |name: &str| -> Result<Option<Timestamp>> {
            context
                .and_then(|c| c.integer(name))
                .map(|value| -> Result<Timestamp> {
                    let clock = metadata.resolve_clock(value.clock_map())?;
                    Ok(Timestamp::new(value.as_u64(), clock))
                })
                .transpose()
        };
        Ok(PacketTimestamps {
            begin: read("timestamp_begin")?,
            end: read("timestamp_end")?,
        })
    }

    fn event_descriptor(
        &self,
        header: Option<&StructValue>,
        stream: &StreamClass,
    ) -> Result<Arc<EventDescriptor>> {
        let id = header
            .and_then(|h| EVENT_ID_PATHS.iter().find_map(|path| h.integer(path)))
            .map(IntegerValue::as_u64);

        match id {
            Some(id) => stream.event(id).cloned().ok_or_else(|| {
                CtfError::corrupt(format!(
                    "unknown event id {id} in stream class {}",
                    stream.id
                ))
            }),
            None => {
                let mut events = stream.events();
                match (events.next(), events.next()) {
                    (Some(only), None) => Ok(Arc::clone(only)),
                    _ => Err(CtfError::corrupt(format!(
                        "event header has no id and stream class {} declares several events",
                        stream.id
                    ))),
                }
            }
        }
    }

    fn event_timestamp(
        &self,
        header: Option<&StructValue>,
        previous: Option<&Timestamp>,
        metadata: &Metadata,
    ) -> Result<Timestamp> {
        let field = header.and_then(|h| TIMESTAMP_PATHS.iter().find_map(|path| h.integer(path)));
        let Some(value) = field else {
            return previous.cloned().ok_or_else(|| {
                CtfError::corrupt("event header has no timestamp and no earlier one is known")
            });
        };

        let clock = metadata.resolve_clock(value.clock_map())?;
        let previous_raw = previous
            .filter(|p| p.clock().name == clock.name)
            .map(Timestamp::raw);
        let raw = extend_timestamp(value.as_u64(), value.size(), previous_raw);
        Ok(Timestamp::new(raw, clock))
    }
}

/// Widens a truncated clock reading using the previous full reading,
/// assuming less than one wrap-around happened in between.
fn extend_timestamp(raw: u64, size: u32, previous: Option<u64>) -> u64 {
    let Some(previous) = previous else {
        return raw;
    };
    if size >= 64 {
        return raw;
    }

    let mask = (1u64 << size) - 1;
    let value = (previous & !mask) | (raw & mask);
    if value < previous {
        value.wrapping_add(1u64 << size)
    } else {
        value
    }
}
