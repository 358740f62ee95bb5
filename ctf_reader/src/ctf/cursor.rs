//! Per-stream event iteration.
//!
//! [`SyncCursor`] frames packets and decodes events on the calling thread.
//! [`ReadAheadCursor`] runs a `SyncCursor` on a worker thread and hands
//! decoded events over a bounded channel.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, never, select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::bits::BitReader;
use super::clock::Timestamp;
use super::error::{CtfError, Result};
use super::hook::TraceHook;
use super::metadata::Metadata;
use super::packet::{Event, Packet, PacketInfo};
use super::source::{StreamInfo, TraceStream};
use super::types::StructType;
use super::value::{
    Scope, StructValue, EVENT_CONTEXT, EVENT_FIELDS, STREAM_EVENT_CONTEXT, STREAM_EVENT_HEADER,
    STREAM_PACKET_CONTEXT, TRACE_PACKET_HEADER,
};

/// Events a read-ahead worker may decode before the consumer takes them.
pub const READ_AHEAD_CAPACITY: usize = 20;

/// A decoded event with the packet it came from.
#[derive(Debug, Clone)]
pub struct CursorItem {
    pub event: Event,
    pub packet: Arc<PacketInfo>,
    /// Stream bytes consumed once this event was decoded.
    pub bytes_consumed: u64,
}

pub trait StreamCursor: Send {
    /// Moves to the next event. `Ok(false)` once the stream is exhausted.
    fn advance(&mut self) -> Result<bool>;

    fn current(&self) -> Option<&CursorItem>;

    fn bytes_consumed(&self) -> u64;

    fn stream(&self) -> &Arc<StreamInfo>;
}

/// Cooperative cancellation shared by the merge loop and read-ahead workers.
///
/// Blocked channel operations observe cancellation through [`signal`],
/// which becomes ready (disconnected) once [`cancel`] is called.
///
/// [`signal`]: CancellationToken::signal
/// [`cancel`]: CancellationToken::cancel
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    NoPacket,
    WithinPacket,
    EndOfStream,
}

pub struct SyncCursor {
    stream: Arc<StreamInfo>,
    reader: BitReader<Box<dyn Read + Send>>,
    metadata: Arc<Metadata>,
    hook: Arc<dyn TraceHook>,
    state: CursorState,
    packet: Option<Packet>,
    packets: u64,
    previous: Option<Timestamp>,
    current: Option<CursorItem>,
}

impl SyncCursor {
    pub fn new(
        stream: TraceStream,
        stream_info: Arc<StreamInfo>,
        metadata: Arc<Metadata>,
        hook: Arc<dyn TraceHook>,
    ) -> Self {
        let (_, _, reader) = stream.into_parts();
        Self::with_reader(BitReader::new(reader), stream_info, metadata, hook)
    }

    pub fn with_reader(
        reader: BitReader<Box<dyn Read + Send>>,
        stream: Arc<StreamInfo>,
        metadata: Arc<Metadata>,
        hook: Arc<dyn TraceHook>,
    ) -> Self {
        Self {
            stream,
            reader,
            metadata,
            hook,
            state: CursorState::NoPacket,
            packet: None,
            packets: 0,
            previous: None,
            current: None,
        }
    }

    pub fn take_current(&mut self) -> Option<CursorItem> {
        self.current.take()
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Decodes the packet header and context, declaring the packet length
    /// to the reader. `Ok(false)` at the end of the stream.
    fn frame_packet(&mut self) -> Result<bool> {
        if self.reader.end_of_stream()? {
            return Ok(false);
        }

        let metadata = Arc::clone(&self.metadata);
        let offset = self.reader.bytes_consumed();
        self.reader.begin_packet();

        let header = decode_scope(
            &mut self.reader,
            metadata.packet_header(),
            TRACE_PACKET_HEADER,
            None,
        )?;
        self.hook.check_packet_header(header.as_ref())?;
        let stream_id = self.hook.stream_id(header.as_ref(), &metadata)?;
        let class = metadata.stream(stream_id).ok_or_else(|| {
            CtfError::corrupt(format!(
                "packet at byte {offset} refers to undeclared stream class {stream_id}"
            ))
        })?;

        let context = {
            let header_scope = scope_of(TRACE_PACKET_HEADER, header.as_ref(), None);
            decode_scope(
                &mut self.reader,
                class.packet_context.as_ref(),
                STREAM_PACKET_CONTEXT,
                header_scope.as_ref(),
            )?
        };

        let bits = self.hook.packet_bits(header.as_ref(), context.as_ref())?;
        if let Some(total) = bits.total {
            self.reader.set_packet_bits(total)?;
        }
        let timestamps = self.hook.packet_timestamps(context.as_ref(), &metadata)?;
        if let Some(begin) = &timestamps.begin {
            self.previous = Some(begin.clone());
        }

        debug!(
            stream = %self.stream.name,
            packet = self.packets,
            offset,
            total_bits = ?bits.total,
            content_bits = ?bits.content,
            "framed packet"
        );
        self.packet = Some(Packet::new(PacketInfo {
            ordinal: self.packets,
            stream_id,
            offset,
            total_bits: bits.total,
            content_bits: bits.content,
            header,
            context,
            begin: timestamps.begin,
            end: timestamps.end,
        }));
        self.packets += 1;
        Ok(true)
    }

    fn packet_exhausted(&mut self) -> Result<bool> {
        let Some(packet) = &self.packet else {
            return Ok(true);
        };
        match packet.content_bits().or(self.reader.bits_in_packet()) {
            Some(content) => Ok(self.reader.bits_read_from_packet() >= content),
            None => self.reader.end_of_stream(),
        }
    }

    /// Skips the packet padding so the reader sits on the next packet.
    fn finish_packet(&mut self) -> Result<()> {
        if let Some(total) = self.reader.bits_in_packet() {
            let read = self.reader.bits_read_from_packet();
            self.reader.skip_bits(total - read)?;
        }
        if !self.reader.is_byte_aligned() {
            return Err(CtfError::corrupt(format!(
                "packet {} of stream {} does not end on a byte boundary",
                self.packets.saturating_sub(1),
                self.stream.name
            )));
        }
        if let Some(packet) = self.packet.take() {
            debug!(stream = %self.stream.name, packet = packet.info.ordinal, events = packet.events, "packet done");
        }
        self.reader.end_packet();
        Ok(())
    }

    fn read_event(&mut self) -> Result<CursorItem> {
        let metadata = Arc::clone(&self.metadata);
        let info = match &self.packet {
            Some(packet) => Arc::clone(&packet.info),
            None => return Err(CtfError::corrupt("event read outside of a packet")),
        };
        let class = metadata.stream(info.stream_id).ok_or_else(|| {
            CtfError::corrupt(format!("undeclared stream class {}", info.stream_id))
        })?;
        let start = self.reader.bit_position();
        let reader = &mut self.reader;

        let packet_header = scope_of(TRACE_PACKET_HEADER, info.header.as_ref(), None);
        let packet_context = scope_of(STREAM_PACKET_CONTEXT, info.context.as_ref(), packet_header.as_ref());
        let tail = packet_context.as_ref().or(packet_header.as_ref());

        let header = decode_scope(reader, class.event_header.as_ref(), STREAM_EVENT_HEADER, tail)?;
        let header_scope = scope_of(STREAM_EVENT_HEADER, header.as_ref(), tail);
        let tail = header_scope.as_ref().or(tail);

        let stream_context = decode_scope(reader, class.event_context.as_ref(), STREAM_EVENT_CONTEXT, tail)?;
        let stream_context_scope = scope_of(STREAM_EVENT_CONTEXT, stream_context.as_ref(), tail);
        let tail = stream_context_scope.as_ref().or(tail);

        let descriptor = self.hook.event_descriptor(header.as_ref(), class)?;
        let context = decode_scope(reader, descriptor.context.as_ref(), EVENT_CONTEXT, tail)?;
        let context_scope = scope_of(EVENT_CONTEXT, context.as_ref(), tail);
        let tail = context_scope.as_ref().or(tail);

        let payload = decode_scope(reader, descriptor.fields.as_ref(), EVENT_FIELDS, tail)?;

        if reader.bit_position() == start {
            return Err(CtfError::corrupt(format!(
                "event '{}' in stream {} occupies no bits",
                descriptor.name, self.stream.name
            )));
        }

        let timestamp = self
            .hook
            .event_timestamp(header.as_ref(), self.previous.as_ref(), &metadata)?;
        self.previous = Some(timestamp.clone());
        if let Some(packet) = self.packet.as_mut() {
            packet.events += 1;
        }

        Ok(CursorItem {
            event: Event {
                descriptor,
                header,
                stream_context,
                context,
                payload,
                timestamp,
            },
            packet: info,
            bytes_consumed: self.reader.bytes_consumed(),
        })
    }
}

fn scope_of<'a>(
    name: &'a str,
    fields: Option<&'a StructValue>,
    parent: Option<&'a Scope<'a>>,
) -> Option<Scope<'a>> {
    fields.map(|fields| Scope::root(name, fields, parent))
}

fn decode_scope<R: Read>(
    reader: &mut BitReader<R>,
    ty: Option<&StructType>,
    name: &str,
    parent: Option<&Scope<'_>>,
) -> Result<Option<StructValue>> {
    ty.map(|ty| ty.decode_root(reader, name, parent)).transpose()
}

impl StreamCursor for SyncCursor {
    fn advance(&mut self) -> Result<bool> {
        self.current = None;
        loop {
            match self.state {
                CursorState::EndOfStream => return Ok(false),
                CursorState::NoPacket => {
                    if self.frame_packet()? {
                        self.state = CursorState::WithinPacket;
                    } else {
                        debug!(stream = %self.stream.name, packets = self.packets, "end of stream");
                        self.state = CursorState::EndOfStream;
                    }
                }
                CursorState::WithinPacket => {
                    if self.packet_exhausted()? {
                        self.finish_packet()?;
                        self.state = CursorState::NoPacket;
                        continue;
                    }
                    self.current = Some(self.read_event()?);
                    return Ok(true);
                }
            }
        }
    }

    fn current(&self) -> Option<&CursorItem> {
        self.current.as_ref()
    }

    fn bytes_consumed(&self) -> u64 {
        self.reader.bytes_consumed()
    }

    fn stream(&self) -> &Arc<StreamInfo> {
        &self.stream
    }
}

enum Message {
    Item(CursorItem),
    End { bytes_consumed: u64 },
}

/// Decodes a stream on a worker thread, at most
/// [`READ_AHEAD_CAPACITY`] events ahead of the consumer.
pub struct ReadAheadCursor {
    stream: Arc<StreamInfo>,
    receiver: Receiver<Result<Message>>,
    cancel: CancellationToken,
    signal: Receiver<()>,
    worker: Option<JoinHandle<()>>,
    current: Option<CursorItem>,
    bytes_consumed: u64,
    finished: bool,
}

impl ReadAheadCursor {
    pub fn spawn(cursor: SyncCursor, cancel: &CancellationToken) -> Result<Self> {
        let stream = Arc::clone(&cursor.stream);
        let (sender, receiver) = bounded(READ_AHEAD_CAPACITY);
        let worker_cancel = cancel.clone();
        let worker = thread::Builder::new()
            .name(format!("ctf-read-ahead-{}", stream.name))
            .spawn(move || produce(cursor, sender, worker_cancel))?;

        Ok(Self {
            stream,
            receiver,
            cancel: cancel.clone(),
            signal: cancel.signal().clone(),
            worker: Some(worker),
            current: None,
            bytes_consumed: 0,
            finished: false,
        })
    }

    /// Events decoded but not yet taken by [`StreamCursor::advance`].
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }
}

fn produce(mut cursor: SyncCursor, sender: Sender<Result<Message>>, cancel: CancellationToken) {
    let signal = cancel.signal().clone();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let message = match cursor.advance() {
            Ok(true) => cursor
                .take_current()
                .map(Message::Item)
                .ok_or_else(|| CtfError::corrupt("cursor advanced without an event")),
            Ok(false) => Ok(Message::End {
                bytes_consumed: cursor.bytes_consumed(),
            }),
            Err(err) => Err(err),
        };
        let last = !matches!(message, Ok(Message::Item(_)));

        select! {
            send(sender, message) -> sent => {
                if sent.is_err() {
                    return;
                }
            }
            recv(signal) -> _ => return,
        }
        if last {
            return;
        }
    }
}

impl StreamCursor for ReadAheadCursor {
    fn advance(&mut self) -> Result<bool> {
        self.current = None;
        if self.finished {
            return Ok(false);
        }

        let message = select! {
            recv(self.receiver) -> message => message.map_err(|_| {
                // A cancelled worker leaves without a final message.
                if self.cancel.is_cancelled() {
                    CtfError::Cancelled
                } else {
                    CtfError::corrupt(format!("read-ahead worker for {} stopped early", self.stream.name))
                }
            })?,
            recv(self.signal) -> _ => return Err(CtfError::Cancelled),
        };

        match message {
            Ok(Message::Item(item)) => {
                self.bytes_consumed = item.bytes_consumed;
                self.current = Some(item);
                Ok(true)
            }
            Ok(Message::End { bytes_consumed }) => {
                self.bytes_consumed = bytes_consumed;
                self.finished = true;
                Ok(false)
            }
            Err(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }

    fn current(&self) -> Option<&CursorItem> {
        self.current.as_ref()
    }

    fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    fn stream(&self) -> &Arc<StreamInfo> {
        &self.stream
    }
}

impl Drop for ReadAheadCursor {
    fn drop(&mut self) {
        // Dropping the only receiver unblocks a worker waiting on a full queue.
        self.receiver = never();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(stream = %self.stream.name, "read-ahead worker panicked");
            }
        }
    }
}
