//! Time-ordered playback of every stream in a [`Source`].

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::cursor::{CancellationToken, ReadAheadCursor, StreamCursor, SyncCursor};
use super::error::{CtfError, Result};
use super::hook::TraceHook;
use super::metadata::Metadata;
use super::packet::{Event, PacketInfo};
use super::source::{Source, StreamInfo, TraceInfo};

/// Events emitted between two progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 5000;

/// What to do when an event is older than the one emitted before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InversionPolicy {
    /// Log a warning, count it and keep going.
    #[default]
    Warn,
    /// Stop playback with `CorruptData`.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackOptions {
    /// Decode each stream on its own worker thread.
    pub read_ahead: bool,
    pub inversion_policy: InversionPolicy,
    pub progress_interval: u64,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            read_ahead: false,
            inversion_policy: InversionPolicy::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Receives every event in time order. Returning an error stops playback.
pub trait EventSink {
    fn process_event(
        &mut self,
        event: &Event,
        packet: &PacketInfo,
        trace: &TraceInfo,
        stream: &StreamInfo,
        metadata: &Metadata,
    ) -> Result<()>;
}

/// Receives completion percentages, 0..=100.
pub trait ProgressSink {
    fn report(&mut self, percent: u8);
}

impl<F: FnMut(u8)> ProgressSink for F {
    fn report(&mut self, percent: u8) {
        self(percent)
    }
}

/// Discards progress reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _percent: u8) {}
}

/// Counters of one playback, owned by the merge loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackSession {
    pub events: u64,
    pub inversions: u64,
    pub streams: usize,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    pub first_ns: Option<i64>,
    pub last_ns: Option<i64>,
}

impl PlaybackSession {
    pub fn percent(&self) -> u8 {
        percent(self.bytes_processed, self.total_bytes)
    }
}

fn percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (processed as u128 * 100 / total as u128).min(100) as u8
}

struct Slot {
    cursor: Box<dyn StreamCursor>,
    trace: usize,
    active: bool,
}

struct TraceSlot {
    info: TraceInfo,
    metadata: Arc<Metadata>,
}

/// Replays every event of `source` to `sink` in timestamp order.
///
/// Events with equal timestamps are emitted in (trace, stream) order.
/// Cancellation is checked before each event and surfaces as
/// [`CtfError::Cancelled`].
pub fn play<S, P>(
    source: Source,
    hook: Arc<dyn TraceHook>,
    sink: &mut S,
    progress: &mut P,
    cancel: &CancellationToken,
    options: &PlaybackOptions,
) -> Result<PlaybackSession>
where
    S: EventSink + ?Sized,
    P: ProgressSink + ?Sized,
{
    let mut session = PlaybackSession {
        total_bytes: source.total_bytes(),
        ..PlaybackSession::default()
    };
    info!(
        traces = source.traces.len(),
        bytes = session.total_bytes,
        read_ahead = options.read_ahead,
        "playback started"
    );

    let mut traces = Vec::with_capacity(source.traces.len());
    let mut slots = Vec::new();
    for (trace_index, trace) in source.traces.into_iter().enumerate() {
        for (index, stream) in trace.streams.into_iter().enumerate() {
            let info = Arc::new(StreamInfo {
                trace_index,
                index,
                name: stream.name().to_string(),
                len: stream.len(),
            });
            let cursor = SyncCursor::new(stream, info, Arc::clone(&trace.metadata), Arc::clone(&hook));
            let cursor: Box<dyn StreamCursor> = if options.read_ahead {
                Box::new(ReadAheadCursor::spawn(cursor, cancel)?)
            } else {
                Box::new(cursor)
            };
            slots.push(Slot {
                cursor,
                trace: trace_index,
                active: true,
            });
        }
        traces.push(TraceSlot {
            info: TraceInfo {
                index: trace_index,
                name: trace.name,
                path: trace.path,
            },
            metadata: trace.metadata,
        });
    }
    session.streams = slots.len();

    // Min-heap of (timestamp, slot). Slots are in (trace, stream) order,
    // which breaks timestamp ties.
    let mut heap = BinaryHeap::with_capacity(slots.len());
    let mut finished_bytes = 0u64;
    for (idx, slot) in slots.iter_mut().enumerate() {
        if cancel.is_cancelled() {
            return Err(CtfError::Cancelled);
        }
        match next_timestamp(slot)? {
            Some(ns) => heap.push(Reverse((ns, idx))),
            None => finished_bytes += retire(slot),
        }
    }

    let interval = options.progress_interval.max(1);
    while let Some(Reverse((ns, idx))) = heap.pop() {
        if cancel.is_cancelled() {
            info!(events = session.events, "playback cancelled");
            return Err(CtfError::Cancelled);
        }

        if let Some(last) = session.last_ns.filter(|&last| ns < last) {
            session.inversions += 1;
            let stream = &slots[idx].cursor.stream().name;
            match options.inversion_policy {
                InversionPolicy::Warn => warn!(
                    stream = %stream,
                    timestamp = ns,
                    previous = last,
                    "time inversion across streams"
                ),
                InversionPolicy::Fail => {
                    return Err(CtfError::corrupt(format!(
                        "event at {ns} ns in stream {stream} precedes the previous event at {last} ns"
                    )))
                }
            }
        }

        let slot = &mut slots[idx];
        let trace = &traces[slot.trace];
        let item = slot.cursor.current().ok_or_else(|| {
            CtfError::corrupt("merge heap refers to a cursor without an event")
        })?;
        sink.process_event(
            &item.event,
            &item.packet,
            &trace.info,
            slot.cursor.stream(),
            &trace.metadata,
        )?;

        session.events += 1;
        session.first_ns.get_or_insert(ns);
        session.last_ns = Some(ns);

        match next_timestamp(slot)? {
            Some(next) => heap.push(Reverse((next, idx))),
            None => finished_bytes += retire(slot),
        }

        if session.events % interval == 0 {
            let active: u64 = slots
                .iter()
                .filter(|slot| slot.active)
                .map(|slot| slot.cursor.bytes_consumed())
                .sum();
            progress.report(percent(finished_bytes + active, session.total_bytes));
        }
    }

    // The sink may cancel while handling the last event.
    if cancel.is_cancelled() {
        info!(events = session.events, "playback cancelled");
        return Err(CtfError::Cancelled);
    }

    session.bytes_processed = finished_bytes;
    progress.report(session.percent());
    info!(
        events = session.events,
        inversions = session.inversions,
        streams = session.streams,
        "playback finished"
    );
    Ok(session)
}

/// Advances a cursor, returning the timestamp of its new event.
fn next_timestamp(slot: &mut Slot) -> Result<Option<i64>> {
    let advanced = slot.cursor.advance().map_err(|err| {
        if !err.is_cancelled() {
            error!(stream = %slot.cursor.stream().name, error = %err, "stream failed");
        }
        err
    })?;
    if !advanced {
        return Ok(None);
    }
    Ok(slot.cursor.current().map(|item| item.event.timestamp.ns()))
}

fn retire(slot: &mut Slot) -> u64 {
    slot.active = false;
    slot.cursor.bytes_consumed()
}
