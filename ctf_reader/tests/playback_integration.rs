#![allow(non_snake_case)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use ctf_reader::ctf::{CTF_MAGIC, METADATA_FILE};
use ctf_reader::{
    play, CancellationToken, CtfError, Event, EventSink, InversionPolicy, Metadata, NoProgress,
    PacketInfo, PlaybackOptions, Source, StandardHook, StreamInfo, Trace, TraceInfo,
};
use serde_json::json;
use tempfile::TempDir;

fn manifest() -> String {
    json!({
        "clocks": [{"name": "monotonic", "frequency": 1_000_000_000u64}],
        "types": {
            "uint8": {"kind": "integer", "size": 8},
            "uint32": {"kind": "integer", "size": 32},
            "ts": {"kind": "integer", "size": 64, "map": "monotonic"}
        },
        "packet_header": {"kind": "struct", "fields": [
            {"name": "magic", "type": {"kind": "ref", "name": "uint32"}},
            {"name": "stream_id", "type": {"kind": "ref", "name": "uint8"}}
        ]},
        "streams": [{
            "id": 0,
            "packet_context": {"kind": "struct", "fields": [
                {"name": "packet_size", "type": {"kind": "ref", "name": "uint32"}},
                {"name": "content_size", "type": {"kind": "ref", "name": "uint32"}},
                {"name": "timestamp_begin", "type": {"kind": "ref", "name": "ts"}}
            ]},
            "event_header": {"kind": "struct", "fields": [
                {"name": "id", "type": {"kind": "ref", "name": "uint8"}},
                {"name": "timestamp", "type": {"kind": "ref", "name": "ts"}}
            ]}
        }],
        "events": [
            {"id": 1, "name": "sample", "fields": {"kind": "struct", "fields": [
                {"name": "value", "type": {"kind": "ref", "name": "uint32"}}
            ]}},
            {"id": 2, "name": "comm", "fields": {"kind": "struct", "fields": [
                {"name": "len", "type": {"kind": "ref", "name": "uint8"}},
                {"name": "name", "type": {"kind": "array",
                    "element": {"kind": "integer", "size": 8, "encoding": "utf8"},
                    "length": "len"}}
            ]}}
        ]
    })
    .to_string()
}

/// A `sample` event: id 1, timestamp, 32-bit value.
fn sample(ts: u64, value: u32) -> Vec<u8> {
    let mut bytes = vec![1u8];
    bytes.extend_from_slice(&ts.to_le_bytes());
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes
}

/// A `comm` event: id 2, timestamp, length-prefixed name.
fn comm(ts: u64, name: &str) -> Vec<u8> {
    let mut bytes = vec![2u8];
    bytes.extend_from_slice(&ts.to_le_bytes());
    bytes.push(name.len() as u8);
    bytes.extend_from_slice(name.as_bytes());
    bytes
}

/// Frames events into one packet followed by `padding` zero bytes.
fn packet(events: &[Vec<u8>], padding: usize) -> Vec<u8> {
    const HEADER_AND_CONTEXT: usize = 4 + 1 + 4 + 4 + 8;
    let body: Vec<u8> = events.concat();
    let content = HEADER_AND_CONTEXT + body.len();
    let total = content + padding;
    let begin = events
        .first()
        .map(|e| u64::from_le_bytes(e[1..9].try_into().unwrap()))
        .unwrap_or(0);

    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(&(CTF_MAGIC as u32).to_le_bytes());
    bytes.push(0);
    bytes.extend_from_slice(&((total * 8) as u32).to_le_bytes());
    bytes.extend_from_slice(&((content * 8) as u32).to_le_bytes());
    bytes.extend_from_slice(&begin.to_le_bytes());
    bytes.extend_from_slice(&body);
    bytes.resize(total, 0);
    bytes
}

fn write_trace(dir: &Path, streams: &[Vec<u8>]) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(METADATA_FILE), manifest()).unwrap();
    for (i, bytes) in streams.iter().enumerate() {
        fs::write(dir.join(format!("stream_{i}")), bytes).unwrap();
    }
}

fn open(dirs: &[&Path]) -> Source {
    Source::open(dirs, &StandardHook).unwrap()
}

fn options(read_ahead: bool) -> PlaybackOptions {
    PlaybackOptions {
        read_ahead,
        ..PlaybackOptions::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Seen {
    trace: usize,
    stream: usize,
    name: String,
    ns: i64,
    payload: serde_json::Value,
}

#[derive(Default)]
struct Recorder {
    seen: Vec<Seen>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl EventSink for Recorder {
    fn process_event(
        &mut self,
        event: &Event,
        packet: &PacketInfo,
        trace: &TraceInfo,
        stream: &StreamInfo,
        metadata: &Metadata,
    ) -> ctf_reader::Result<()> {
        assert_eq!(packet.stream_id, event.descriptor.stream_id);
        assert!(metadata.event(packet.stream_id, event.id()).is_some());
        self.seen.push(Seen {
            trace: trace.index,
            stream: stream.index,
            name: event.name().to_string(),
            ns: event.timestamp.ns(),
            payload: event
                .payload
                .as_ref()
                .map_or(serde_json::Value::Null, |p| p.to_json()),
        });
        if let Some((limit, cancel)) = &self.cancel_after {
            if self.seen.len() == *limit {
                cancel.cancel();
            }
        }
        Ok(())
    }
}

fn run(source: Source, options: &PlaybackOptions) -> (ctf_reader::Result<ctf_reader::PlaybackSession>, Recorder) {
    let mut recorder = Recorder::default();
    let result = play(
        source,
        Arc::new(StandardHook),
        &mut recorder,
        &mut NoProgress,
        &CancellationToken::new(),
        options,
    );
    (result, recorder)
}

fn timestamps(recorder: &Recorder) -> Vec<i64> {
    recorder.seen.iter().map(|s| s.ns).collect()
}

fn two_interleaved_streams(dir: &Path) {
    write_trace(
        dir,
        &[
            packet(&[sample(10, 1), sample(30, 3), sample(50, 5)], 0),
            packet(&[sample(20, 2), sample(40, 4)], 0),
        ],
    );
}

#[test]
fn test_play__two_streams__then_merged_in_time_order() {
    for read_ahead in [false, true] {
        let dir = TempDir::new().unwrap();
        two_interleaved_streams(dir.path());

        let (result, recorder) = run(open(&[dir.path()]), &options(read_ahead));
        let session = result.unwrap();

        assert_eq!(timestamps(&recorder), vec![10, 20, 30, 40, 50]);
        let streams: Vec<usize> = recorder.seen.iter().map(|s| s.stream).collect();
        assert_eq!(streams, vec![0, 1, 0, 1, 0]);
        assert_eq!(session.events, 5);
        assert_eq!(session.inversions, 0);
        assert_eq!(session.first_ns, Some(10));
        assert_eq!(session.last_ns, Some(50));
        assert_eq!(session.bytes_processed, session.total_bytes);
    }
}

#[test]
fn test_play__many_padded_packets__then_read_ahead_matches_sync() {
    let dir = TempDir::new().unwrap();
    let mut streams = Vec::new();
    for stream in 0..3u64 {
        let mut bytes = Vec::new();
        for chunk in 0..10u64 {
            let events: Vec<Vec<u8>> = (0..7u64)
                .map(|i| {
                    let ts = (chunk * 7 + i) * 10 + stream;
                    if i % 3 == 0 {
                        comm(ts, &format!("task-{stream}-{chunk}"))
                    } else {
                        sample(ts, (ts * 3) as u32)
                    }
                })
                .collect();
            bytes.extend(packet(&events, (chunk as usize) % 4 * 3));
        }
        streams.push(bytes);
    }
    write_trace(dir.path(), &streams);

    let (sync, sync_recorder) = run(open(&[dir.path()]), &options(false));
    let (ahead, ahead_recorder) = run(open(&[dir.path()]), &options(true));

    assert_eq!(sync.unwrap().events, 210);
    assert_eq!(ahead.unwrap().events, 210);
    assert_eq!(sync_recorder.seen, ahead_recorder.seen);

    let ns = timestamps(&sync_recorder);
    assert!(ns.windows(2).all(|w| w[0] <= w[1]));

    let first_comm = sync_recorder.seen.iter().find(|s| s.name == "comm").unwrap();
    assert_eq!(first_comm.payload["name"], "task-0-0");
}

#[test]
fn test_play__equal_timestamps__then_trace_then_stream_order() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    write_trace(
        first.path(),
        &[packet(&[sample(5, 0)], 0), packet(&[sample(5, 1)], 0)],
    );
    write_trace(second.path(), &[packet(&[sample(5, 2)], 0)]);

    for read_ahead in [false, true] {
        let (result, recorder) = run(open(&[second.path(), first.path()]), &options(read_ahead));
        result.unwrap();

        let order: Vec<(usize, usize)> = recorder.seen.iter().map(|s| (s.trace, s.stream)).collect();
        assert_eq!(order, vec![(0, 0), (1, 0), (1, 1)]);
    }
}

#[test]
fn test_play__backwards_timestamps__then_warned_or_failed_per_policy() {
    let dir = TempDir::new().unwrap();
    write_trace(dir.path(), &[packet(&[sample(50, 0), sample(10, 1)], 0)]);

    let (result, recorder) = run(open(&[dir.path()]), &PlaybackOptions::default());
    let session = result.unwrap();
    assert_eq!(session.inversions, 1);
    assert_eq!(timestamps(&recorder), vec![50, 10]);

    let strict = PlaybackOptions {
        inversion_policy: InversionPolicy::Fail,
        ..PlaybackOptions::default()
    };
    let (result, recorder) = run(open(&[dir.path()]), &strict);
    assert!(matches!(result, Err(CtfError::CorruptData(_))));
    assert_eq!(recorder.seen.len(), 1);
}

#[test]
fn test_play__cancelled_from_sink__then_cancelled_after_that_event() {
    let dir = TempDir::new().unwrap();
    let events: Vec<Vec<u8>> = (0..100u64).map(|i| sample(i, i as u32)).collect();
    write_trace(dir.path(), &[packet(&events[..50], 0), packet(&events[50..], 0)]);

    for read_ahead in [false, true] {
        let cancel = CancellationToken::new();
        let mut recorder = Recorder {
            cancel_after: Some((3, cancel.clone())),
            ..Recorder::default()
        };
        let result = play(
            open(&[dir.path()]),
            Arc::new(StandardHook),
            &mut recorder,
            &mut NoProgress,
            &cancel,
            &options(read_ahead),
        );

        assert!(matches!(result, Err(CtfError::Cancelled)), "read_ahead={read_ahead}");
        assert_eq!(recorder.seen.len(), 3);
    }
}

#[test]
fn test_play__cancelled_on_last_event__then_still_cancelled() {
    let dir = TempDir::new().unwrap();
    write_trace(
        dir.path(),
        &[packet(&[sample(10, 1), sample(20, 2), sample(30, 3)], 0)],
    );

    for read_ahead in [false, true] {
        let cancel = CancellationToken::new();
        let mut recorder = Recorder {
            cancel_after: Some((3, cancel.clone())),
            ..Recorder::default()
        };
        let mut reports = Vec::new();
        let result = play(
            open(&[dir.path()]),
            Arc::new(StandardHook),
            &mut recorder,
            &mut |p: u8| reports.push(p),
            &cancel,
            &options(read_ahead),
        );

        assert!(matches!(result, Err(CtfError::Cancelled)), "read_ahead={read_ahead}");
        assert_eq!(timestamps(&recorder), vec![10, 20, 30]);
        assert!(reports.is_empty());
    }
}

#[test]
fn test_play__cancelled_before_start__then_no_events() {
    let dir = TempDir::new().unwrap();
    two_interleaved_streams(dir.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut recorder = Recorder::default();
    let result = play(
        open(&[dir.path()]),
        Arc::new(StandardHook),
        &mut recorder,
        &mut NoProgress,
        &cancel,
        &options(false),
    );
    assert!(matches!(result, Err(CtfError::Cancelled)));
    assert!(recorder.seen.is_empty());
}

#[test]
fn test_play__progress_interval__then_monotonic_reports_ending_at_100() {
    let dir = TempDir::new().unwrap();
    let events: Vec<Vec<u8>> = (0..9u64).map(|i| sample(i, 0)).collect();
    write_trace(dir.path(), &[packet(&events[..3], 0), packet(&events[3..], 0)]);

    let mut reports = Vec::new();
    let session = play(
        open(&[dir.path()]),
        Arc::new(StandardHook),
        &mut Recorder::default(),
        &mut |percent: u8| reports.push(percent),
        &CancellationToken::new(),
        &PlaybackOptions {
            progress_interval: 2,
            ..PlaybackOptions::default()
        },
    )
    .unwrap();

    assert_eq!(session.events, 9);
    assert_eq!(reports.len(), 9 / 2 + 1);
    assert!(reports.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(reports.last(), Some(&100));
}

#[test]
fn test_play__bad_magic__then_corrupt_data() {
    let dir = TempDir::new().unwrap();
    let mut bytes = packet(&[sample(1, 0)], 0);
    bytes[0] ^= 0xFF;
    write_trace(dir.path(), &[bytes]);

    for read_ahead in [false, true] {
        let (result, _) = run(open(&[dir.path()]), &options(read_ahead));
        assert!(matches!(result, Err(CtfError::CorruptData(_))));
    }
}

#[test]
fn test_play__packet_size_beyond_stream__then_corrupt_data() {
    let dir = TempDir::new().unwrap();
    let mut bytes = packet(&[sample(1, 0), sample(2, 0)], 8);
    bytes.truncate(bytes.len() - 4);
    write_trace(dir.path(), &[bytes]);

    let (result, recorder) = run(open(&[dir.path()]), &options(false));
    assert!(matches!(result, Err(CtfError::CorruptData(_))));
    assert_eq!(recorder.seen.len(), 2);
}

#[test]
fn test_play__event_overruns_content__then_corrupt_data() {
    let dir = TempDir::new().unwrap();
    let mut bytes = packet(&[sample(1, 0)], 0);
    // Shrink the declared packet size so the event crosses it.
    let short = ((bytes.len() - 2) * 8) as u32;
    bytes[5..9].copy_from_slice(&short.to_le_bytes());
    bytes[9..13].copy_from_slice(&short.to_le_bytes());
    write_trace(dir.path(), &[bytes]);

    let (result, recorder) = run(open(&[dir.path()]), &options(false));
    assert!(matches!(result, Err(CtfError::CorruptData(_))));
    assert!(recorder.seen.is_empty());
}

#[test]
fn test_play__in_memory_trace__then_same_as_on_disk() {
    let metadata = Metadata::from_json(&manifest()).unwrap();
    let trace = Trace::new(
        "memory",
        metadata,
        vec![
            ctf_reader::TraceStream::from_bytes("a", packet(&[sample(10, 1), sample(30, 3)], 0)),
            ctf_reader::TraceStream::from_bytes("b", packet(&[sample(20, 2)], 0)),
        ],
    );

    let (result, recorder) = run(Source::new(vec![trace]), &options(true));
    assert_eq!(result.unwrap().events, 3);
    assert_eq!(timestamps(&recorder), vec![10, 20, 30]);
}
