//! Text and JSON rendering of replayed events and summaries.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

use ctf_reader::{Event, PacketInfo, PlaybackSession, StreamInfo, TraceInfo};
use serde::Serialize;
use serde_json::json;

/// Output format for command results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format '{}'. Use 'text' or 'json'", s)),
        }
    }
}

/// Formats one replayed event as a single line.
pub fn format_event(
    event: &Event,
    packet: &PacketInfo,
    trace: &TraceInfo,
    stream: &StreamInfo,
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Text => format_event_text(event, trace, stream),
        OutputFormat::Json => format_event_json(event, packet, trace, stream),
    }
}

fn format_event_text(event: &Event, trace: &TraceInfo, stream: &StreamInfo) -> String {
    let mut line = format!(
        "[{}] {}/{} {}",
        event.timestamp,
        trace.name,
        stream.name,
        event.name()
    );
    if let Some(context) = event.context.as_ref().filter(|c| !c.is_empty()) {
        let _ = write!(line, " {context}");
    }
    match event.payload.as_ref() {
        Some(payload) => {
            let _ = write!(line, ": {payload}");
        }
        None => line.push_str(": { }"),
    }
    line
}

fn format_event_json(
    event: &Event,
    packet: &PacketInfo,
    trace: &TraceInfo,
    stream: &StreamInfo,
) -> String {
    let mut value = event.to_json();
    if let Some(object) = value.as_object_mut() {
        object.insert("trace".to_string(), json!(trace.name));
        object.insert("stream".to_string(), json!(stream.name));
        object.insert("packet".to_string(), json!(packet.ordinal));
    }
    value.to_string()
}

/// Event counts of one stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamSummary {
    pub name: String,
    pub bytes: u64,
    pub events: u64,
}

/// Event counts and time range of one trace.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceSummary {
    pub name: String,
    pub streams: Vec<StreamSummary>,
    pub events: BTreeMap<String, u64>,
    pub first: Option<String>,
    pub last: Option<String>,
}

impl TraceSummary {
    pub fn event_count(&self) -> u64 {
        self.events.values().sum()
    }
}

pub fn format_summary(
    traces: &[TraceSummary],
    session: &PlaybackSession,
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Text => format_summary_text(traces, session),
        OutputFormat::Json => format_summary_json(traces, session),
    }
}

fn format_summary_text(traces: &[TraceSummary], session: &PlaybackSession) -> String {
    let mut output = String::new();
    output.push_str("Playback Summary\n");
    output.push_str("================\n\n");
    output.push_str(&format!("Events:        {}\n", format_number(session.events)));
    output.push_str(&format!("Streams:       {}\n", session.streams));
    output.push_str(&format!("Bytes:         {}\n", format_number(session.total_bytes)));
    output.push_str(&format!("Inversions:    {}\n", format_number(session.inversions)));

    for trace in traces {
        output.push_str(&format!(
            "\nTrace {} ({} events)\n",
            trace.name,
            format_number(trace.event_count())
        ));
        if let (Some(first), Some(last)) = (&trace.first, &trace.last) {
            output.push_str(&format!("  Time range: {} .. {}\n", first, last));
        }
        for stream in &trace.streams {
            output.push_str(&format!(
                "  Stream {:<24} {:>12} events {:>14} bytes\n",
                stream.name,
                format_number(stream.events),
                format_number(stream.bytes)
            ));
        }
        for (name, count) in &trace.events {
            output.push_str(&format!("  Event  {:<24} {:>12}\n", name, format_number(*count)));
        }
    }

    output
}

fn format_summary_json(traces: &[TraceSummary], session: &PlaybackSession) -> String {
    #[derive(Serialize)]
    struct SummaryJson<'a> {
        events: u64,
        streams: usize,
        total_bytes: u64,
        inversions: u64,
        first_ns: Option<i64>,
        last_ns: Option<i64>,
        traces: &'a [TraceSummary],
    }

    let json = SummaryJson {
        events: session.events,
        streams: session.streams,
        total_bytes: session.total_bytes,
        inversions: session.inversions,
        first_ns: session.first_ns,
        last_ns: session.last_ns,
        traces,
    };

    serde_json::to_string_pretty(&json).unwrap_or_else(|_| "{}".to_string())
}

/// Format a number with thousand separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
