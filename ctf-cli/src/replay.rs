//! `ctf replay` and `ctf summary`.

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use ctf_reader::{
    play, CancellationToken, CtfError, Event, EventSink, InversionPolicy, Metadata, PacketInfo,
    PlaybackOptions, PlaybackSession, Source, StandardHook, StreamInfo, TraceHook, TraceInfo,
};
use tracing::{debug, info};

use crate::output::{format_event, format_summary, OutputFormat, StreamSummary, TraceSummary};

/// Trace selection and decoding options shared by every command
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Trace directories, each holding metadata.json and its streams
    #[arg(required = true)]
    pub traces: Vec<PathBuf>,

    /// Decode each stream on its own worker thread
    #[arg(long, env = "CTF_READ_AHEAD")]
    pub read_ahead: bool,

    /// Fail on events older than their predecessor instead of warning
    #[arg(long, env = "CTF_STRICT_TIME")]
    pub strict_time: bool,
}

impl From<&InputArgs> for PlaybackOptions {
    fn from(args: &InputArgs) -> Self {
        PlaybackOptions {
            read_ahead: args.read_ahead,
            inversion_policy: if args.strict_time {
                InversionPolicy::Fail
            } else {
                InversionPolicy::Warn
            },
            ..PlaybackOptions::default()
        }
    }
}

// LCOV_EXCL_START - Struct field definitions
#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Stop after this many events
    #[arg(short, long)]
    pub limit: Option<u64>,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Args, Debug, Clone)]
pub struct SummaryArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}
// LCOV_EXCL_STOP

/// Prints every event, cancelling playback once `limit` is reached.
struct PrintSink<W: Write> {
    out: W,
    format: OutputFormat,
    limit: Option<u64>,
    printed: u64,
    cancel: CancellationToken,
}

impl<W: Write> PrintSink<W> {
    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.printed >= limit)
    }
}

impl<W: Write> EventSink for PrintSink<W> {
    fn process_event(
        &mut self,
        event: &Event,
        packet: &PacketInfo,
        trace: &TraceInfo,
        stream: &StreamInfo,
        _metadata: &Metadata,
    ) -> ctf_reader::Result<()> {
        writeln!(self.out, "{}", format_event(event, packet, trace, stream, self.format))?;
        self.printed += 1;
        if self.limit_reached() {
            self.cancel.cancel();
        }
        Ok(())
    }
}

/// Counts events per trace, stream and event name.
#[derive(Default)]
struct SummarySink {
    traces: Vec<TraceSummary>,
}

impl EventSink for SummarySink {
    fn process_event(
        &mut self,
        event: &Event,
        _packet: &PacketInfo,
        trace: &TraceInfo,
        stream: &StreamInfo,
        _metadata: &Metadata,
    ) -> ctf_reader::Result<()> {
        if self.traces.len() <= trace.index {
            self.traces.resize_with(trace.index + 1, TraceSummary::default);
        }
        let summary = &mut self.traces[trace.index];
        if summary.name.is_empty() {
            summary.name = trace.name.clone();
        }
        if summary.streams.len() <= stream.index {
            summary.streams.resize_with(stream.index + 1, StreamSummary::default);
        }
        let counts = &mut summary.streams[stream.index];
        if counts.name.is_empty() {
            counts.name = stream.name.clone();
            counts.bytes = stream.len;
        }
        counts.events += 1;
        *summary.events.entry(event.name().to_string()).or_default() += 1;

        let timestamp = event.timestamp.to_string();
        summary.first.get_or_insert_with(|| timestamp.clone());
        summary.last = Some(timestamp);
        Ok(())
    }
}

pub fn run_replay(args: ReplayArgs) -> Result<()> {
    if args.limit == Some(0) {
        return Ok(());
    }
    let options = PlaybackOptions::from(&args.input);
    let cancel = CancellationToken::new();
    install_interrupt_handler(&cancel)?;

    let hook: Arc<dyn TraceHook> = Arc::new(StandardHook);
    let source = open_source(&args.input, hook.as_ref())?;

    let stdout = io::stdout();
    let mut sink = PrintSink {
        out: BufWriter::new(stdout.lock()),
        format: args.format,
        limit: args.limit,
        printed: 0,
        cancel: cancel.clone(),
    };

    let result = play(source, hook, &mut sink, &mut log_progress, &cancel, &options);
    sink.out.flush()?;

    match result {
        Ok(session) => {
            report(&session);
            Ok(())
        }
        Err(CtfError::Cancelled) if sink.limit_reached() => {
            info!(events = sink.printed, "event limit reached");
            Ok(())
        }
        Err(CtfError::Cancelled) => bail!("playback interrupted"),
        Err(err) => Err(err).context("playback failed"),
    }
}

pub fn run_summary(args: SummaryArgs) -> Result<()> {
    let options = PlaybackOptions::from(&args.input);
    let cancel = CancellationToken::new();
    install_interrupt_handler(&cancel)?;

    let hook: Arc<dyn TraceHook> = Arc::new(StandardHook);
    let source = open_source(&args.input, hook.as_ref())?;

    let mut sink = SummarySink::default();
    let session = match play(source, hook, &mut sink, &mut log_progress, &cancel, &options) {
        Ok(session) => session,
        Err(CtfError::Cancelled) => bail!("playback interrupted"),
        Err(err) => return Err(err).context("playback failed"),
    };
    report(&session);

    println!("{}", format_summary(&sink.traces, &session, args.format));
    Ok(())
}

fn open_source(input: &InputArgs, hook: &dyn TraceHook) -> Result<Source> {
    let source = Source::open(&input.traces, hook).context("failed to open traces")?;
    info!(
        traces = source.traces.len(),
        bytes = source.total_bytes(),
        "traces opened"
    );
    Ok(source)
}

fn install_interrupt_handler(cancel: &CancellationToken) -> Result<()> {
    let token = cancel.clone();
    ctrlc::set_handler(move || token.cancel()).context("failed to install Ctrl-C handler")?;
    Ok(())
}

fn log_progress(percent: u8) {
    debug!(percent, "playback progress");
}

fn report(session: &PlaybackSession) {
    info!(
        events = session.events,
        inversions = session.inversions,
        bytes = session.bytes_processed,
        "playback complete"
    );
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    fn input(read_ahead: bool, strict_time: bool) -> InputArgs {
        InputArgs {
            traces: vec![PathBuf::from("trace")],
            read_ahead,
            strict_time,
        }
    }

    #[test]
    fn test_playback_options__from_defaults__then_sync_and_warn() {
        let options = PlaybackOptions::from(&input(false, false));
        assert_eq!(options, PlaybackOptions::default());
    }

    #[test]
    fn test_playback_options__from_flags__then_read_ahead_and_fail() {
        let options = PlaybackOptions::from(&input(true, true));
        assert!(options.read_ahead);
        assert_eq!(options.inversion_policy, InversionPolicy::Fail);
    }

    #[test]
    fn test_print_sink__limit_reached__then_cancels_token() {
        let cancel = CancellationToken::new();
        let sink = PrintSink {
            out: Vec::new(),
            format: OutputFormat::Text,
            limit: Some(2),
            printed: 2,
            cancel: cancel.clone(),
        };
        assert!(sink.limit_reached());
        assert!(!cancel.is_cancelled());

        let unlimited = PrintSink {
            limit: None,
            ..sink
        };
        assert!(!unlimited.limit_reached());
    }

    #[test]
    fn test_open_source__missing_directory__then_error() {
        let err = open_source(
            &InputArgs {
                traces: vec![PathBuf::from("/nonexistent/ctf-trace")],
                read_ahead: false,
                strict_time: false,
            },
            &StandardHook,
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to open traces"));
    }
}
