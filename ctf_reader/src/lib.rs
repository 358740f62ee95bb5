//! Decoding and time-ordered playback of Common Trace Format traces.
//!
//! A [`Source`] holds one or more traces, each a set of binary streams
//! described by its [`Metadata`]. [`play`] decodes every stream and hands
//! the events to an [`EventSink`] in global timestamp order.

pub mod ctf;

pub use ctf::{
    play, CancellationToken, CtfError, Event, EventSink, InversionPolicy, Metadata, NoProgress,
    PacketInfo, PlaybackOptions, PlaybackSession, ProgressSink, Result, Source, StandardHook,
    StreamInfo, Trace, TraceHook, TraceInfo, TraceStream,
};
