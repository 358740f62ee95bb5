pub mod bits;
pub mod clock;
pub mod cursor;
pub mod error;
pub mod hook;
pub mod metadata;
pub mod packet;
pub mod playback;
pub mod source;
pub mod types;
pub mod value;

// Re-export main types
pub use bits::{BitReader, DEFAULT_BUFFER_SIZE};
pub use clock::{Clock, Timestamp};
pub use cursor::{
    CancellationToken, CursorItem, ReadAheadCursor, StreamCursor, SyncCursor, READ_AHEAD_CAPACITY,
};
pub use error::{CtfError, Result};
pub use hook::{PacketBits, PacketTimestamps, StandardHook, TraceHook, CTF_MAGIC};
pub use metadata::{EventDescriptor, Metadata, StreamClass};
pub use packet::{Event, PacketInfo};
pub use playback::{
    play, EventSink, InversionPolicy, NoProgress, PlaybackOptions, PlaybackSession, ProgressSink,
    DEFAULT_PROGRESS_INTERVAL,
};
pub use source::{Source, StreamInfo, Trace, TraceInfo, TraceStream, METADATA_FILE};
pub use types::{
    ArrayLength, ArrayType, ByteOrder, Encoding, EnumMapping, EnumType, FloatType, IntegerType,
    StringType, StructType, TypeDescriptor, VariantType,
};
pub use value::{
    ArrayValue, EnumValue, Field, FieldValue, IntegerValue, Scope, StructValue, VariantValue,
};
