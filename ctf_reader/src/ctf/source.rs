use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, info};

use super::error::{CtfError, Result};
use super::hook::TraceHook;
use super::metadata::Metadata;

/// File holding the metadata manifest inside a trace directory.
pub const METADATA_FILE: &str = "metadata.json";

/// A forward-only byte source with a known length.
pub struct TraceStream {
    name: String,
    path: Option<PathBuf>,
    len: u64,
    reader: Box<dyn Read + Send>,
}

impl TraceStream {
    pub fn new(name: impl Into<String>, reader: impl Read + Send + 'static, len: u64) -> Self {
        Self {
            name: name.into(),
            path: None,
            len,
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        Self::new(name, io::Cursor::new(bytes), len)
    }

    /// Memory-maps a stream file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let file = File::open(path).map_err(|e| CtfError::io(path, e))?;
        let len = file.metadata().map_err(|e| CtfError::io(path, e))?.len();
        let mut stream = if len == 0 {
            // Empty files cannot be mapped.
            Self::from_bytes(name, Vec::new())
        } else {
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| CtfError::io(path, e))?;
            Self::new(name, io::Cursor::new(mmap), len)
        };
        stream.path = Some(path.to_path_buf());
        Ok(stream)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn into_parts(self) -> (String, u64, Box<dyn Read + Send>) {
        (self.name, self.len, self.reader)
    }
}

impl fmt::Debug for TraceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceStream")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// One trace: its metadata and the byte streams it describes.
#[derive(Debug)]
pub struct Trace {
    pub name: String,
    pub path: Option<PathBuf>,
    pub metadata: Arc<Metadata>,
    pub streams: Vec<TraceStream>,
}

impl Trace {
    pub fn new(name: impl Into<String>, metadata: Metadata, streams: Vec<TraceStream>) -> Self {
        Self {
            name: name.into(),
            path: None,
            metadata: Arc::new(metadata),
            streams,
        }
    }

    /// Opens a trace directory. The metadata manifest is parsed through the
    /// hook; every other visible regular file is a stream, in name order.
    pub fn open(dir: impl AsRef<Path>, hook: &dyn TraceHook) -> Result<Self> {
        let dir = dir.as_ref();
        let metadata = hook.parse_metadata(&dir.join(METADATA_FILE))?;

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| CtfError::io(dir, e))? {
            let entry = entry.map_err(|e| CtfError::io(dir, e))?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with('.') || file_name == METADATA_FILE || file_name == "metadata" {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| CtfError::io(entry.path(), e))?;
            if file_type.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let streams = paths
            .iter()
            .map(TraceStream::open)
            .collect::<Result<Vec<_>>>()?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        info!(trace = %name, streams = streams.len(), "opened trace");

        Ok(Self {
            name,
            path: Some(dir.to_path_buf()),
            metadata: Arc::new(metadata),
            streams,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.streams.iter().map(TraceStream::len).sum()
    }
}

/// The traces played back together.
#[derive(Debug, Default)]
pub struct Source {
    pub traces: Vec<Trace>,
}

impl Source {
    pub fn new(traces: Vec<Trace>) -> Self {
        Self { traces }
    }

    pub fn open<P: AsRef<Path>>(dirs: &[P], hook: &dyn TraceHook) -> Result<Self> {
        let traces = dirs
            .iter()
            .map(|dir| Trace::open(dir, hook))
            .collect::<Result<Vec<_>>>()?;
        debug!(traces = traces.len(), "opened source");
        Ok(Self { traces })
    }

    pub fn push(&mut self, trace: Trace) {
        self.traces.push(trace);
    }

    pub fn total_bytes(&self) -> u64 {
        self.traces.iter().map(Trace::total_bytes).sum()
    }
}

/// Identity of a trace during playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceInfo {
    pub index: usize,
    pub name: String,
    pub path: Option<PathBuf>,
}

/// Identity of a stream during playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub trace_index: usize,
    pub index: usize,
    pub name: String,
    pub len: u64,
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::ctf::hook::StandardHook;
    use tempfile::TempDir;

    #[test]
    fn test_trace_stream__from_bytes__then_reads_back() {
        let stream = TraceStream::from_bytes("s0", vec![1u8, 2, 3]);
        assert_eq!(stream.len(), 3);
        assert_eq!(stream.name(), "s0");

        let (_, _, mut reader) = stream.into_parts();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn test_trace_stream__open_file__then_mapped_with_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream_0");
        fs::write(&path, [0xAAu8; 16]).unwrap();

        let stream = TraceStream::open(&path).unwrap();
        assert_eq!(stream.len(), 16);
        assert_eq!(stream.path(), Some(path.as_path()));

        let empty = dir.path().join("empty");
        fs::write(&empty, b"").unwrap();
        assert!(TraceStream::open(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_trace_stream__missing_file__then_io_error_with_path() {
        let err = TraceStream::open("/nonexistent/stream_0").unwrap_err();
        assert!(matches!(err, CtfError::Io { .. }));
        assert!(err.to_string().contains("stream_0"));
    }

    #[test]
    fn test_trace__open_directory__then_sorted_visible_streams() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(METADATA_FILE), r#"{"clocks": []}"#).unwrap();
        fs::write(dir.path().join("stream_1"), [0u8; 4]).unwrap();
        fs::write(dir.path().join("stream_0"), [0u8; 8]).unwrap();
        fs::write(dir.path().join(".hidden"), [0u8; 2]).unwrap();
        fs::create_dir(dir.path().join("index")).unwrap();

        let trace = Trace::open(dir.path(), &StandardHook).unwrap();
        let names: Vec<&str> = trace.streams.iter().map(TraceStream::name).collect();
        assert_eq!(names, vec!["stream_0", "stream_1"]);
        assert_eq!(trace.total_bytes(), 12);
    }

    #[test]
    fn test_trace__missing_metadata__then_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Trace::open(dir.path(), &StandardHook),
            Err(CtfError::Io { .. })
        ));
    }
}
