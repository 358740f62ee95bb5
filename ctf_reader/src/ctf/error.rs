use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Errors raised while loading metadata or decoding trace streams.
///
/// Every variant is fatal to the playback of the trace that produced it.
/// Corrupted binary data has no safe resynchronization point, so nothing in
/// the decode path retries or skips.
#[derive(Debug, Error)]
pub enum CtfError {
    #[error("corrupt data: {0}")]
    CorruptData(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("playback cancelled")]
    Cancelled,
    #[error("metadata error: {0}")]
    Metadata(String),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("read error: {0}")]
    Read(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CtfError>;

impl CtfError {
    pub fn corrupt(details: impl fmt::Display) -> Self {
        Self::CorruptData(details.to_string())
    }

    pub fn unsupported(details: impl fmt::Display) -> Self {
        Self::Unsupported(details.to_string())
    }

    pub fn metadata(details: impl fmt::Display) -> Self {
        Self::Metadata(details.to_string())
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for CtfError {
    fn from(err: serde_json::Error) -> Self {
        CtfError::Metadata(err.to_string())
    }
}
