//! Crate-wide error taxonomy.
//!
//! Only header-level and file-existence failures are returned to callers.
//! Per-chunk and per-slice problems are recovered where they happen and
//! reported through `log::warn!`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::record::DecodeError;

#[derive(Error, Debug)]
pub enum OctError {
    /// Header or magic does not belong to this parser. Callers holding a
    /// shared extension retry with the next candidate format.
    #[error("Not a {format} container: {reason}")]
    FormatMismatch { format: &'static str, reason: String },

    /// Truncated or corrupt stream discovered while cataloguing.
    #[error("Corrupt container: {0}")]
    Format(String),

    #[error("Cannot reshape {context}: expected {expected} values, found {found}")]
    Reshape { context: String, expected: usize, found: usize },

    #[error("Required sidecar file not found: {0}")]
    MissingSidecar(PathBuf),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Required chunk not present: {0}")]
    MissingChunk(String),

    #[error("Unsupported container: {0}")]
    UnsupportedFormat(String),

    #[error("Record decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl OctError {
    pub fn mismatch(format: &'static str, reason: impl Into<String>) -> Self {
        OctError::FormatMismatch { format, reason: reason.into() }
    }

    pub fn is_mismatch(&self) -> bool {
        matches!(self, OctError::FormatMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, OctError>;
