use std::path::PathBuf;

use thiserror::Error;

/// Concrete error kinds surfaced by the core (§7). Application-level code
/// (the orchestrator, the CLI) wraps these with `anyhow::Context` when it
/// needs to compose several failures into one human-facing message; the
/// core itself only ever returns `CoreError`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed XML in {path} at byte {offset}: {message}")]
    MalformedXml {
        path: PathBuf,
        offset: u64,
        message: String,
    },

    #[error("malformed record #{record_index} in {path}: {message}")]
    MalformedRecord {
        path: PathBuf,
        record_index: usize,
        message: String,
    },

    #[error("{path}: declared count {declared} does not match actual count {actual}")]
    CountMismatch {
        path: PathBuf,
        declared: usize,
        actual: usize,
    },

    #[error("{path}: record #{record_index} has year {actual_year}, expected {expected_year}")]
    YearMismatch {
        path: PathBuf,
        record_index: usize,
        expected_year: i32,
        actual_year: i32,
    },

    #[error("base64 decode failed for MMS {mms_id}, part #{part_index}: {source}")]
    DecodeError {
        mms_id: String,
        part_index: usize,
        #[source]
        source: base64::DecodeError,
    },

    #[error("hash mismatch storing blob: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("failed to store blob {hash}: {message}")]
    StoreFailure { hash: String, message: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
