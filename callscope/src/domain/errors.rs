//! Structured error types for callscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Only fatal conditions become errors: a single image or frame that fails
//! to resolve is recorded in the module report and skipped instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Ingestion cancelled")]
    Cancelled,

    #[error("Failed to open trace {path}: {reason}")]
    TraceOpenFailed { path: String, reason: String },

    #[error("Invalid trace record at line {line}: {reason}")]
    InvalidTrace { line: usize, reason: String },

    #[error("Process {0} has no samples in this trace")]
    NoSamples(super::Pid),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Failed to load debug info for {binary}: {reason}")]
    DebugInfoLoadFailed { binary: String, reason: String },

    #[error("Malformed symbol map line {line}: {content}")]
    MalformedSymbolMap { line: usize, content: String },

    #[error(transparent)]
    Object(#[from] object::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to serialize profile: {0}")]
    SerializationFailed(String),

    #[error("Unsupported profile format version {0}")]
    UnsupportedVersion(u32),

    #[error("Corrupt profile: {0}")]
    CorruptProfile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
