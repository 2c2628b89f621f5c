//! Error types for the tile pipeline.

use thiserror::Error;

/// Pipeline errors.
///
/// `MalformedInput` is the only non-fatal kind: parsers report it per
/// feature (skip + warn) and keep going. Everything else aborts the run —
/// the pipeline cannot checkpoint, so there is nothing to resume.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Any filesystem syscall failure.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// File-descriptor or disk budget exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A single unparseable feature. Reported and skipped, never fatal.
    #[error("malformed input in {source_file}, offset {offset}: {reason}")]
    MalformedInput {
        source_file: String,
        offset: u64,
        reason: String,
    },

    /// Internal bug: a documented invariant did not hold.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The input produced zero features.
    #[error("did not read any valid geometries")]
    NoGeometries,

    /// Auto maxzoom needs at least two distinct feature locations.
    #[error("cannot guess maxzoom without at least two distinct feature locations")]
    CannotGuessMaxzoom,
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
