//! Crate-scoped error handling for bucket-visit.
//!
//! This module provides a unified error type for public APIs while keeping
//! the precise per-layer error types available for matching.

use thiserror::Error;

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type exposed to users of the crate.
///
/// Contract violations (`Progress`, `Source`) are programming errors and are
/// never retried internally. `Format` means a stored token could not be read;
/// the caller decides whether to discard it and start over.
#[derive(Debug, Error)]
pub enum Error {
    /// Errors from the bucket identifier layer
    #[error("Bucket error: {0}")]
    Bucket(#[from] crate::bucket::BucketError),

    /// Illegal progress-token state transitions
    #[error("Progress error: {0}")]
    Progress(#[from] crate::progress::ProgressError),

    /// Malformed serialized progress
    #[error("Format error: {0}")]
    Format(#[from] crate::progress::FormatError),

    /// Errors from the bucket sources and the iterator contract
    #[error("Source error: {0}")]
    Source(#[from] crate::source::SourceError),

    /// Errors from the durable checkpoint store
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
