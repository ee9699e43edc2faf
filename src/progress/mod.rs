//! Progress tracking module.
//!
//! A progress token records which superbuckets of a scan are still pending,
//! which are handed out and awaiting a report, how many are finished, and
//! which failed. It can be written out at any time, in a line-based text
//! form or a compact binary form, and read back to resume the scan.

use crate::bucket::{BucketError, BucketId};
use thiserror::Error;

mod binary;
mod state;
mod text;
pub mod token;

pub(crate) use state::ProgressState;
pub use text::PROGRESS_HEADER;
pub use token::ProgressToken;

/// Lifecycle state of a tracked superbucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketState {
    /// Eligible to be handed out
    Pending,
    /// Handed out, awaiting a progress update
    Active,
}

/// A tracked superbucket's last reported progress and state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntry {
    progress: BucketId,
    state: BucketState,
}

impl BucketEntry {
    pub fn new(progress: BucketId, state: BucketState) -> Self {
        Self { progress, state }
    }

    /// Deepest sub-bucket visited so far, or [`BucketId::NULL`].
    pub fn progress(&self) -> BucketId {
        self.progress
    }

    pub fn state(&self) -> BucketState {
        self.state
    }
}

/// Illegal state transitions on a progress token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgressError {
    #[error("superbucket {superbucket} is already tracked (progress {progress})")]
    DuplicateBucket {
        superbucket: BucketId,
        progress: BucketId,
    },

    #[error("superbucket {0} is not tracked")]
    UnknownBucket(BucketId),

    #[error("superbucket {0} is not pending")]
    NotPending(BucketId),

    #[error("superbucket {0} was not handed out")]
    NotActive(BucketId),

    #[error("cannot merge {bucket}: left sibling {sibling} is still tracked")]
    UnmergedSibling { bucket: BucketId, sibling: BucketId },

    #[error("superbucket {0} is already marked as failed")]
    DuplicateFailedBucket(BucketId),

    #[error(transparent)]
    Bucket(#[from] BucketError),
}

/// Errors raised while decoding a serialized progress token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("progress file is malformed or a deprecated version: expected at least 5 lines, got {0}")]
    TooFewLines(usize),

    #[error("progress file is malformed or a deprecated version: unexpected header {0:?}")]
    MalformedHeader(String),

    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("distribution bit count {0} is out of range")]
    InvalidDistributionBits(i64),

    #[error("finished bucket count {finished} exceeds total {total}")]
    InconsistentCounts { finished: u64, total: u64 },

    #[error("bucket cursor {cursor} is past total {total}")]
    CursorOutOfRange { cursor: u64, total: u64 },

    #[error("malformed bucket line {line}: {content:?}")]
    MalformedLine { line: usize, content: String },

    #[error("invalid hex value {value:?} on line {line}")]
    InvalidHex { line: usize, value: String },

    #[error("superbucket {0} appears more than once")]
    DuplicateBucket(BucketId),

    #[error("truncated progress data: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("negative bucket count {0}")]
    InvalidBucketCount(i32),

    #[error("{0} trailing bytes after progress data")]
    TrailingBytes(usize),

    #[error("invalid base64 progress token: {0}")]
    Base64(String),
}
