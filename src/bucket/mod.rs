//! Bucket identifier module.
//!
//! This module provides the fixed-width bucket identifier used to partition
//! the document key space, together with the bit-reversed key transform that
//! orders buckets the way a recursive binary split tree is walked in-order.

use thiserror::Error;

pub mod id;
pub mod key;

// Re-export main types for public API
pub use id::BucketId;
pub use key::{from_key, low_bits_mask, nth_bucket_key, to_key, COUNT_BITS, MAX_NUM_BITS};

/// Errors specific to the bucket layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BucketError {
    /// Used-bits count outside the representable range
    #[error("invalid used-bits count {0}: must be at most {max}", max = MAX_NUM_BITS)]
    InvalidUsedBits(u32),

    /// Bucket already uses every available bit
    #[error("cannot split {0}: no bits left")]
    SplitOverflow(BucketId),

    /// Bucket has no parent to merge into
    #[error("cannot merge {0}: bucket already covers the whole key space")]
    MergeRoot(BucketId),
}
