//! Bucket source strategies.
//!
//! A bucket source decides which superbuckets a scan covers. The range source
//! walks the whole `2^bits` bucket space and follows distribution-bit changes;
//! the explicit source visits a fixed set handed in by the caller and seeds
//! all of it into the progress token up front.

use crate::bucket::BucketId;
use crate::progress::ProgressState;
use crate::Result;
use thiserror::Error;

pub mod explicit;
pub mod range;

pub use explicit::ExplicitBucketSource;
pub use range::DistributionRangeBucketSource;

/// Errors specific to the bucket sources and the iterator contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// A resumed token does not describe the current selection
    #[error("total bucket count in existing progress ({tracked}) is not consistent with that of the current selection ({expected})")]
    SelectionMismatch { expected: u64, tracked: u64 },

    /// A resumed token was produced by the other kind of source
    #[error("cannot use the given progress with this bucket source: {0}")]
    WrongSourceType(String),

    /// A fresh token already tracks buckets
    #[error("inconsistent progress state: {0}")]
    InconsistentToken(String),

    /// `get_next` called while `has_next` is false
    #[error("no bucket available; has_next() is false")]
    NoNextBucket,
}

/// The source bound to a progress token.
#[derive(Debug, Clone)]
pub enum BucketSource {
    Range(DistributionRangeBucketSource),
    Explicit(ExplicitBucketSource),
}

impl BucketSource {
    pub(crate) fn has_next(&self, state: &ProgressState) -> bool {
        match self {
            BucketSource::Range(source) => source.has_next(state),
            BucketSource::Explicit(source) => source.has_next(),
        }
    }

    /// Whether the iterator must hold back new and pending buckets.
    pub fn should_yield(&self) -> bool {
        match self {
            BucketSource::Range(source) => source.should_yield(),
            BucketSource::Explicit(_) => false,
        }
    }

    pub fn visits_all_buckets(&self) -> bool {
        matches!(self, BucketSource::Range(_))
    }

    pub fn distribution_bit_count(&self) -> u32 {
        match self {
            BucketSource::Range(source) => source.distribution_bit_count(),
            BucketSource::Explicit(source) => source.distribution_bit_count(),
        }
    }

    pub(crate) fn next_bucket(&mut self, state: &mut ProgressState) -> Result<BucketId> {
        match self {
            BucketSource::Range(source) => source.next_bucket(state),
            BucketSource::Explicit(source) => source.next_bucket(),
        }
    }

    pub(crate) fn update(
        &mut self,
        superbucket: BucketId,
        progress: BucketId,
        state: &mut ProgressState,
    ) -> Result<()> {
        match self {
            BucketSource::Range(source) => source.update(superbucket, progress, state),
            BucketSource::Explicit(source) => source.update(superbucket, progress, state),
        }
    }

    /// Rescaling only applies to the range source; an explicit set is fixed.
    pub(crate) fn set_distribution_bit_count(
        &mut self,
        bits: u32,
        state: &mut ProgressState,
    ) -> Result<()> {
        match self {
            BucketSource::Range(source) => source.set_distribution_bit_count(bits, state),
            BucketSource::Explicit(_) => Ok(()),
        }
    }
}

impl From<DistributionRangeBucketSource> for BucketSource {
    fn from(source: DistributionRangeBucketSource) -> Self {
        BucketSource::Range(source)
    }
}

impl From<ExplicitBucketSource> for BucketSource {
    fn from(source: ExplicitBucketSource) -> Self {
        BucketSource::Explicit(source)
    }
}
