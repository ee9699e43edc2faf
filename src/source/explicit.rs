//! Source for an explicit, fixed set of superbuckets.

use crate::bucket::BucketId;
use crate::progress::{BucketState, ProgressState, ProgressToken};
use crate::selection::BucketSelection;
use crate::source::SourceError;
use crate::Result;

/// Visits exactly the buckets of a [`BucketSelection`].
///
/// The whole selection is seeded into the token as pending when the scan
/// starts, so the source itself never produces a bucket and never rescales.
#[derive(Debug, Clone)]
pub struct ExplicitBucketSource {
    distribution_bits: u32,
    total_bucket_count: u64,
}

impl ExplicitBucketSource {
    /// Bind a selection to `token`, seeding it when the token is fresh or
    /// validating it when the token comes from an earlier run.
    pub fn new(
        selection: &BucketSelection,
        distribution_bits: u32,
        token: &ProgressToken,
    ) -> Result<Self> {
        Self::bind(selection, distribution_bits, &mut token.lock())
    }

    pub(crate) fn bind(
        selection: &BucketSelection,
        distribution_bits: u32,
        state: &mut ProgressState,
    ) -> Result<Self> {
        let total_bucket_count = selection.len();

        if state.total_bucket_count() == 0 {
            if !state.is_empty() {
                return Err(SourceError::InconsistentToken(
                    "fresh progress already tracks buckets".to_string(),
                )
                .into());
            }
            state.set_total_bucket_count(total_bucket_count);
            state.set_distribution_bits(distribution_bits);
            state.set_bucket_cursor(0);
            state.set_finished_bucket_count(0);
            for superbucket in selection.iter() {
                state.add_bucket(superbucket, BucketId::NULL, BucketState::Pending)?;
            }
            tracing::debug!(
                buckets = total_bucket_count,
                "seeded progress with explicit bucket selection"
            );
            return Ok(Self {
                distribution_bits,
                total_bucket_count,
            });
        }

        let tracked = state.finished_bucket_count()
            + state.pending_bucket_count()
            + state.active_bucket_count();
        if state.total_bucket_count() != total_bucket_count || tracked != total_bucket_count {
            return Err(SourceError::SelectionMismatch {
                expected: total_bucket_count,
                tracked: state.total_bucket_count(),
            }
            .into());
        }
        if state.bucket_cursor() != 0 {
            return Err(SourceError::WrongSourceType(format!(
                "bucket cursor is {} but an explicit selection never advances it",
                state.bucket_cursor()
            ))
            .into());
        }

        tracing::debug!(
            buckets = total_bucket_count,
            finished = state.finished_bucket_count(),
            pending = state.pending_bucket_count(),
            "resuming explicit bucket selection"
        );
        Ok(Self {
            distribution_bits: state.distribution_bits(),
            total_bucket_count,
        })
    }

    pub fn total_bucket_count(&self) -> u64 {
        self.total_bucket_count
    }

    pub fn distribution_bit_count(&self) -> u32 {
        self.distribution_bits
    }

    pub(crate) fn has_next(&self) -> bool {
        false
    }

    pub(crate) fn next_bucket(&mut self) -> Result<BucketId> {
        Err(SourceError::NoNextBucket.into())
    }

    pub(crate) fn update(
        &mut self,
        superbucket: BucketId,
        progress: BucketId,
        state: &mut ProgressState,
    ) -> Result<()> {
        state.update_progress(superbucket, progress)?;
        Ok(())
    }
}
