//! Visitor iterator driving a resumable bucket scan.
//!
//! The iterator pairs a [`BucketSource`] with a shared [`ProgressToken`]. A
//! driver loop asks for the next superbucket, visits (part of) it and reports
//! back how far it got:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use bucket_visit::{BucketId, IteratorConfig, ProgressToken, Selection, VisitorIterator};
//! # fn visit(_: BucketId, _: BucketId) -> BucketId { BucketId::FINISHED }
//! # fn main() -> bucket_visit::Result<()> {
//! let token = Arc::new(ProgressToken::new());
//! let mut iterator =
//!     VisitorIterator::create(&IteratorConfig::default(), Selection::All, token.clone())?;
//! while !iterator.is_done() {
//!     if !iterator.has_next() {
//!         break;
//!     }
//!     let next = iterator.get_next()?;
//!     let reached = visit(next.superbucket, next.progress);
//!     iterator.update(next.superbucket, reached)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Pending buckets from earlier partial visits are always handed out before
//! the source produces a new one.

use crate::bucket::{BucketId, MAX_NUM_BITS};
use crate::config::{IteratorConfig, Selection};
use crate::progress::{BucketState, ProgressError, ProgressState, ProgressToken};
use crate::selection::BucketSelection;
use crate::source::{BucketSource, DistributionRangeBucketSource, ExplicitBucketSource, SourceError};
use crate::{Error, Result};
use std::sync::Arc;

/// A superbucket handed out for visiting and where to resume inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketProgress {
    pub superbucket: BucketId,
    /// Last sub-bucket already visited, or [`BucketId::NULL`] to start from
    /// the beginning
    pub progress: BucketId,
}

/// Resumable iterator over the superbuckets of a scan.
#[derive(Debug)]
pub struct VisitorIterator {
    token: Arc<ProgressToken>,
    source: BucketSource,
}

impl VisitorIterator {
    /// Creates an iterator for `selection` bound to `token`.
    ///
    /// A fresh token starts a new scan at `config.distribution_bits`. A token
    /// from an earlier run resumes where it stopped; for range scans it is
    /// then rescaled to the configured bit count.
    ///
    /// # Arguments
    /// * `config` - Iterator configuration
    /// * `selection` - Buckets to visit
    /// * `token` - Shared progress token, fresh or deserialized
    ///
    /// # Returns
    /// Iterator ready to hand out buckets, or an error if the token does not
    /// fit the selection
    pub fn create(
        config: &IteratorConfig,
        selection: Selection,
        token: Arc<ProgressToken>,
    ) -> Result<Self> {
        let bits = config.distribution_bits;
        let mut iterator = match selection {
            Selection::All => Self::for_all_buckets(bits, token)?,
            Selection::Explicit(buckets) => Self::for_explicit_buckets(&buckets, bits, token)?,
        };
        iterator.set_distribution_bit_count(bits)?;
        Ok(iterator)
    }

    /// Creates an iterator over every bucket of a `2^distribution_bits` space.
    ///
    /// A resumed token keeps its recorded bit count.
    pub fn for_all_buckets(distribution_bits: u32, token: Arc<ProgressToken>) -> Result<Self> {
        check_distribution_bits(distribution_bits)?;
        let source = DistributionRangeBucketSource::bind(distribution_bits, &mut token.lock())?;
        tracing::debug!(
            distribution_bits = source.distribution_bit_count(),
            "created range visitor iterator"
        );
        Ok(Self {
            token,
            source: source.into(),
        })
    }

    /// Creates an iterator over exactly the buckets of `selection`.
    pub fn for_explicit_buckets(
        selection: &BucketSelection,
        distribution_bits: u32,
        token: Arc<ProgressToken>,
    ) -> Result<Self> {
        check_distribution_bits(distribution_bits)?;
        let source =
            ExplicitBucketSource::bind(selection, distribution_bits, &mut token.lock())?;
        tracing::debug!(
            buckets = source.total_bucket_count(),
            "created explicit visitor iterator"
        );
        Ok(Self {
            token,
            source: source.into(),
        })
    }

    fn has_next_locked(&self, state: &ProgressState) -> bool {
        (state.has_pending() || self.source.has_next(state)) && !self.source.should_yield()
    }

    /// True if [`VisitorIterator::get_next`] can hand out a bucket right now.
    ///
    /// This is false while a distribution-bit change waits for active buckets,
    /// even though work remains.
    pub fn has_next(&self) -> bool {
        self.has_next_locked(&self.token.lock())
    }

    /// Hands out the next bucket to visit and marks it active.
    pub fn get_next(&mut self) -> Result<BucketProgress> {
        let mut state = self.token.lock();
        if !self.has_next_locked(&state) {
            return Err(SourceError::NoNextBucket.into());
        }

        if let Some((superbucket, progress)) = state.activate_first_pending() {
            tracing::trace!(%superbucket, %progress, "resuming pending bucket");
            return Ok(BucketProgress {
                superbucket,
                progress,
            });
        }

        let superbucket = self.source.next_bucket(&mut state)?;
        state.add_bucket(superbucket, BucketId::NULL, BucketState::Active)?;
        tracing::trace!(%superbucket, "starting new bucket");
        Ok(BucketProgress {
            superbucket,
            progress: BucketId::NULL,
        })
    }

    /// Reports how far an active bucket was visited.
    ///
    /// [`BucketId::FINISHED`] completes the bucket; any other progress puts it
    /// back in the pending queue to be resumed from there.
    pub fn update(&mut self, superbucket: BucketId, progress: BucketId) -> Result<()> {
        let mut state = self.token.lock();
        require_active(&state, superbucket)?;
        self.source.update(superbucket, progress, &mut state)
    }

    /// Records that visiting `superbucket` failed and takes it out of the scan.
    ///
    /// The bucket counts as finished for this run. The text form of the
    /// token keeps it, so it is retried when the scan is resumed from text.
    pub fn report_failure(
        &mut self,
        superbucket: BucketId,
        progress: BucketId,
        message: &str,
    ) -> Result<()> {
        let mut state = self.token.lock();
        require_active(&state, superbucket)?;
        state.add_failed_bucket(superbucket, progress, message)?;
        tracing::warn!(%superbucket, %progress, error = message, "bucket visit failed");
        self.source
            .update(superbucket, BucketId::FINISHED, &mut state)
    }

    /// True once nothing is left to hand out and no bucket is in flight.
    pub fn is_done(&self) -> bool {
        let state = self.token.lock();
        !self.has_next_locked(&state) && !state.has_active()
    }

    pub fn remaining_bucket_count(&self) -> u64 {
        let state = self.token.lock();
        state
            .total_bucket_count()
            .saturating_sub(state.finished_bucket_count())
    }

    /// Changes the number of distribution bits of a range scan.
    ///
    /// Explicit scans ignore the call. With buckets still active the change
    /// takes effect once they have all been updated; until then
    /// [`VisitorIterator::has_next`] is false.
    pub fn set_distribution_bit_count(&mut self, bits: u32) -> Result<()> {
        check_distribution_bits(bits)?;
        if !self.source.visits_all_buckets() || bits == self.source.distribution_bit_count() {
            return Ok(());
        }
        let mut state = self.token.lock();
        tracing::info!(
            from = self.source.distribution_bit_count(),
            to = bits,
            "changing distribution bit count"
        );
        self.source.set_distribution_bit_count(bits, &mut state)
    }

    pub fn distribution_bit_count(&self) -> u32 {
        self.source.distribution_bit_count()
    }

    pub fn progress_token(&self) -> &Arc<ProgressToken> {
        &self.token
    }

    /// True for range scans, false for explicit selections.
    pub fn visits_all_buckets(&self) -> bool {
        self.source.visits_all_buckets()
    }
}

fn check_distribution_bits(bits: u32) -> Result<()> {
    if bits > MAX_NUM_BITS {
        return Err(Error::InvalidInput(format!(
            "distribution bits must be at most {}, got {}",
            MAX_NUM_BITS, bits
        )));
    }
    Ok(())
}

fn require_active(state: &ProgressState, superbucket: BucketId) -> Result<()> {
    match state.entry(superbucket) {
        None => Err(ProgressError::UnknownBucket(superbucket).into()),
        Some(entry) if entry.state() != BucketState::Active => {
            Err(ProgressError::NotActive(superbucket).into())
        }
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn bucket(used_bits: u32, id: u64) -> BucketId {
        BucketId::new(used_bits, id).unwrap()
    }

    fn range_iterator(bits: u32) -> VisitorIterator {
        VisitorIterator::for_all_buckets(bits, Arc::new(ProgressToken::new())).unwrap()
    }

    #[test]
    fn test_drain_range_scan() {
        let mut iterator = range_iterator(4);
        assert!(iterator.visits_all_buckets());
        assert_eq!(iterator.remaining_bucket_count(), 16);

        let mut visited = Vec::new();
        while iterator.has_next() {
            let next = iterator.get_next().unwrap();
            assert_eq!(next.progress, BucketId::NULL);
            visited.push(next.superbucket);
            iterator.update(next.superbucket, BucketId::FINISHED).unwrap();
        }

        assert_eq!(visited.len(), 16);
        assert!(visited.windows(2).all(|pair| pair[0].to_key() < pair[1].to_key()));
        assert!(iterator.is_done());
        assert_eq!(iterator.remaining_bucket_count(), 0);
        assert_eq!(iterator.progress_token().percent_finished(), 100.0);
    }

    #[test]
    fn test_pending_buckets_come_first() {
        let mut iterator = range_iterator(2);
        let first = iterator.get_next().unwrap();
        let second = iterator.get_next().unwrap();
        assert_eq!(second.superbucket, bucket(2, 0b10));

        let partial = bucket(4, 0b1010);
        iterator.update(second.superbucket, partial).unwrap();
        assert_eq!(
            iterator.get_next().unwrap(),
            BucketProgress {
                superbucket: second.superbucket,
                progress: partial
            }
        );

        // The first bucket is still active and not handed out again
        let next = iterator.get_next().unwrap();
        assert_eq!(next.superbucket, bucket(2, 0b01));
        assert_ne!(next.superbucket, first.superbucket);
    }

    #[test]
    fn test_get_next_without_buckets_fails() {
        let mut iterator = range_iterator(0);
        let only = iterator.get_next().unwrap();
        assert!(!iterator.has_next());
        assert!(!iterator.is_done());
        assert!(matches!(
            iterator.get_next(),
            Err(Error::Source(SourceError::NoNextBucket))
        ));

        iterator.update(only.superbucket, BucketId::FINISHED).unwrap();
        assert!(iterator.is_done());
    }

    #[test]
    fn test_update_requires_active_bucket() {
        let mut iterator = range_iterator(2);
        let next = iterator.get_next().unwrap();

        assert!(matches!(
            iterator.update(bucket(2, 0b11), BucketId::FINISHED),
            Err(Error::Progress(ProgressError::UnknownBucket(_)))
        ));

        iterator.update(next.superbucket, bucket(3, 0b000)).unwrap();
        assert!(matches!(
            iterator.update(next.superbucket, BucketId::FINISHED),
            Err(Error::Progress(ProgressError::NotActive(_)))
        ));
    }

    #[test]
    fn test_yield_while_flushing_active_buckets() {
        let mut iterator = range_iterator(2);
        let first = iterator.get_next().unwrap();
        let second = iterator.get_next().unwrap();

        iterator.set_distribution_bit_count(3).unwrap();
        assert_eq!(iterator.distribution_bit_count(), 3);
        assert!(!iterator.has_next());
        assert!(!iterator.is_done());
        assert!(iterator.progress_token().is_inconsistent());

        iterator.update(first.superbucket, BucketId::FINISHED).unwrap();
        assert!(!iterator.has_next());

        iterator
            .update(second.superbucket, bucket(4, 0b0010))
            .unwrap();
        assert!(iterator.has_next());

        let token = iterator.progress_token().clone();
        assert!(!token.is_inconsistent());
        assert_eq!(token.distribution_bits(), 3);
        assert_eq!(token.total_bucket_count(), 8);
        assert_eq!(token.finished_bucket_count(), 2);
        assert_eq!(token.bucket_cursor(), 4);
        assert_eq!(token.pending_bucket_count(), 2);

        assert_eq!(
            iterator.get_next().unwrap(),
            BucketProgress {
                superbucket: bucket(3, 0b010),
                progress: bucket(4, 0b0010)
            }
        );
    }

    #[test]
    fn test_bit_change_leaves_explicit_token_untouched() {
        let selection: BucketSelection = [bucket(8, 3), bucket(8, 9)].into_iter().collect();
        let token = Arc::new(ProgressToken::new());
        let mut iterator = VisitorIterator::for_explicit_buckets(&selection, 8, token.clone()).unwrap();
        let active = iterator.get_next().unwrap();
        let before = token.to_text();

        iterator.set_distribution_bit_count(12).unwrap();
        assert_eq!(token.to_text(), before);
        assert!(!token.is_inconsistent());
        assert!(iterator.has_next());

        iterator.update(active.superbucket, BucketId::FINISHED).unwrap();
        assert_eq!(token.distribution_bits(), 8);
        assert_eq!(iterator.distribution_bit_count(), 8);
    }

    #[test]
    fn test_explicit_selection_visited_once() {
        let selection: BucketSelection = (0..5u64).map(|id| bucket(16, id * 7)).collect();
        let mut iterator = VisitorIterator::for_explicit_buckets(
            &selection,
            16,
            Arc::new(ProgressToken::new()),
        )
        .unwrap();
        assert!(!iterator.visits_all_buckets());

        // Bit changes do not apply to explicit selections
        iterator.set_distribution_bit_count(20).unwrap();
        assert_eq!(iterator.distribution_bit_count(), 16);

        let mut finished = BTreeSet::new();
        let mut partial_done = false;
        while iterator.has_next() {
            let next = iterator.get_next().unwrap();
            if !partial_done {
                partial_done = true;
                iterator
                    .update(next.superbucket, bucket(20, next.superbucket.id()))
                    .unwrap();
                continue;
            }
            assert!(finished.insert(next.superbucket));
            iterator.update(next.superbucket, BucketId::FINISHED).unwrap();
        }

        assert_eq!(finished, selection.iter().collect::<BTreeSet<_>>());
        assert!(iterator.is_done());
        assert_eq!(iterator.progress_token().finished_bucket_count(), 5);
    }

    #[test]
    fn test_report_failure() {
        let mut iterator = range_iterator(1);
        let next = iterator.get_next().unwrap();
        iterator
            .report_failure(next.superbucket, bucket(3, 0b000), "storage node down")
            .unwrap();

        let token = iterator.progress_token();
        assert_eq!(token.finished_bucket_count(), 1);
        assert!(token.contains_failed_buckets());
        assert_eq!(token.first_error_message().as_deref(), Some("storage node down"));

        // Failed buckets come back as pending when resuming from text
        let resumed = Arc::new(ProgressToken::from_text(&token.to_text()).unwrap());
        let mut iterator = VisitorIterator::for_all_buckets(1, resumed).unwrap();
        assert_eq!(
            iterator.get_next().unwrap(),
            BucketProgress {
                superbucket: next.superbucket,
                progress: bucket(3, 0b000)
            }
        );
    }

    #[test]
    fn test_create_rescales_resumed_token() {
        let token = Arc::new(ProgressToken::new());
        let mut iterator =
            VisitorIterator::create(&IteratorConfig::new(2).unwrap(), Selection::All, token.clone())
                .unwrap();
        let next = iterator.get_next().unwrap();
        iterator.update(next.superbucket, BucketId::FINISHED).unwrap();

        let resumed = Arc::new(ProgressToken::from_serialized_string(&token.serialize_to_string()).unwrap());
        let iterator =
            VisitorIterator::create(&IteratorConfig::new(4).unwrap(), Selection::All, resumed)
                .unwrap();
        let token = iterator.progress_token();
        assert_eq!(iterator.distribution_bit_count(), 4);
        assert_eq!(token.total_bucket_count(), 16);
        assert_eq!(token.finished_bucket_count(), 4);
        assert_eq!(token.bucket_cursor(), 4);
        assert_eq!(iterator.remaining_bucket_count(), 12);
    }

    #[test]
    fn test_invalid_bit_count() {
        let mut iterator = range_iterator(2);
        assert!(matches!(
            iterator.set_distribution_bit_count(59),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            VisitorIterator::for_all_buckets(64, Arc::new(ProgressToken::new())),
            Err(Error::InvalidInput(_))
        ));
    }
}
