//! Source covering the whole bucket space at the current distribution-bit
//! count.
//!
//! Buckets are handed out in key order: the cursor counts how many of the
//! `2^bits` top-level buckets have been produced so far. When the bit count
//! changes, tracked buckets are split or merged to the new level and the
//! cursor and finished count are rescaled so that coverage of the key space is
//! unchanged.

use crate::bucket::{nth_bucket_key, BucketId};
use crate::progress::{BucketState, ProgressState, ProgressToken};
use crate::source::SourceError;
use crate::Result;
use std::collections::BTreeMap;

/// Walks every bucket of a `2^bits` space.
#[derive(Debug, Clone)]
pub struct DistributionRangeBucketSource {
    distribution_bits: u32,
    flush_active: bool,
}

fn bucket_count(bits: u32) -> u64 {
    1u64 << bits
}

impl DistributionRangeBucketSource {
    /// Bind the range source to `token`.
    ///
    /// A fresh token is initialised for `distribution_bits`. A resumed token
    /// keeps its own bit count; left-over active buckets are made pending and
    /// any bucket at a different bit count is split or merged to match.
    pub fn new(distribution_bits: u32, token: &ProgressToken) -> Result<Self> {
        Self::bind(distribution_bits, &mut token.lock())
    }

    pub(crate) fn bind(distribution_bits: u32, state: &mut ProgressState) -> Result<Self> {
        if state.total_bucket_count() == 0 {
            if !state.is_empty() {
                return Err(SourceError::InconsistentToken(
                    "fresh progress already tracks buckets".to_string(),
                )
                .into());
            }
            state.set_total_bucket_count(bucket_count(distribution_bits));
            state.set_distribution_bits(distribution_bits);
            state.set_bucket_cursor(0);
            state.set_finished_bucket_count(0);
            return Ok(Self {
                distribution_bits,
                flush_active: false,
            });
        }

        let bits = state.distribution_bits();
        if state.total_bucket_count() != bucket_count(bits) {
            return Err(SourceError::WrongSourceType(format!(
                "total bucket count {} does not cover the {}-bit bucket space",
                state.total_bucket_count(),
                bits
            ))
            .into());
        }

        let source = Self {
            distribution_bits: bits,
            flush_active: false,
        };
        if !state.is_finished() {
            tracing::debug!(
                distribution_bits = bits,
                cursor = state.bucket_cursor(),
                finished = state.finished_bucket_count(),
                pending = state.pending_bucket_count(),
                "importing unfinished progress"
            );
            let demoted = state.demote_active_to_pending();
            if demoted > 0 {
                tracing::debug!(demoted, "reset active buckets to pending");
            }
            correct_inconsistent_pending(bits, state)?;
            advance_cursor_past_tracked(bits, state);
        }
        state.set_inconsistent(false);
        Ok(source)
    }

    pub fn distribution_bit_count(&self) -> u32 {
        self.distribution_bits
    }

    /// True while a bit-count change waits for active buckets to report.
    pub fn should_yield(&self) -> bool {
        self.flush_active
    }

    pub(crate) fn has_next(&self, state: &ProgressState) -> bool {
        state.bucket_cursor() < bucket_count(self.distribution_bits)
    }

    pub(crate) fn next_bucket(&mut self, state: &mut ProgressState) -> Result<BucketId> {
        if !self.has_next(state) {
            return Err(SourceError::NoNextBucket.into());
        }
        let cursor = state.bucket_cursor();
        let bucket = BucketId::from_key(nth_bucket_key(cursor, self.distribution_bits));
        state.set_bucket_cursor(cursor + 1);
        Ok(bucket)
    }

    pub(crate) fn update(
        &mut self,
        superbucket: BucketId,
        progress: BucketId,
        state: &mut ProgressState,
    ) -> Result<()> {
        state.update_progress(superbucket, progress)?;
        if self.flush_active && !state.has_active() {
            tracing::info!(
                distribution_bits = self.distribution_bits,
                "all active buckets flushed; applying distribution bit change"
            );
            self.set_distribution_bit_count(self.distribution_bits, state)?;
        }
        Ok(())
    }

    /// Move the scan to `bits` distribution bits.
    ///
    /// With buckets still active the change is deferred until they have all
    /// reported; meanwhile the token is flagged inconsistent.
    pub(crate) fn set_distribution_bit_count(
        &mut self,
        bits: u32,
        state: &mut ProgressState,
    ) -> Result<()> {
        self.distribution_bits = bits;

        if state.has_active() {
            self.flush_active = true;
            state.set_inconsistent(true);
            tracing::debug!(
                active = state.active_bucket_count(),
                distribution_bits = bits,
                "holding off new and pending buckets until active buckets are updated"
            );
            return Ok(());
        }

        let old_bits = state.distribution_bits();
        correct_inconsistent_pending(bits, state)?;

        state.set_inconsistent(false);
        state.set_distribution_bits(bits);
        if bits > old_bits {
            let delta = bits - old_bits;
            state.set_bucket_cursor(state.bucket_cursor() << delta);
            state.set_finished_bucket_count(state.finished_bucket_count() << delta);
        } else if bits < old_bits {
            let delta = old_bits - bits;
            state.set_bucket_cursor(state.bucket_cursor() >> delta);
            state.set_finished_bucket_count(state.finished_bucket_count() >> delta);
        }
        state.set_total_bucket_count(bucket_count(bits));
        if bits < old_bits {
            // Merged parents can sit at or past the shifted cursor. Finished
            // halves folded into a pending parent are no longer finished.
            advance_cursor_past_tracked(bits, state);
            let handed_out = state
                .bucket_cursor()
                .saturating_sub(state.pending_bucket_count());
            if state.finished_bucket_count() > handed_out {
                state.set_finished_bucket_count(handed_out);
            }
        }
        rescale_failed_buckets(bits, state)?;
        self.flush_active = false;

        tracing::debug!(
            from = old_bits,
            to = bits,
            cursor = state.bucket_cursor(),
            finished = state.finished_bucket_count(),
            pending = state.pending_bucket_count(),
            "applied distribution bit change"
        );
        Ok(())
    }
}

/// True when every bucket ever handed out is still pending with no
/// progress, so the scan can restart from zero instead of splitting or
/// merging bucket by bucket.
fn is_lossless_reset_possible(state: &ProgressState) -> bool {
    state.pending_bucket_count() == state.bucket_cursor()
        && state
            .entries()
            .all(|(_, entry)| entry.state() == BucketState::Pending && entry.progress().is_null())
}

/// Bring every pending bucket to `target_bits` used bits.
///
/// Each pass walks a snapshot of the tracked buckets in key order; a bucket
/// that disappeared during the pass was a right sibling already folded into
/// its parent. Passes repeat while some bucket is still more than one level
/// away.
fn correct_inconsistent_pending(target_bits: u32, state: &mut ProgressState) -> Result<()> {
    if is_lossless_reset_possible(state) {
        tracing::info!(
            pending = state.pending_bucket_count(),
            "no bucket has progress; resetting cursor and clearing pending buckets"
        );
        state.clear_buckets();
        state.set_bucket_cursor(0);
        return Ok(());
    }

    let pending_before = state.pending_bucket_count();
    let mut split = 0u64;
    let mut merged = 0u64;
    let mut maybe_inconsistent = true;

    while maybe_inconsistent {
        maybe_inconsistent = false;
        for bucket in state.tracked_buckets() {
            if !state.is_tracked(bucket) {
                continue;
            }
            let used = bucket.used_bits();
            if used < target_bits {
                if used + 1 < target_bits {
                    maybe_inconsistent = true;
                }
                state.split_pending_bucket(bucket)?;
                split += 1;
            } else if used > target_bits {
                if used - 1 > target_bits {
                    maybe_inconsistent = true;
                }
                state.merge_pending_bucket(bucket)?;
                merged += 1;
            }
        }
    }

    if split > 0 || merged > 0 {
        tracing::debug!(
            split,
            merged,
            pending_before,
            pending_after = state.pending_bucket_count(),
            "corrected pending buckets to {} distribution bits",
            target_bits
        );
    }
    Ok(())
}

/// Index of a `bits`-level bucket in the order the cursor hands them out.
fn cursor_position(bucket: BucketId, bits: u32) -> u64 {
    match bits {
        0 => 0,
        _ => bucket.to_key() >> (u64::BITS - bits),
    }
}

/// Make sure the cursor never hands out a bucket the token already tracks.
fn advance_cursor_past_tracked(bits: u32, state: &mut ProgressState) {
    let mut cursor = state.bucket_cursor();
    for (bucket, _) in state.entries() {
        if bucket.used_bits() != bits {
            continue;
        }
        cursor = cursor.max(cursor_position(bucket, bits) + 1);
    }
    let cursor = cursor.min(bucket_count(bits));
    if cursor != state.bucket_cursor() {
        tracing::debug!(
            from = state.bucket_cursor(),
            to = cursor,
            "moved bucket cursor past tracked buckets"
        );
        state.set_bucket_cursor(cursor);
    }
}

/// Bring the failed ledger to `bits` used bits, after the cursor and the
/// finished count have been rescaled.
///
/// Growing splits each failed bucket into all of its descendants at the new
/// level, each keeping the recorded progress. Shrinking folds failed buckets
/// into their ancestor; an ancestor that is tracked, or that the cursor has
/// not handed out yet, is dropped since the scan visits it again anyway.
/// Either way the ledger counts buckets at the same level as `finished`.
fn rescale_failed_buckets(bits: u32, state: &mut ProgressState) -> Result<()> {
    if state.failed_bucket_count() == 0 {
        return Ok(());
    }

    let mut failed: Vec<(BucketId, BucketId)> = state.failed_buckets().collect();
    failed.sort_by_key(|(superbucket, _)| superbucket.to_key());
    let before = failed.len();

    let mut rescaled = BTreeMap::new();
    for (superbucket, progress) in failed {
        let used = superbucket.used_bits();
        if used <= bits {
            let mut level = vec![superbucket];
            for _ in used..bits {
                let mut next = Vec::with_capacity(level.len() * 2);
                for bucket in level {
                    let (left, right) = bucket.split()?;
                    next.push(left);
                    next.push(right);
                }
                level = next;
            }
            for child in level {
                rescaled.insert(child, progress);
            }
        } else {
            let ancestor = BucketId::new(bits, superbucket.id())?;
            if state.is_tracked(ancestor)
                || cursor_position(ancestor, bits) >= state.bucket_cursor()
            {
                continue;
            }
            // Siblings earlier in key order are finished, so the first
            // failed descendant's progress is valid for the ancestor.
            rescaled.entry(ancestor).or_insert(progress);
        }
    }

    tracing::debug!(
        before,
        after = rescaled.len(),
        distribution_bits = bits,
        "rescaled failed buckets"
    );
    state.replace_failed_buckets(rescaled);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn bucket(used_bits: u32, id: u64) -> BucketId {
        BucketId::new(used_bits, id).unwrap()
    }

    fn drain(source: &mut DistributionRangeBucketSource, state: &mut ProgressState) -> Vec<BucketId> {
        let mut out = Vec::new();
        while source.has_next(state) {
            out.push(source.next_bucket(state).unwrap());
        }
        out
    }

    #[test]
    fn test_fresh_token() {
        let mut state = ProgressState::new();
        let source = DistributionRangeBucketSource::bind(4, &mut state).unwrap();
        assert_eq!(source.distribution_bit_count(), 4);
        assert_eq!(state.total_bucket_count(), 16);
        assert_eq!(state.bucket_cursor(), 0);
        assert!(!source.should_yield());
    }

    #[test]
    fn test_buckets_in_key_order() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(2, &mut state).unwrap();
        assert_eq!(
            drain(&mut source, &mut state),
            vec![bucket(2, 0b00), bucket(2, 0b10), bucket(2, 0b01), bucket(2, 0b11)]
        );
        assert_eq!(state.bucket_cursor(), 4);
        assert!(matches!(
            source.next_bucket(&mut state),
            Err(Error::Source(SourceError::NoNextBucket))
        ));
    }

    #[test]
    fn test_zero_bits_has_single_bucket() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(0, &mut state).unwrap();
        assert_eq!(state.total_bucket_count(), 1);
        assert_eq!(drain(&mut source, &mut state), vec![BucketId::NULL]);
    }

    #[test]
    fn test_lossless_reset() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(2, &mut state).unwrap();
        for bucket in drain(&mut source, &mut state) {
            state
                .add_bucket(bucket, BucketId::NULL, BucketState::Pending)
                .unwrap();
        }

        source.set_distribution_bit_count(4, &mut state).unwrap();
        assert_eq!(state.total_bucket_count(), 16);
        assert_eq!(state.bucket_cursor(), 0);
        assert_eq!(state.pending_bucket_count(), 0);
        assert!(state.is_empty());
        assert_eq!(state.distribution_bits(), 4);
    }

    #[test]
    fn test_split_keeps_progress() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(1, &mut state).unwrap();
        let first = source.next_bucket(&mut state).unwrap();
        assert_eq!(first, bucket(1, 0));
        state
            .add_bucket(first, bucket(2, 0b10), BucketState::Pending)
            .unwrap();

        source.set_distribution_bit_count(2, &mut state).unwrap();
        assert_eq!(
            state.tracked_buckets(),
            vec![bucket(2, 0b00), bucket(2, 0b10)]
        );
        for child in state.tracked_buckets() {
            assert_eq!(state.entry(child).unwrap().progress(), bucket(2, 0b10));
        }
        assert_eq!(state.bucket_cursor(), 2);
        assert_eq!(state.total_bucket_count(), 4);

        // Next fresh bucket is the first one under (1, 1)
        assert_eq!(source.next_bucket(&mut state).unwrap(), bucket(2, 0b01));
    }

    #[test]
    fn test_merge_scales_counters_down() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(3, &mut state).unwrap();
        let buckets = drain(&mut source, &mut state);
        // Finish the first four buckets (the left half), keep the next two pending
        for bucket in &buckets[..4] {
            state
                .add_bucket(*bucket, BucketId::NULL, BucketState::Active)
                .unwrap();
            state.update_progress(*bucket, BucketId::FINISHED).unwrap();
        }
        state
            .add_bucket(buckets[4], bucket(5, 0b00001), BucketState::Pending)
            .unwrap();
        state
            .add_bucket(buckets[5], BucketId::NULL, BucketState::Pending)
            .unwrap();
        state.set_bucket_cursor(6);

        source.set_distribution_bit_count(1, &mut state).unwrap();
        assert_eq!(state.total_bucket_count(), 2);
        assert_eq!(state.finished_bucket_count(), 1);
        // Shifted to 1, then moved past the merged (1, 1)
        assert_eq!(state.bucket_cursor(), 2);
        assert_eq!(state.tracked_buckets(), vec![bucket(1, 1)]);
        assert_eq!(
            state.entry(bucket(1, 1)).unwrap().progress(),
            bucket(5, 0b00001)
        );
        assert_eq!(
            state.active_bucket_count() + state.pending_bucket_count() + state.finished_bucket_count(),
            state.total_bucket_count()
        );
    }

    #[test]
    fn test_merge_never_hands_out_tracked_parent() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(2, &mut state).unwrap();
        // Key order at 2 bits: 00, 10, 01, 11
        for _ in 0..3 {
            let next = source.next_bucket(&mut state).unwrap();
            state
                .add_bucket(next, BucketId::NULL, BucketState::Active)
                .unwrap();
        }
        state.update_progress(bucket(2, 0b00), BucketId::FINISHED).unwrap();
        state.update_progress(bucket(2, 0b10), BucketId::FINISHED).unwrap();
        state
            .update_progress(bucket(2, 0b01), bucket(4, 0b0101))
            .unwrap();

        source.set_distribution_bit_count(1, &mut state).unwrap();
        assert_eq!(state.tracked_buckets(), vec![bucket(1, 1)]);
        assert_eq!(state.bucket_cursor(), 2);
        assert_eq!(state.finished_bucket_count(), 1);
        assert!(!source.has_next(&state));
    }

    fn hand_out(source: &mut DistributionRangeBucketSource, state: &mut ProgressState) -> BucketId {
        let next = source.next_bucket(state).unwrap();
        state
            .add_bucket(next, BucketId::NULL, BucketState::Active)
            .unwrap();
        next
    }

    fn fail(state: &mut ProgressState, superbucket: BucketId, progress: BucketId) {
        state
            .add_failed_bucket(superbucket, progress, "visit failed")
            .unwrap();
        state.update_progress(superbucket, BucketId::FINISHED).unwrap();
    }

    #[test]
    fn test_grow_splits_failed_buckets() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(1, &mut state).unwrap();
        let failed = hand_out(&mut source, &mut state);
        let done = hand_out(&mut source, &mut state);
        fail(&mut state, failed, bucket(2, 0b10));
        state.update_progress(done, BucketId::FINISHED).unwrap();

        source.set_distribution_bit_count(3, &mut state).unwrap();
        assert_eq!(state.finished_bucket_count(), 8);
        assert_eq!(state.failed_bucket_count(), 4);
        let mut ledger: Vec<(BucketId, BucketId)> = state.failed_buckets().collect();
        ledger.sort_by_key(|(superbucket, _)| superbucket.to_key());
        assert_eq!(
            ledger,
            vec![
                (bucket(3, 0b000), bucket(2, 0b10)),
                (bucket(3, 0b100), bucket(2, 0b10)),
                (bucket(3, 0b010), bucket(2, 0b10)),
                (bucket(3, 0b110), bucket(2, 0b10)),
            ]
        );
    }

    #[test]
    fn test_shrink_folds_failed_buckets() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(2, &mut state).unwrap();
        // Key order at 2 bits: 00, 10, 01, 11; the last one is never handed out
        let first = hand_out(&mut source, &mut state);
        let second = hand_out(&mut source, &mut state);
        let third = hand_out(&mut source, &mut state);
        fail(&mut state, first, bucket(4, 0b0100));
        state.update_progress(second, BucketId::FINISHED).unwrap();
        fail(&mut state, third, BucketId::NULL);

        source.set_distribution_bit_count(1, &mut state).unwrap();
        assert_eq!(state.bucket_cursor(), 1);
        assert_eq!(state.finished_bucket_count(), 1);
        // (1, 1) is handed out again by the cursor, so only (1, 0) stays failed
        assert_eq!(
            state.failed_buckets().collect::<Vec<_>>(),
            vec![(bucket(1, 0), bucket(4, 0b0100))]
        );
        assert!(state.failed_bucket_count() <= state.finished_bucket_count());
    }

    #[test]
    fn test_shrink_drops_failed_bucket_under_tracked_parent() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(1, &mut state).unwrap();
        let left = hand_out(&mut source, &mut state);
        let right = hand_out(&mut source, &mut state);
        fail(&mut state, left, BucketId::NULL);
        state.update_progress(right, bucket(3, 0b001)).unwrap();

        source.set_distribution_bit_count(0, &mut state).unwrap();
        assert_eq!(state.tracked_buckets(), vec![bucket(0, 0)]);
        assert_eq!(state.finished_bucket_count(), 0);
        assert_eq!(state.failed_bucket_count(), 0);
        assert_eq!(state.first_error_message(), Some("visit failed"));
    }

    #[test]
    fn test_rescale_waits_for_active_buckets() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(1, &mut state).unwrap();
        let first = source.next_bucket(&mut state).unwrap();
        state
            .add_bucket(first, BucketId::NULL, BucketState::Active)
            .unwrap();

        source.set_distribution_bit_count(3, &mut state).unwrap();
        assert!(source.should_yield());
        assert!(state.is_inconsistent());
        assert_eq!(state.distribution_bits(), 1);
        assert_eq!(state.total_bucket_count(), 2);

        source.update(first, BucketId::FINISHED, &mut state).unwrap();
        assert!(!source.should_yield());
        assert!(!state.is_inconsistent());
        assert_eq!(state.distribution_bits(), 3);
        assert_eq!(state.total_bucket_count(), 8);
        assert_eq!(state.finished_bucket_count(), 4);
        assert_eq!(state.bucket_cursor(), 4);
    }

    #[test]
    fn test_partial_update_during_flush_is_split_afterwards() {
        let mut state = ProgressState::new();
        let mut source = DistributionRangeBucketSource::bind(1, &mut state).unwrap();
        let first = source.next_bucket(&mut state).unwrap();
        state
            .add_bucket(first, BucketId::NULL, BucketState::Active)
            .unwrap();

        source.set_distribution_bit_count(2, &mut state).unwrap();
        source.update(first, bucket(3, 0b100), &mut state).unwrap();

        assert_eq!(state.distribution_bits(), 2);
        assert_eq!(
            state.tracked_buckets(),
            vec![bucket(2, 0b00), bucket(2, 0b10)]
        );
        assert_eq!(state.bucket_cursor(), 2);
    }

    #[test]
    fn test_resume_corrects_mixed_bit_counts() {
        let mut state = ProgressState::new();
        state.set_distribution_bits(2);
        state.set_total_bucket_count(4);
        state.set_bucket_cursor(2);
        state.set_finished_bucket_count(1);
        // Written mid-flush: one bucket still at 1 bit, one already at 2
        state
            .add_bucket(bucket(1, 1), bucket(3, 0b101), BucketState::Pending)
            .unwrap();
        state
            .add_bucket(bucket(2, 0b10), BucketId::NULL, BucketState::Active)
            .unwrap();

        let source = DistributionRangeBucketSource::bind(8, &mut state).unwrap();
        assert_eq!(source.distribution_bit_count(), 2);
        assert_eq!(state.active_bucket_count(), 0);
        assert_eq!(
            state.tracked_buckets(),
            vec![bucket(2, 0b10), bucket(2, 0b01), bucket(2, 0b11)]
        );
        // (2, 0b11) is the last bucket in key order
        assert_eq!(state.bucket_cursor(), 4);
    }

    #[test]
    fn test_resume_explicit_token_fails() {
        let mut state = ProgressState::new();
        state.set_distribution_bits(16);
        state.set_total_bucket_count(3);
        state
            .add_bucket(bucket(16, 7), BucketId::NULL, BucketState::Pending)
            .unwrap();
        assert!(matches!(
            DistributionRangeBucketSource::bind(16, &mut state),
            Err(Error::Source(SourceError::WrongSourceType(_)))
        ));
    }
}
