//! Mutable progress state guarded by [`super::ProgressToken`].
//!
//! Bucket sources and the iterator operate on this type through the narrow
//! mutation API below while holding the token's lock. The bucket map is keyed
//! by bucket key (see [`crate::bucket::key`]), so iteration follows the
//! in-order walk of the split tree.

use crate::bucket::{BucketId, MAX_NUM_BITS};
use crate::progress::{BucketEntry, BucketState, ProgressError};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct ProgressState {
    buckets: BTreeMap<u64, BucketEntry>,
    // Keys of pending entries, so the first pending bucket is found without a scan
    pending: BTreeSet<u64>,
    failed: BTreeMap<BucketId, BucketId>,
    first_error: Option<String>,
    finished: u64,
    total: u64,
    cursor: u64,
    distribution_bits: u32,
    inconsistent: bool,
}

impl ProgressState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn active_bucket_count(&self) -> u64 {
        (self.buckets.len() - self.pending.len()) as u64
    }

    pub(crate) fn pending_bucket_count(&self) -> u64 {
        self.pending.len() as u64
    }

    pub(crate) fn finished_bucket_count(&self) -> u64 {
        self.finished
    }

    pub(crate) fn total_bucket_count(&self) -> u64 {
        self.total
    }

    pub(crate) fn bucket_cursor(&self) -> u64 {
        self.cursor
    }

    pub(crate) fn distribution_bits(&self) -> u32 {
        self.distribution_bits
    }

    pub(crate) fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished == self.total
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn has_active(&self) -> bool {
        self.buckets.len() > self.pending.len()
    }

    pub(crate) fn is_tracked(&self, superbucket: BucketId) -> bool {
        self.buckets.contains_key(&superbucket.to_key())
    }

    pub(crate) fn entry(&self, superbucket: BucketId) -> Option<&BucketEntry> {
        self.buckets.get(&superbucket.to_key())
    }

    /// Tracked superbuckets and their entries, in key order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (BucketId, &BucketEntry)> + '_ {
        self.buckets
            .iter()
            .map(|(key, entry)| (BucketId::from_key(*key), entry))
    }

    pub(crate) fn tracked_buckets(&self) -> Vec<BucketId> {
        self.buckets.keys().map(|key| BucketId::from_key(*key)).collect()
    }

    pub(crate) fn failed_buckets(&self) -> impl Iterator<Item = (BucketId, BucketId)> + '_ {
        self.failed.iter().map(|(superbucket, progress)| (*superbucket, *progress))
    }

    pub(crate) fn failed_bucket_count(&self) -> u64 {
        self.failed.len() as u64
    }

    pub(crate) fn first_error_message(&self) -> Option<&str> {
        self.first_error.as_deref()
    }

    pub(crate) fn set_finished_bucket_count(&mut self, finished: u64) {
        self.finished = finished;
    }

    pub(crate) fn set_total_bucket_count(&mut self, total: u64) {
        self.total = total;
    }

    pub(crate) fn set_bucket_cursor(&mut self, cursor: u64) {
        self.cursor = cursor;
    }

    pub(crate) fn set_distribution_bits(&mut self, bits: u32) {
        debug_assert!(bits <= MAX_NUM_BITS);
        self.distribution_bits = bits;
    }

    pub(crate) fn set_inconsistent(&mut self, inconsistent: bool) {
        self.inconsistent = inconsistent;
    }

    /// Start tracking `superbucket`.
    ///
    /// A `FINISHED` progress means there is nothing left to visit, so the
    /// call is a no-op.
    pub(crate) fn add_bucket(
        &mut self,
        superbucket: BucketId,
        progress: BucketId,
        state: BucketState,
    ) -> Result<(), ProgressError> {
        if progress.is_finished() {
            tracing::trace!(%superbucket, "ignoring already finished superbucket");
            return Ok(());
        }

        let key = superbucket.to_key();
        match self.buckets.entry(key) {
            Entry::Occupied(_) => {
                return Err(ProgressError::DuplicateBucket {
                    superbucket,
                    progress,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(BucketEntry::new(progress, state));
            }
        }
        if state == BucketState::Pending {
            self.pending.insert(key);
        }
        Ok(())
    }

    /// Record progress for a tracked superbucket.
    ///
    /// `FINISHED` removes the bucket and counts it as done; anything else
    /// stores the progress and makes the bucket pending again.
    pub(crate) fn update_progress(
        &mut self,
        superbucket: BucketId,
        progress: BucketId,
    ) -> Result<(), ProgressError> {
        let key = superbucket.to_key();
        let entry = self
            .buckets
            .get_mut(&key)
            .ok_or(ProgressError::UnknownBucket(superbucket))?;

        if progress.is_finished() {
            self.buckets.remove(&key);
            self.pending.remove(&key);
            self.finished += 1;
        } else {
            entry.progress = progress;
            entry.state = BucketState::Pending;
            self.pending.insert(key);
        }
        Ok(())
    }

    /// Hand out the first pending bucket in key order.
    pub(crate) fn activate_first_pending(&mut self) -> Option<(BucketId, BucketId)> {
        let key = self.pending.pop_first()?;
        let entry = self.buckets.get_mut(&key)?;
        entry.state = BucketState::Active;
        Some((BucketId::from_key(key), entry.progress))
    }

    /// Move every active bucket back to pending. Returns how many moved.
    pub(crate) fn demote_active_to_pending(&mut self) -> u64 {
        let mut demoted = 0;
        for (key, entry) in self.buckets.iter_mut() {
            if entry.state == BucketState::Active {
                entry.state = BucketState::Pending;
                self.pending.insert(*key);
                demoted += 1;
            }
        }
        demoted
    }

    /// Drop every tracked bucket. Counters and the failed ledger are kept.
    pub(crate) fn clear_buckets(&mut self) {
        self.buckets.clear();
        self.pending.clear();
    }

    fn pending_entry(&self, bucket: BucketId) -> Result<BucketEntry, ProgressError> {
        let entry = self
            .buckets
            .get(&bucket.to_key())
            .ok_or(ProgressError::UnknownBucket(bucket))?;
        if entry.state != BucketState::Pending {
            return Err(ProgressError::NotPending(bucket));
        }
        Ok(*entry)
    }

    fn remove_bucket(&mut self, bucket: BucketId) {
        let key = bucket.to_key();
        self.buckets.remove(&key);
        self.pending.remove(&key);
    }

    /// Replace a pending bucket by its two children, both carrying the
    /// parent's progress.
    pub(crate) fn split_pending_bucket(&mut self, bucket: BucketId) -> Result<(), ProgressError> {
        let entry = self.pending_entry(bucket)?;
        let (left, right) = bucket.split()?;
        for child in [left, right] {
            if self.is_tracked(child) {
                return Err(ProgressError::DuplicateBucket {
                    superbucket: child,
                    progress: entry.progress,
                });
            }
        }

        self.remove_bucket(bucket);
        self.add_bucket(left, entry.progress, BucketState::Pending)?;
        self.add_bucket(right, entry.progress, BucketState::Pending)?;
        Ok(())
    }

    /// Replace a pending bucket (and its right sibling, if tracked) by the
    /// parent bucket, keeping this bucket's progress.
    ///
    /// A right child may only be merged once its left sibling is gone; the
    /// left sibling would otherwise have folded it in already.
    pub(crate) fn merge_pending_bucket(&mut self, bucket: BucketId) -> Result<(), ProgressError> {
        let entry = self.pending_entry(bucket)?;
        let parent = bucket.parent()?;
        let sibling = bucket.sibling()?;

        if bucket.is_right_child() {
            if self.is_tracked(sibling) {
                return Err(ProgressError::UnmergedSibling { bucket, sibling });
            }
        } else if self.is_tracked(sibling) {
            self.pending_entry(sibling)?;
            self.remove_bucket(sibling);
        }

        if self.is_tracked(parent) {
            // Already covered by a coarser pending bucket
            self.pending_entry(parent)?;
            self.remove_bucket(bucket);
            return Ok(());
        }
        self.remove_bucket(bucket);
        self.add_bucket(parent, entry.progress, BucketState::Pending)
    }

    pub(crate) fn add_failed_bucket(
        &mut self,
        superbucket: BucketId,
        progress: BucketId,
        message: &str,
    ) -> Result<(), ProgressError> {
        match self.failed.entry(superbucket) {
            Entry::Occupied(_) => return Err(ProgressError::DuplicateFailedBucket(superbucket)),
            Entry::Vacant(slot) => {
                slot.insert(progress);
            }
        }
        if self.first_error.is_none() {
            self.first_error = Some(message.to_string());
        }
        Ok(())
    }

    /// Swap in a rescaled failed ledger. The first error message is kept.
    pub(crate) fn replace_failed_buckets(&mut self, failed: BTreeMap<BucketId, BucketId>) {
        self.failed = failed;
    }

    /// Estimated completion in percent.
    ///
    /// Finished buckets count fully; tracked buckets contribute the fraction
    /// of their sub-tree already walked. Buckets whose progress is null or
    /// lies outside the superbucket (left over from a rescale) contribute
    /// nothing.
    pub(crate) fn percent_finished(&self) -> f64 {
        if self.total == 0 || self.finished == self.total {
            return 100.0;
        }

        let bucket_share = 100.0 / self.total as f64;
        let sub_progress: f64 = self
            .entries()
            .filter(|(superbucket, entry)| {
                !entry.progress.is_null() && superbucket.contains(entry.progress)
            })
            .map(|(superbucket, entry)| bucket_share * progress_fraction(superbucket, entry.progress))
            .sum();

        (self.finished as f64 / self.total as f64) * 100.0 + sub_progress
    }
}

/// Fraction of `superbucket`'s sub-tree visited once `progress` is reached.
///
/// The split bits between the two buckets, read in key order, give the
/// position of `progress` among the `2^splits` sub-buckets.
pub(crate) fn progress_fraction(superbucket: BucketId, progress: BucketId) -> f64 {
    let super_used = superbucket.used_bits();
    let progress_used = progress.used_bits();
    if progress_used == 0 || progress_used < super_used || progress_used > MAX_NUM_BITS {
        return 0.0;
    }

    let splits = progress_used - super_used;
    if splits == 0 {
        return 1.0;
    }

    let position = (progress.to_key() << super_used) >> (u64::BITS - splits);
    (position + 1) as f64 / (1u64 << splits) as f64
}
