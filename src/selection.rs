//! Explicit bucket selections.
//!
//! A selection is the fixed set of superbuckets an explicit scan visits. It is
//! stored as a roaring bitmap of raw bucket ids, so large selections of
//! neighbouring buckets stay compact.

use crate::bucket::BucketId;
use roaring::RoaringTreemap;
use xxhash_rust::xxh3::xxh3_64;

/// Deduplicated set of superbuckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketSelection {
    buckets: RoaringTreemap,
}

impl BucketSelection {
    /// Creates an empty selection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bucket. Returns false if it was already selected.
    ///
    /// Bits above the used-bits count are ignored, so two ids naming the
    /// same bucket are stored once.
    pub fn insert(&mut self, bucket: BucketId) -> bool {
        self.buckets.insert(bucket.stripped().raw())
    }

    pub fn contains(&self, bucket: BucketId) -> bool {
        self.buckets.contains(bucket.stripped().raw())
    }

    pub fn len(&self) -> u64 {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Selected buckets in raw-id order.
    pub fn iter(&self) -> impl Iterator<Item = BucketId> + '_ {
        self.buckets.iter().map(BucketId::from_raw)
    }

    /// Hash of the selected ids.
    ///
    /// Equal selections always give the same fingerprint, which lets a stored
    /// checkpoint notice that it was written for a different selection.
    pub fn fingerprint(&self) -> u64 {
        let mut buf = Vec::with_capacity(8 * self.buckets.len() as usize);
        for raw in self.buckets.iter() {
            buf.extend_from_slice(&raw.to_be_bytes());
        }
        xxh3_64(&buf)
    }
}

impl FromIterator<BucketId> for BucketSelection {
    fn from_iter<I: IntoIterator<Item = BucketId>>(iter: I) -> Self {
        let mut selection = Self::new();
        selection.extend(iter);
        selection
    }
}

impl Extend<BucketId> for BucketSelection {
    fn extend<I: IntoIterator<Item = BucketId>>(&mut self, iter: I) {
        for bucket in iter {
            self.insert(bucket);
        }
    }
}
