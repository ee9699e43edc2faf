//! Bucket identifier implementation.

use crate::bucket::key::{self, low_bits_mask, COUNT_BITS, MAX_NUM_BITS};
use crate::bucket::BucketError;
use std::fmt;

const COUNT_MASK: u64 = low_bits_mask(COUNT_BITS) << MAX_NUM_BITS;

/// A bucket in the document key space.
///
/// The raw 64-bit value carries the used-bits count in its top six bits and
/// the bucket number in the low 58. A bucket with `u` used bits contains
/// every bucket that agrees with it on the low `u` bits and uses at least
/// `u` bits itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BucketId(u64);

impl BucketId {
    /// Bucket with zero used bits; used as "no progress yet".
    pub const NULL: BucketId = BucketId(0);

    /// Sentinel progress value marking a superbucket as fully visited.
    pub const FINISHED: BucketId = BucketId(u64::MAX);

    /// Create a bucket from a used-bits count and a bucket number.
    ///
    /// Bits of `id` above `used_bits` are discarded.
    pub fn new(used_bits: u32, id: u64) -> Result<Self, BucketError> {
        if used_bits > MAX_NUM_BITS {
            return Err(BucketError::InvalidUsedBits(used_bits));
        }
        Ok(Self((u64::from(used_bits) << MAX_NUM_BITS) | (id & low_bits_mask(used_bits))))
    }

    /// Wrap a raw value as-is.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Rebuild a bucket from its ordering key.
    pub fn from_key(key: u64) -> Self {
        Self(key::from_key(key))
    }

    /// Raw 64-bit representation.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Number of significant low-order bits.
    pub const fn used_bits(self) -> u32 {
        (self.0 >> MAX_NUM_BITS) as u32
    }

    /// Bucket number restricted to the used bits.
    pub fn id(self) -> u64 {
        self.0 & low_bits_mask(self.used_bits().min(MAX_NUM_BITS))
    }

    /// Same bucket with every bit above the used bits cleared.
    pub fn stripped(self) -> Self {
        Self((self.0 & COUNT_MASK) | self.id())
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_finished(self) -> bool {
        self == Self::FINISHED
    }

    /// Ordering key of this bucket; see [`crate::bucket::key`].
    pub fn to_key(self) -> u64 {
        key::to_key(self.stripped().0)
    }

    /// Whether `other` lies in the sub-tree rooted at this bucket.
    pub fn contains(self, other: BucketId) -> bool {
        let used = self.used_bits();
        other.used_bits() >= used
            && (self.0 ^ other.0) & low_bits_mask(used.min(MAX_NUM_BITS)) == 0
    }

    /// Split into the two children one level down.
    ///
    /// `(u, x)` becomes `(u + 1, x)` and `(u + 1, x | 1 << u)`.
    pub fn split(self) -> Result<(BucketId, BucketId), BucketError> {
        let used = self.used_bits();
        if used >= MAX_NUM_BITS {
            return Err(BucketError::SplitOverflow(self));
        }
        let id = self.id();
        Ok((
            BucketId::new(used + 1, id)?,
            BucketId::new(used + 1, id | (1u64 << used))?,
        ))
    }

    /// The bucket one level up that this bucket merges into.
    pub fn parent(self) -> Result<BucketId, BucketError> {
        let used = self.used_bits();
        if used == 0 || used > MAX_NUM_BITS {
            return Err(BucketError::MergeRoot(self));
        }
        BucketId::new(used - 1, self.id())
    }

    /// Whether the highest used bit is set, i.e. this is a right child.
    pub fn is_right_child(self) -> bool {
        let used = self.used_bits();
        used > 0 && used <= MAX_NUM_BITS && self.id() & (1u64 << (used - 1)) != 0
    }

    /// The other child of this bucket's parent.
    pub fn sibling(self) -> Result<BucketId, BucketError> {
        let used = self.used_bits();
        if used == 0 || used > MAX_NUM_BITS {
            return Err(BucketError::MergeRoot(self));
        }
        BucketId::new(used, self.id() ^ (1u64 << (used - 1)))
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId(0x{:016x})", self.0)
    }
}

impl fmt::Debug for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_finished() {
            return write!(f, "BucketId(FINISHED)");
        }
        write!(f, "BucketId({}, 0x{:x})", self.used_bits(), self.id())
    }
}
