//! Bucket key transform.
//!
//! A bucket id keeps its used-bits count in the top [`COUNT_BITS`] bits and
//! the id proper in the low [`MAX_NUM_BITS`] bits. The key form reverses the
//! id bits into the top of the word and moves the count to the bottom:
//!
//! Raw id: [count:6][id:58]
//! Key:    [reverse(id):58][count:6]
//!
//! Comparing keys as unsigned integers then visits a parent before its left
//! child, and every key below the left child before the right child.

/// Number of high bits holding the used-bits count.
pub const COUNT_BITS: u32 = 6;

/// Number of bits available for the id proper.
pub const MAX_NUM_BITS: u32 = 64 - COUNT_BITS;

const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

/// Returns a mask of the `bits` lowest bits.
///
/// Total for every shift count: 0 yields an empty mask and anything at or
/// above 64 yields all ones.
pub const fn low_bits_mask(bits: u32) -> u64 {
    match bits {
        0 => 0,
        b if b >= u64::BITS => u64::MAX,
        b => u64::MAX >> (u64::BITS - b),
    }
}

/// Transforms a raw bucket id into its ordering key.
pub fn to_key(raw: u64) -> u64 {
    let count = raw >> MAX_NUM_BITS;
    (raw.reverse_bits() & !COUNT_MASK) | count
}

/// Inverse of [`to_key`].
pub fn from_key(key: u64) -> u64 {
    let count = key << MAX_NUM_BITS;
    ((key.reverse_bits() << COUNT_BITS) >> COUNT_BITS) | count
}

/// Returns the key of the `n`th bucket (in key order) when the space is
/// split into `2^bits` buckets.
///
/// With `bits == 0` there is a single root bucket and `n` must be 0.
pub fn nth_bucket_key(n: u64, bits: u32) -> u64 {
    debug_assert!(bits <= MAX_NUM_BITS);
    let shifted = n.checked_shl(u64::BITS - bits).unwrap_or(0);
    shifted | u64::from(bits)
}
