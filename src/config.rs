//! Configuration for visitor iterators.

use crate::bucket::MAX_NUM_BITS;
use crate::selection::BucketSelection;
use crate::Error;

/// Configuration for a [`crate::VisitorIterator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorConfig {
    /// Number of distribution bits used to split the key space
    ///
    /// A range scan visits `2^distribution_bits` superbuckets. When resuming,
    /// the count recorded in the token is used first and the scan is then
    /// rescaled to this value. Must be at most 58.
    pub distribution_bits: u32,
}

impl IteratorConfig {
    /// Creates a validated configuration.
    ///
    /// # Arguments
    /// * `distribution_bits` - Number of distribution bits (0-58)
    ///
    /// # Returns
    /// Validated configuration or error
    pub fn new(distribution_bits: u32) -> crate::Result<Self> {
        if distribution_bits > MAX_NUM_BITS {
            return Err(Error::InvalidInput(format!(
                "distribution bits must be at most {}, got {}",
                MAX_NUM_BITS, distribution_bits
            )));
        }
        Ok(Self { distribution_bits })
    }
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self {
            distribution_bits: 16,
        }
    }
}

/// Which superbuckets a scan covers.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Every bucket at the configured distribution-bit count
    All,
    /// Exactly the given buckets
    Explicit(BucketSelection),
}

impl From<BucketSelection> for Selection {
    fn from(selection: BucketSelection) -> Self {
        Selection::Explicit(selection)
    }
}
