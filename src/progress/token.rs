//! Thread-safe progress token.

use crate::bucket::BucketId;
use crate::progress::{
    binary, text, BucketEntry, BucketState, FormatError, ProgressError, ProgressState,
};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::str::FromStr;

/// Durable record of a scan's progress.
///
/// Every read and every mutation goes through one mutex, so a monitoring
/// thread may serialize the token or ask for [`percent_finished`] while the
/// driving thread keeps updating it. The iterator holds the lock for the
/// whole of each `get_next`/`update` so bucket sources see a consistent view.
///
/// [`percent_finished`]: ProgressToken::percent_finished
#[derive(Default)]
pub struct ProgressToken {
    state: Mutex<ProgressState>,
}

impl ProgressToken {
    /// Create an empty token for a new scan.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: ProgressState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock()
    }

    /// Parse the line-based text form produced by [`ProgressToken::to_text`].
    pub fn from_text(serialized: &str) -> Result<Self, FormatError> {
        text::decode(serialized).map(Self::from_state)
    }

    /// Render the line-based text form.
    ///
    /// Failed buckets are written after the pending ones and are read back as
    /// pending, so a resumed scan retries them.
    pub fn to_text(&self) -> String {
        text::encode(&self.lock())
    }

    /// Parse the binary form produced by [`ProgressToken::serialize`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        binary::decode(bytes).map(Self::from_state)
    }

    /// Render the big-endian binary form. The failed-bucket ledger is not
    /// part of this form.
    pub fn serialize(&self) -> Vec<u8> {
        binary::encode(&self.lock())
    }

    /// URL-safe base64 of the binary form.
    pub fn serialize_to_string(&self) -> String {
        binary::encode_string(&self.lock())
    }

    /// Parse a string token, accepting URL-safe base64 and falling back to
    /// standard base64 with line breaks.
    pub fn from_serialized_string(serialized: &str) -> Result<Self, FormatError> {
        binary::decode_string(serialized).map(Self::from_state)
    }

    pub fn percent_finished(&self) -> f64 {
        self.lock().percent_finished()
    }

    pub fn add_bucket(
        &self,
        superbucket: BucketId,
        progress: BucketId,
        state: BucketState,
    ) -> Result<(), ProgressError> {
        self.lock().add_bucket(superbucket, progress, state)
    }

    pub fn update_progress(
        &self,
        superbucket: BucketId,
        progress: BucketId,
    ) -> Result<(), ProgressError> {
        self.lock().update_progress(superbucket, progress)
    }

    pub fn split_pending_bucket(&self, bucket: BucketId) -> Result<(), ProgressError> {
        self.lock().split_pending_bucket(bucket)
    }

    pub fn merge_pending_bucket(&self, bucket: BucketId) -> Result<(), ProgressError> {
        self.lock().merge_pending_bucket(bucket)
    }

    /// Record that visiting `superbucket` failed after reaching `progress`.
    ///
    /// Only the first error message is kept.
    pub fn add_failed_bucket(
        &self,
        superbucket: BucketId,
        progress: BucketId,
        message: &str,
    ) -> Result<(), ProgressError> {
        self.lock().add_failed_bucket(superbucket, progress, message)
    }

    pub fn active_bucket_count(&self) -> u64 {
        self.lock().active_bucket_count()
    }

    pub fn pending_bucket_count(&self) -> u64 {
        self.lock().pending_bucket_count()
    }

    pub fn finished_bucket_count(&self) -> u64 {
        self.lock().finished_bucket_count()
    }

    pub fn total_bucket_count(&self) -> u64 {
        self.lock().total_bucket_count()
    }

    pub fn bucket_cursor(&self) -> u64 {
        self.lock().bucket_cursor()
    }

    pub fn distribution_bits(&self) -> u32 {
        self.lock().distribution_bits()
    }

    /// True while a distribution-bit change waits for active buckets.
    pub fn is_inconsistent(&self) -> bool {
        self.lock().is_inconsistent()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().is_finished()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.lock().has_pending()
    }

    pub fn has_active(&self) -> bool {
        self.lock().has_active()
    }

    /// Snapshot of the tracked superbuckets, in key order.
    pub fn buckets(&self) -> Vec<(BucketId, BucketEntry)> {
        self.lock()
            .entries()
            .map(|(superbucket, entry)| (superbucket, *entry))
            .collect()
    }

    /// Snapshot of the failed-bucket ledger, ordered by raw id.
    pub fn failed_buckets(&self) -> Vec<(BucketId, BucketId)> {
        self.lock().failed_buckets().collect()
    }

    pub fn contains_failed_buckets(&self) -> bool {
        self.lock().failed_bucket_count() > 0
    }

    pub fn first_error_message(&self) -> Option<String> {
        self.lock().first_error_message().map(str::to_string)
    }
}

impl Clone for ProgressToken {
    fn clone(&self) -> Self {
        Self::from_state(self.lock().clone())
    }
}

impl PartialEq for ProgressToken {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let ours = self.lock().clone();
        let theirs = other.lock();
        ours == *theirs
    }
}

impl fmt::Debug for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ProgressToken")
            .field("distribution_bits", &state.distribution_bits())
            .field("bucket_cursor", &state.bucket_cursor())
            .field("active", &state.active_bucket_count())
            .field("pending", &state.pending_bucket_count())
            .field("finished", &state.finished_bucket_count())
            .field("total", &state.total_bucket_count())
            .field("inconsistent", &state.is_inconsistent())
            .finish()
    }
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromStr for ProgressToken {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_text(s)
    }
}
