//! Binary progress format and its base64 string form.
//!
//! All fields are big-endian:
//!
//! [distribution_bits:i32][cursor:i64][finished:i64][total:i64][count:i32]
//! followed by `count` pairs of [superbucket:i64][progress:i64]
//!
//! Every tracked bucket is written, active ones included, and all of them
//! are read back as pending. The failed-bucket ledger is not part of this
//! form: failed buckets stay counted as finished.

use crate::bucket::{BucketId, MAX_NUM_BITS};
use crate::progress::{text, BucketState, FormatError, ProgressState};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;

const HEADER_LEN: usize = 4 + 8 + 8 + 8 + 4;
const PAIR_LEN: usize = 8 + 8;

pub(crate) fn encode(state: &ProgressState) -> Vec<u8> {
    let count = state.active_bucket_count() + state.pending_bucket_count();
    let mut buf = Vec::with_capacity(HEADER_LEN + PAIR_LEN * count as usize);

    buf.extend_from_slice(&(state.distribution_bits() as i32).to_be_bytes());
    buf.extend_from_slice(&state.bucket_cursor().to_be_bytes());
    buf.extend_from_slice(&state.finished_bucket_count().to_be_bytes());
    buf.extend_from_slice(&state.total_bucket_count().to_be_bytes());
    buf.extend_from_slice(&(count as i32).to_be_bytes());

    for (superbucket, entry) in state.entries() {
        buf.extend_from_slice(&superbucket.raw().to_be_bytes());
        buf.extend_from_slice(&entry.progress().raw().to_be_bytes());
    }

    buf
}

pub(crate) fn decode(bytes: &[u8]) -> Result<ProgressState, FormatError> {
    let mut reader = Reader::new(bytes);

    let bits = reader.read_i32()?;
    if !(0..=MAX_NUM_BITS as i32).contains(&bits) {
        return Err(FormatError::InvalidDistributionBits(i64::from(bits)));
    }
    let cursor = reader.read_u64()?;
    let finished = reader.read_u64()?;
    let total = reader.read_u64()?;
    text::check_counts(cursor, finished, total)?;
    let count = reader.read_i32()?;
    if count < 0 {
        return Err(FormatError::InvalidBucketCount(count));
    }

    let mut state = ProgressState::new();
    state.set_distribution_bits(bits as u32);
    state.set_bucket_cursor(cursor);
    state.set_finished_bucket_count(finished);
    state.set_total_bucket_count(total);

    for _ in 0..count {
        let superbucket = BucketId::from_raw(reader.read_u64()?);
        let progress = BucketId::from_raw(reader.read_u64()?);
        state
            .add_bucket(superbucket, progress, BucketState::Pending)
            .map_err(|_| FormatError::DuplicateBucket(superbucket))?;
    }

    if reader.remaining() > 0 {
        return Err(FormatError::TrailingBytes(reader.remaining()));
    }
    Ok(state)
}

pub(crate) fn encode_string(state: &ProgressState) -> String {
    URL_SAFE.encode(encode(state))
}

pub(crate) fn decode_string(serialized: &str) -> Result<ProgressState, FormatError> {
    let bytes = match URL_SAFE.decode(serialized) {
        Ok(bytes) => bytes,
        Err(_) => {
            // Older tokens were plain base64, possibly wrapped over several lines
            let compact: String = serialized
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            STANDARD
                .decode(compact)
                .map_err(|err| FormatError::Base64(err.to_string()))?
        }
    };
    decode(&bytes)
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn remaining(&self) -> usize {
        self.data.len()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        if self.data.len() < N {
            return Err(FormatError::Truncated {
                needed: N,
                remaining: self.data.len(),
            });
        }
        let (head, tail) = self.data.split_at(N);
        self.data = tail;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn read_i32(&mut self) -> Result<i32, FormatError> {
        self.take::<4>().map(i32::from_be_bytes)
    }

    fn read_u64(&mut self) -> Result<u64, FormatError> {
        self.take::<8>().map(u64::from_be_bytes)
    }
}
