//! Line-based progress file format.
//!
//! ```text
//! VDS bucket progress file (<percent>% completed)
//! <distribution bits>
//! <bucket cursor>
//! <finished - failed>
//! <total>
//! <superbucket hex>:<progress hex>    one per tracked bucket, key order
//! <superbucket hex>:<progress hex>    one per failed bucket
//! ```
//!
//! Hex values are lower case without prefix or leading zeros.

use crate::bucket::{BucketId, MAX_NUM_BITS};
use crate::progress::{BucketState, FormatError, ProgressState};
use std::fmt::Write as _;

/// First words of every progress file.
pub const PROGRESS_HEADER: &str = "VDS bucket progress file";

const SCALAR_LINES: usize = 5;

pub(crate) fn encode(state: &ProgressState) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = write_lines(state, &mut out);
    out
}

fn write_lines(state: &ProgressState, out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "{} ({}% completed)",
        PROGRESS_HEADER,
        format_percent(state.percent_finished())
    )?;
    writeln!(out, "{}", state.distribution_bits())?;
    writeln!(out, "{}", state.bucket_cursor())?;
    let done = state
        .finished_bucket_count()
        .saturating_sub(state.failed_bucket_count());
    writeln!(out, "{}", done)?;
    writeln!(out, "{}", state.total_bucket_count())?;

    for (superbucket, entry) in state.entries() {
        writeln!(out, "{:x}:{:x}", superbucket.raw(), entry.progress().raw())?;
    }
    for (superbucket, progress) in state.failed_buckets() {
        writeln!(out, "{:x}:{:x}", superbucket.raw(), progress.raw())?;
    }
    Ok(())
}

/// Whole percentages keep one decimal (`100.0`); others print in full.
fn format_percent(percent: f64) -> String {
    if percent.fract() == 0.0 {
        format!("{:.1}", percent)
    } else {
        format!("{}", percent)
    }
}

pub(crate) fn decode(serialized: &str) -> Result<ProgressState, FormatError> {
    let lines: Vec<&str> = serialized.lines().collect();
    if lines.len() < SCALAR_LINES {
        return Err(FormatError::TooFewLines(lines.len()));
    }
    if !lines[0].starts_with(PROGRESS_HEADER) {
        return Err(FormatError::MalformedHeader(lines[0].to_string()));
    }

    let bits: i64 = parse_number(lines[1], "distribution bits")?;
    if !(0..=i64::from(MAX_NUM_BITS)).contains(&bits) {
        return Err(FormatError::InvalidDistributionBits(bits));
    }
    let cursor: u64 = parse_number(lines[2], "bucket cursor")?;
    let finished: u64 = parse_number(lines[3], "finished bucket count")?;
    let total: u64 = parse_number(lines[4], "total bucket count")?;
    check_counts(cursor, finished, total)?;

    let mut state = ProgressState::new();
    state.set_distribution_bits(bits as u32);
    state.set_bucket_cursor(cursor);
    state.set_finished_bucket_count(finished);
    state.set_total_bucket_count(total);

    if finished == total {
        return Ok(state);
    }

    for (index, line) in lines.iter().enumerate().skip(SCALAR_LINES) {
        let line_no = index + 1;
        let (superbucket, progress) =
            line.split_once(':').ok_or_else(|| FormatError::MalformedLine {
                line: line_no,
                content: line.to_string(),
            })?;
        let superbucket = BucketId::from_raw(parse_hex(superbucket, line_no)?);
        let progress = BucketId::from_raw(parse_hex(progress, line_no)?);
        state
            .add_bucket(superbucket, progress, BucketState::Pending)
            .map_err(|_| FormatError::DuplicateBucket(superbucket))?;
    }

    Ok(state)
}

/// Reject counters no scan can reach. Shared with the binary form.
pub(crate) fn check_counts(cursor: u64, finished: u64, total: u64) -> Result<(), FormatError> {
    if finished > total {
        return Err(FormatError::InconsistentCounts { finished, total });
    }
    if cursor > total {
        return Err(FormatError::CursorOutOfRange { cursor, total });
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, FormatError> {
    value.trim().parse().map_err(|_| FormatError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_hex(value: &str, line: usize) -> Result<u64, FormatError> {
    u64::from_str_radix(value.trim(), 16).map_err(|_| FormatError::InvalidHex {
        line,
        value: value.to_string(),
    })
}
