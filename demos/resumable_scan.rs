//! Resumable scan over the whole bucket space.
//!
//! Runs a scan that stops halfway, saves its progress to a redb checkpoint
//! store, then resumes it at a finer distribution-bit count and finishes.
//!
//! cargo run --example resumable_scan

use bucket_visit::{
    BucketId, CheckpointStore, IteratorConfig, ProgressToken, Selection, VisitorIterator,
};
use std::sync::Arc;

/// Pretend to visit a superbucket. Every fifth bucket needs two passes; the
/// first pass stops after the first sub-bucket.
fn visit(superbucket: BucketId, progress: BucketId, round: u64) -> BucketId {
    if progress.is_null() && round % 5 == 4 {
        BucketId::new(superbucket.used_bits() + 1, superbucket.id()).unwrap_or(BucketId::FINISHED)
    } else {
        BucketId::FINISHED
    }
}

fn run(iterator: &mut VisitorIterator, max_rounds: u64) -> bucket_visit::Result<()> {
    for round in 0..max_rounds {
        if !iterator.has_next() {
            break;
        }
        let next = iterator.get_next()?;
        // The last bucket in id order always fails
        let used = next.superbucket.used_bits();
        if used > 0 && next.superbucket.id() == (1u64 << used) - 1 {
            iterator.report_failure(next.superbucket, next.progress, "simulated node failure")?;
            continue;
        }
        let reached = visit(next.superbucket, next.progress, round);
        iterator.update(next.superbucket, reached)?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::create(dir.path().join("checkpoints.redb"))?;

    // First run: 3 distribution bits, interrupted after a few buckets
    let token = Arc::new(ProgressToken::new());
    let mut iterator =
        VisitorIterator::create(&IteratorConfig::new(3)?, Selection::All, token.clone())?;
    run(&mut iterator, 5)?;
    store.save("demo", &token, None)?;
    println!("interrupted at {:.2}%:\n{}", token.percent_finished(), token);

    // Second run: resume from the checkpoint at 5 distribution bits
    let resumed = match store.load("demo")? {
        Some(checkpoint) => Arc::new(checkpoint.into_token()),
        None => return Err("checkpoint missing".into()),
    };
    let mut iterator =
        VisitorIterator::create(&IteratorConfig::new(5)?, Selection::All, resumed.clone())?;
    println!(
        "resumed with {} pending buckets at {} bits, {} remaining",
        resumed.pending_bucket_count(),
        iterator.distribution_bit_count(),
        iterator.remaining_bucket_count()
    );
    run(&mut iterator, u64::MAX)?;
    store.save("demo", &resumed, None)?;

    println!(
        "done: {} ({}% completed, first error: {:?})",
        iterator.is_done(),
        resumed.percent_finished(),
        resumed.first_error_message()
    );
    println!("serialized token: {}", resumed.serialize_to_string());
    Ok(())
}
