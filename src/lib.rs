pub mod bucket;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod iterator;
pub mod progress;
pub mod selection;
pub mod source;

// Re-export common types for convenience
pub use bucket::BucketId;
pub use checkpoint::{CheckpointStore, StoredCheckpoint};
pub use config::{IteratorConfig, Selection};
pub use error::{Error, Result};
pub use iterator::{BucketProgress, VisitorIterator};
pub use progress::{BucketEntry, BucketState, ProgressToken};
pub use selection::BucketSelection;
