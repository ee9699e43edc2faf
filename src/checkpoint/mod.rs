//! Durable checkpoints for progress tokens.
//!
//! A checkpoint store keeps the latest progress of named scans in a redb
//! table, so a scan can be resumed after a restart. Each record is
//!
//! [version:u8][has_fingerprint:u8][fingerprint:u64 BE][token text]
//!
//! The fingerprint, when present, identifies the explicit bucket selection
//! the scan was started with.

use crate::progress::ProgressToken;
use crate::selection::BucketSelection;
use crate::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use std::fmt;
use std::path::Path;


const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("bucket_visit_checkpoints");

const RECORD_VERSION: u8 = 1;
const RECORD_HEADER_LEN: usize = 1 + 1 + 8;

/// Errors returned by checkpoint operations.
#[derive(Debug)]
pub enum CheckpointError {
    /// Failed to create or open the database file.
    DatabaseOpenFailed(String),

    /// Failed to begin a transaction.
    TransactionFailed(String),

    /// Failed to open the checkpoint table.
    TableOpenFailed(String),

    /// Failed to read a checkpoint record.
    ReadFailed(String),

    /// Failed to write or delete a checkpoint record.
    WriteFailed(String),

    /// Failed to commit the write transaction.
    CommitFailed(String),

    /// Record written by an unknown format version.
    UnsupportedVersion(u8),

    /// Record bytes do not follow the checkpoint layout.
    MalformedRecord(String),

    /// Stored checkpoint belongs to a different bucket selection.
    SelectionChanged {
        name: String,
        stored: Option<u64>,
        current: u64,
    },
}

impl std::error::Error for CheckpointError {}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::DatabaseOpenFailed(msg) => write!(f, "Database open failed: {}", msg),
            CheckpointError::TransactionFailed(msg) => write!(f, "Transaction failed: {}", msg),
            CheckpointError::TableOpenFailed(msg) => write!(f, "Table open failed: {}", msg),
            CheckpointError::ReadFailed(msg) => write!(f, "Read failed: {}", msg),
            CheckpointError::WriteFailed(msg) => write!(f, "Write failed: {}", msg),
            CheckpointError::CommitFailed(msg) => write!(f, "Commit failed: {}", msg),
            CheckpointError::UnsupportedVersion(version) => {
                write!(f, "Unsupported checkpoint version: {}", version)
            }
            CheckpointError::MalformedRecord(msg) => write!(f, "Malformed checkpoint: {}", msg),
            CheckpointError::SelectionChanged {
                name,
                stored,
                current,
            } => match stored {
                Some(stored) => write!(
                    f,
                    "Checkpoint {} was saved for selection {:016x}, current selection is {:016x}",
                    name, stored, current
                ),
                None => write!(
                    f,
                    "Checkpoint {} was saved for a full range scan, not selection {:016x}",
                    name, current
                ),
            },
        }
    }
}

/// A checkpoint read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCheckpoint {
    token: ProgressToken,
    fingerprint: Option<u64>,
}

impl StoredCheckpoint {
    pub fn token(&self) -> &ProgressToken {
        &self.token
    }

    pub fn into_token(self) -> ProgressToken {
        self.token
    }

    /// Fingerprint of the selection the scan was saved for, if any.
    pub fn fingerprint(&self) -> Option<u64> {
        self.fingerprint
    }
}

/// Named progress checkpoints kept in a redb database.
pub struct CheckpointStore {
    db: Database,
}

impl CheckpointStore {
    /// Create or open a checkpoint database at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())
            .map_err(|err| CheckpointError::DatabaseOpenFailed(err.to_string()))?;
        Ok(Self::new(db))
    }

    /// Use an already open database. The checkpoint table is created on the
    /// first save.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Store the current state of `token` under `name`, replacing any
    /// previous checkpoint.
    ///
    /// # Arguments
    /// * `name` - Scan name
    /// * `token` - Progress to persist
    /// * `fingerprint` - Selection fingerprint for explicit scans, `None` for
    ///   range scans
    pub fn save(&self, name: &str, token: &ProgressToken, fingerprint: Option<u64>) -> Result<()> {
        let record = encode_record(token, fingerprint);

        let write_txn = self
            .db
            .begin_write()
            .map_err(|err| CheckpointError::TransactionFailed(format!("write: {}", err)))?;
        {
            let mut table = write_txn
                .open_table(CHECKPOINTS)
                .map_err(|err| CheckpointError::TableOpenFailed(err.to_string()))?;
            table
                .insert(name, record.as_slice())
                .map_err(|err| CheckpointError::WriteFailed(format!("{}: {}", name, err)))?;
        }
        write_txn
            .commit()
            .map_err(|err| CheckpointError::CommitFailed(err.to_string()))?;

        tracing::debug!(
            name,
            bytes = record.len(),
            finished = token.finished_bucket_count(),
            total = token.total_bucket_count(),
            "saved checkpoint"
        );
        Ok(())
    }

    /// Read the checkpoint stored under `name`.
    pub fn load(&self, name: &str) -> Result<Option<StoredCheckpoint>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|err| CheckpointError::TransactionFailed(format!("read: {}", err)))?;
        let table = match read_txn.open_table(CHECKPOINTS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(CheckpointError::TableOpenFailed(err.to_string()).into()),
        };

        let record = table
            .get(name)
            .map_err(|err| CheckpointError::ReadFailed(format!("{}: {}", name, err)))?;
        match record {
            Some(record) => {
                let checkpoint = decode_record(record.value())?;
                tracing::debug!(
                    name,
                    finished = checkpoint.token.finished_bucket_count(),
                    total = checkpoint.token.total_bucket_count(),
                    "loaded checkpoint"
                );
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    /// Read the checkpoint of an explicit scan, verifying that it was saved
    /// for `selection`.
    pub fn load_for_selection(
        &self,
        name: &str,
        selection: &BucketSelection,
    ) -> Result<Option<ProgressToken>> {
        let checkpoint = match self.load(name)? {
            Some(checkpoint) => checkpoint,
            None => return Ok(None),
        };

        let current = selection.fingerprint();
        if checkpoint.fingerprint != Some(current) {
            return Err(CheckpointError::SelectionChanged {
                name: name.to_string(),
                stored: checkpoint.fingerprint,
                current,
            }
            .into());
        }
        Ok(Some(checkpoint.into_token()))
    }

    /// Delete the checkpoint stored under `name`. Returns whether one existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|err| CheckpointError::TransactionFailed(format!("write: {}", err)))?;
        let removed = {
            let mut table = write_txn
                .open_table(CHECKPOINTS)
                .map_err(|err| CheckpointError::TableOpenFailed(err.to_string()))?;
            let removed = table
                .remove(name)
                .map_err(|err| CheckpointError::WriteFailed(format!("{}: {}", name, err)))?
                .is_some();
            removed
        };
        write_txn
            .commit()
            .map_err(|err| CheckpointError::CommitFailed(err.to_string()))?;

        if removed {
            tracing::debug!(name, "removed checkpoint");
        }
        Ok(removed)
    }

    /// Names of all stored checkpoints, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|err| CheckpointError::TransactionFailed(format!("read: {}", err)))?;
        let table = match read_txn.open_table(CHECKPOINTS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(CheckpointError::TableOpenFailed(err.to_string()).into()),
        };

        let iter = table
            .iter()
            .map_err(|err| CheckpointError::ReadFailed(err.to_string()))?;
        let mut names = Vec::new();
        for entry in iter {
            let (key, _) = entry.map_err(|err| CheckpointError::ReadFailed(err.to_string()))?;
            names.push(key.value().to_string());
        }
        Ok(names)
    }
}

fn encode_record(token: &ProgressToken, fingerprint: Option<u64>) -> Vec<u8> {
    let text = token.to_text();
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + text.len());
    record.push(RECORD_VERSION);
    record.push(u8::from(fingerprint.is_some()));
    record.extend_from_slice(&fingerprint.unwrap_or(0).to_be_bytes());
    record.extend_from_slice(text.as_bytes());
    record
}

fn decode_record(data: &[u8]) -> Result<StoredCheckpoint> {
    if data.is_empty() {
        return Err(CheckpointError::MalformedRecord("empty record".to_string()).into());
    }
    if data[0] != RECORD_VERSION {
        return Err(CheckpointError::UnsupportedVersion(data[0]).into());
    }
    if data.len() < RECORD_HEADER_LEN {
        return Err(CheckpointError::MalformedRecord(format!(
            "record header needs {} bytes, got {}",
            RECORD_HEADER_LEN,
            data.len()
        ))
        .into());
    }

    let mut fingerprint_bytes = [0u8; 8];
    fingerprint_bytes.copy_from_slice(&data[2..RECORD_HEADER_LEN]);
    let fingerprint = match data[1] {
        0 => None,
        1 => Some(u64::from_be_bytes(fingerprint_bytes)),
        flag => {
            return Err(
                CheckpointError::MalformedRecord(format!("invalid fingerprint flag {}", flag))
                    .into(),
            )
        }
    };

    let text = std::str::from_utf8(&data[RECORD_HEADER_LEN..])
        .map_err(|err| CheckpointError::MalformedRecord(err.to_string()))?;
    let token = ProgressToken::from_text(text)?;
    Ok(StoredCheckpoint { token, fingerprint })
}
