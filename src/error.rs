//! Error types shared by every layer of the kernel.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur anywhere in the storage kernel.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Cache is full: no free slot for key {key}")]
    CacheFull { key: u64 },

    #[error("Data too large: {size} bytes exceeds the per-page limit of {max}")]
    DataTooLarge { size: usize, max: usize },

    #[error("Database busy: no page with enough free space after {attempts} attempts")]
    DatabaseBusy { attempts: usize },

    #[error("Entry not found: uid {0:#x}")]
    NullEntry(u64),

    #[error("Transaction {0} not found")]
    TransactionNotFound(u64),

    #[error("Concurrent update conflict, transaction {0} was aborted")]
    ConcurrentUpdate(u64),

    #[error("Deadlock detected for transaction {xid} waiting on uid {uid:#x}")]
    Deadlock { xid: u64, uid: u64 },

    #[error("Memory quota too small: {0} bytes")]
    MemTooSmall(u64),

    #[error("Invalid memory quota: {0:?}")]
    InvalidMem(String),

    #[error("Corrupted {file}: {reason}")]
    Corrupted { file: &'static str, reason: String },

    #[error("Range {start}..{end} out of bounds (limit {limit})")]
    OutOfBounds {
        start: usize,
        end: usize,
        limit: usize,
    },

    #[error("File already exists: {0:?}")]
    FileExists(PathBuf),

    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log record encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl DbError {
    /// Whether this error marks the transaction as dead.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrentUpdate(_))
    }

    pub(crate) fn corrupted(file: &'static str, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            file,
            reason: reason.into(),
        }
    }
}

/// Result type for kernel operations.
pub type DbResult<T> = Result<T, DbError>;
