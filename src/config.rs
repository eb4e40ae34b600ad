//! Database configuration.
//!
//! A database lives in three sibling files derived from one base path:
//! `<path>.db` holds pages, `<path>.log` the write-ahead log and `<path>.xid`
//! the transaction ledger.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{DbError, DbResult};

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;
pub const GB: u64 = 1 << 30;

/// Default memory quota for the page cache (64MB).
pub const DEFAULT_MEM: u64 = 64 * MB;

/// Default bound on page allocation attempts for a single insert.
pub const DEFAULT_INSERT_RETRIES: usize = 5;

pub const DB_SUFFIX: &str = ".db";
pub const LOG_SUFFIX: &str = ".log";
pub const XID_SUFFIX: &str = ".xid";

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Base path; the suffixes above are appended to it.
    pub path: PathBuf,
    /// Memory quota for the page cache in bytes.
    pub mem: u64,
    /// How many times an insert may allocate a fresh page before giving up.
    pub insert_retries: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("mintdb"),
            mem: DEFAULT_MEM,
            insert_retries: DEFAULT_INSERT_RETRIES,
        }
    }
}

impl DatabaseConfig {
    /// Create a configuration for the given base path with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DatabaseConfig {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the memory quota.
    pub fn with_mem(mut self, mem: u64) -> Self {
        self.mem = mem;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        with_suffix(&self.path, DB_SUFFIX)
    }

    pub fn log_path(&self) -> PathBuf {
        with_suffix(&self.path, LOG_SUFFIX)
    }

    pub fn xid_path(&self) -> PathBuf {
        with_suffix(&self.path, XID_SUFFIX)
    }
}

/// Append `suffix` to the file name of `base` without replacing an extension.
pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Parse a memory quota such as `64MB`, `512KB` or `1GB`.
pub fn parse_mem(input: &str) -> DbResult<u64> {
    let input = input.trim();
    if input.len() < 3 {
        return Err(DbError::InvalidMem(input.to_string()));
    }

    let (number, unit) = input.split_at(input.len() - 2);
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "KB" => KB,
        "MB" => MB,
        "GB" => GB,
        _ => return Err(DbError::InvalidMem(input.to_string())),
    };
    let number: u64 = number
        .trim()
        .parse()
        .map_err(|_| DbError::InvalidMem(input.to_string()))?;

    number
        .checked_mul(multiplier)
        .ok_or_else(|| DbError::InvalidMem(input.to_string()))
}
