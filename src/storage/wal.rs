//! Write-Ahead Logging (WAL) module.
//!
//! Every page mutation made on behalf of a transaction is described by a
//! [`WalRecord`] that reaches the log before the page reaches disk:
//! - Insert records carry the full bytes of a new data item
//! - Update records carry both the old and the new bytes of an item
//!
//! The log file is a 4-byte running checksum followed by
//! `[Size:4][Checksum:4][Data]` records. See [`WalManager`].

pub mod manager;
pub mod record;

pub use manager::WalManager;
pub use record::{InsertRecord, UpdateRecord, WalRecord};
