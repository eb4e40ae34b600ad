//! Concurrency control.
//!
//! Rows are stored as versions stamped with the transactions that created and
//! deleted them. The version manager decides which versions a transaction
//! sees and serializes conflicting deletes through the lock table.

pub mod lock;
pub mod mvcc;
pub mod version;
pub mod visibility;

pub use lock::LockTable;
pub use mvcc::{IsolationLevel, TransactionInfo, VersionManager};
pub use version::Entry;
