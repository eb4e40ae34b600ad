//! Crash recovery.
//!
//! Runs at open time when page 1 shows the previous session did not close
//! cleanly. The log is replayed against the page file:
//! - Analysis finds the highest page the log mentions and every transaction
//!   that never committed
//! - Redo repeats every logged change in log order
//! - Undo walks the log backwards and rolls back changes of transactions
//!   that never committed, as long as their after-image is still in place
//!
//! Transactions that were active at the crash end up aborted.

pub mod replay;

pub use replay::{recover, Recovery, RecoveryStats};
