//! Transaction ledger.
//!
//! This module records the durable fate of every transaction:
//! - Transaction identifiers and the reserved super transaction
//! - The on-disk status byte of each transaction (active, committed, aborted)
//! - The ledger file that the version manager and recovery consult

pub mod id;
pub mod manager;
pub mod state;

pub use id::{TransactionId, SUPER_XID};
pub use manager::TransactionManager;
pub use state::TransactionState;
