pub mod access;
pub mod cache;
pub mod concurrency;
pub mod config;
pub mod database;
pub mod error;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use concurrency::IsolationLevel;
pub use config::DatabaseConfig;
pub use database::{Database, Transaction};
pub use error::{DbError, DbResult};
