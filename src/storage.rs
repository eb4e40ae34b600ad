//! Storage layer implementation for mintdb.
//!
//! This module provides durable paged storage and the write-ahead log:
//!
//! - **Page**: Fixed-size (8KB) blocks of data, the basic unit of I/O
//! - **PageManager**: Reads and writes pages of the database file under one file lock
//! - **PageCache**: Bounded cache of pinned pages, flushed when their last pin goes away
//! - **page_one / data_page**: The validity-marker page and the layout of every data page
//! - **WalManager**: Append-only, checksummed redo/undo log
//!
//! Page numbers are 1-based; page 1 is reserved for the validity marker.

pub mod buffer;
pub mod disk;
pub mod page;
pub mod wal;

pub use buffer::{PageCache, PageHandle};
pub use disk::{PageManager, PAGE_SIZE};
pub use page::{Page, PageId, PageSlice};
