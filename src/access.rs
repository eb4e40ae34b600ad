//! Access layer.
//!
//! This module turns pages into addressable records and indexes them:
//!
//! - **DataItem**: A length-prefixed record inside a page, addressed by uid
//! - **PageIndex**: Free-space buckets used to pick a page for an insert
//! - **DataManager**: Inserts and reads data items, logging every change
//! - **BPlusTree**: An index from `u64` keys to uids, stored in data items
//!
//! The data manager is also where crash recovery is triggered, since it is
//! the component that owns page 1 and the log.

pub mod btree;
pub mod data_item;
pub mod data_manager;
pub mod page_index;

pub use btree::BPlusTree;
pub use data_item::{DataItem, DataItemWriter};
pub use data_manager::{DataItemHandle, DataManager};
pub use page_index::{PageIndex, PageInfo};
