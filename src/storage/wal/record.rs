//! WAL record types.

use serde::{Deserialize, Serialize};

use crate::storage::PageId;
use crate::transaction::TransactionId;

/// A data item was appended to a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertRecord {
    pub xid: TransactionId,
    pub page_id: PageId,
    /// Offset of the item inside the page.
    pub offset: u16,
    /// Full item bytes, header included.
    pub raw: Vec<u8>,
}

/// A data item was overwritten in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub xid: TransactionId,
    pub page_id: PageId,
    pub offset: u16,
    pub old_raw: Vec<u8>,
    pub new_raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    Insert(InsertRecord),
    Update(UpdateRecord),
}

impl WalRecord {
    pub fn insert(xid: TransactionId, page_id: PageId, offset: u16, raw: Vec<u8>) -> Self {
        WalRecord::Insert(InsertRecord {
            xid,
            page_id,
            offset,
            raw,
        })
    }

    pub fn update(
        xid: TransactionId,
        page_id: PageId,
        offset: u16,
        old_raw: Vec<u8>,
        new_raw: Vec<u8>,
    ) -> Self {
        WalRecord::Update(UpdateRecord {
            xid,
            page_id,
            offset,
            old_raw,
            new_raw,
        })
    }

    pub fn xid(&self) -> TransactionId {
        match self {
            WalRecord::Insert(r) => r.xid,
            WalRecord::Update(r) => r.xid,
        }
    }

    pub fn page_id(&self) -> PageId {
        match self {
            WalRecord::Insert(r) => r.page_id,
            WalRecord::Update(r) => r.page_id,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
