//! Row versions.
//!
//! Each row version is one data item laid out as
//!
//! ```text
//! [XMIN:8][XMAX:8][Data]
//! ```
//!
//! `xmin` is the transaction that created the version and `xmax` the one
//! that deleted it, 0 while nobody has.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

use crate::access::data_manager::{DataItemHandle, DataManager};
use crate::error::DbResult;
use crate::transaction::TransactionId;

const OF_XMIN: usize = 0;
const OF_XMAX: usize = OF_XMIN + 8;
const OF_DATA: usize = OF_XMAX + 8;

/// Bytes of version header in front of the row data.
pub const ENTRY_HEADER_SIZE: usize = OF_DATA;

/// Frame `data` as a version created by `xid`.
pub fn wrap_entry_raw(xid: TransactionId, data: &[u8]) -> Vec<u8> {
    let mut raw = BytesMut::with_capacity(OF_DATA + data.len());
    raw.put_u64(xid.value());
    raw.put_u64(0);
    raw.put_slice(data);
    raw.to_vec()
}

/// A row version backed by a pinned data item.
pub struct Entry {
    uid: u64,
    item: DataItemHandle,
}

impl Entry {
    /// Load the version stored at `uid`, or `None` if the item is invalid.
    pub fn load(dm: &DataManager, uid: u64) -> DbResult<Option<Self>> {
        Ok(dm.read(uid)?.map(|item| Entry { uid, item }))
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Row data without the version header.
    pub fn data(&self) -> Vec<u8> {
        self.item.with_data(|raw| raw.get(OF_DATA..).unwrap_or_default().to_vec())
    }

    pub fn xmin(&self) -> TransactionId {
        self.read_xid(OF_XMIN)
    }

    pub fn xmax(&self) -> TransactionId {
        self.read_xid(OF_XMAX)
    }

    fn read_xid(&self, offset: usize) -> TransactionId {
        self.item.with_data(|raw| {
            raw.get(offset..offset + 8)
                .map_or(0, BigEndian::read_u64)
                .into()
        })
    }

    /// Record `xid` as the deleter, logging the change under `xid`.
    pub fn set_xmax(&self, xid: TransactionId) -> DbResult<()> {
        let mut writer = self.item.before();
        writer.write_data(OF_XMAX, &xid.value().to_be_bytes())?;
        writer.after(xid)
    }
}
