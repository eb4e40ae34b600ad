//! Data items: length-prefixed records stored in data pages.
//!
//! ```text
//! [Valid:1][Size:2][Data:Size]
//! ```
//!
//! An item is addressed by its uid, `(page number << 32) | offset`. A valid
//! byte of 1 marks a live item; anything else reads as absent.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::Arc;

use crate::error::{DbError, DbResult};
use crate::storage::buffer::PageHandle;
use crate::storage::page::{PageId, PageSlice};
use crate::storage::wal::{WalManager, WalRecord};
use crate::transaction::TransactionId;

const OF_VALID: usize = 0;
const OF_SIZE: usize = 1;
const OF_DATA: usize = 3;

const VALID: u8 = 1;
const INVALID: u8 = 0;

/// Bytes of item header in front of the payload.
pub const ITEM_HEADER_SIZE: usize = OF_DATA;

pub fn address_to_uid(page_id: PageId, offset: u16) -> u64 {
    ((page_id.0 as u64) << 32) | offset as u64
}

pub fn uid_to_address(uid: u64) -> (PageId, u16) {
    (PageId((uid >> 32) as u32), (uid & 0xffff) as u16)
}

/// Frame `data` as a valid item.
pub fn wrap_data_item_raw(data: &[u8]) -> Vec<u8> {
    let mut raw = BytesMut::with_capacity(OF_DATA + data.len());
    raw.put_u8(VALID);
    raw.put_u16(data.len() as u16);
    raw.put_slice(data);
    raw.to_vec()
}

pub fn set_raw_invalid(raw: &mut [u8]) {
    raw[OF_VALID] = INVALID;
}

/// A data item loaded from a pinned page.
pub struct DataItem {
    uid: u64,
    raw: PageSlice,
    lock: RwLock<()>,
    wal: Arc<WalManager>,
}

impl DataItem {
    /// Read the item header at `offset` and bind the item to its page.
    pub(crate) fn parse(page: PageHandle, offset: u16, wal: Arc<WalManager>) -> DbResult<Self> {
        let uid = address_to_uid(page.page_id(), offset);
        let start = offset as usize;
        let size = page.read(|data| {
            data.get(start + OF_SIZE..start + OF_DATA)
                .map(|bytes| BigEndian::read_u16(bytes) as usize)
        });
        let size = size.ok_or(DbError::NullEntry(uid))?;

        let raw = PageSlice::new(page, start, start + OF_DATA + size)?;
        Ok(Self {
            uid,
            raw,
            lock: RwLock::new(()),
            wal,
        })
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn page_id(&self) -> PageId {
        self.raw.page().page_id()
    }

    pub fn offset(&self) -> u16 {
        self.raw.start() as u16
    }

    pub fn is_valid(&self) -> bool {
        let _guard = self.lock.read();
        self.raw.read(|raw| raw[OF_VALID] == VALID)
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.raw.len() - OF_DATA
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the payload.
    pub fn data(&self) -> Vec<u8> {
        self.with_data(|data| data.to_vec())
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let _guard = self.lock.read();
        self.raw.read(|raw| f(&raw[OF_DATA..]))
    }

    /// Start modifying the item in place.
    ///
    /// The returned writer holds the item's write lock. Finish with
    /// [`DataItemWriter::after`] to log the change; dropping the writer
    /// without it restores the previous bytes.
    pub fn before(&self) -> DataItemWriter<'_> {
        let guard = self.lock.write();
        let old_raw = self.raw.to_vec();
        DataItemWriter {
            item: self,
            _guard: guard,
            old_raw,
            finished: false,
        }
    }
}

/// Exclusive, undoable access to a data item.
pub struct DataItemWriter<'a> {
    item: &'a DataItem,
    _guard: RwLockWriteGuard<'a, ()>,
    old_raw: Vec<u8>,
    finished: bool,
}

impl DataItemWriter<'_> {
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.item.raw.read(|raw| f(&raw[OF_DATA..]))
    }

    pub fn with_data_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.item.raw.write(|raw| f(&mut raw[OF_DATA..]))
    }

    /// Overwrite payload bytes at `offset`.
    pub fn write_data(&mut self, offset: usize, bytes: &[u8]) -> DbResult<()> {
        self.item.raw.write_at(OF_DATA + offset, bytes)
    }

    /// Log the change on behalf of `xid` and keep it.
    pub fn after(mut self, xid: TransactionId) -> DbResult<()> {
        let new_raw = self.item.raw.to_vec();
        log_update(&self.item.wal, xid, self.item, &self.old_raw, &new_raw)?;
        self.finished = true;
        Ok(())
    }

    /// Discard the change.
    pub fn un_before(self) {}
}

impl Drop for DataItemWriter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let old_raw = &self.old_raw;
            self.item.raw.write(|raw| raw.copy_from_slice(old_raw));
        }
    }
}

/// Append an update record for `item` to the log.
pub(crate) fn log_update(
    wal: &WalManager,
    xid: TransactionId,
    item: &DataItem,
    old_raw: &[u8],
    new_raw: &[u8],
) -> DbResult<()> {
    let record = WalRecord::update(
        xid,
        item.page_id(),
        item.offset(),
        old_raw.to_vec(),
        new_raw.to_vec(),
    );
    wal.write_record(&record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::data_page;
    use crate::storage::{PageCache, PAGE_SIZE};
    use tempfile::{tempdir, TempDir};

    fn setup() -> DbResult<(TempDir, PageCache, Arc<WalManager>)> {
        let dir = tempdir()?;
        let pages = PageCache::create(&dir.path().join("d.db"), 10 * PAGE_SIZE as u64)?;
        let wal = Arc::new(WalManager::create(&dir.path().join("d.log"))?);
        Ok((dir, pages, wal))
    }

    #[test]
    fn test_uid_address() {
        let uid = address_to_uid(PageId(3), 17);
        assert_eq!(uid, (3 << 32) | 17);
        assert_eq!(uid_to_address(uid), (PageId(3), 17));
    }

    #[test]
    fn test_wrap_and_invalidate() {
        let mut raw = wrap_data_item_raw(b"abc");
        assert_eq!(raw, vec![VALID, 0, 3, b'a', b'b', b'c']);
        set_raw_invalid(&mut raw);
        assert_eq!(raw[0], INVALID);
    }

    #[test]
    fn test_parse_item() -> anyhow::Result<()> {
        let (_dir, pages, wal) = setup()?;
        let page_id = pages.new_page(&data_page::init_raw())?;
        let page = pages.get_page(page_id)?;
        data_page::insert(&page, &wrap_data_item_raw(b"skip"))?;
        let offset = data_page::insert(&page, &wrap_data_item_raw(b"hello"))?;

        let item = DataItem::parse(page, offset, wal)?;
        assert_eq!(item.uid(), address_to_uid(page_id, offset));
        assert!(item.is_valid());
        assert_eq!(item.data(), b"hello");
        assert_eq!(item.len(), 5);
        Ok(())
    }

    #[test]
    fn test_before_after_logs_update() -> anyhow::Result<()> {
        let (_dir, pages, wal) = setup()?;
        let page_id = pages.new_page(&data_page::init_raw())?;
        let page = pages.get_page(page_id)?;
        let offset = data_page::insert(&page, &wrap_data_item_raw(b"hello"))?;
        let item = DataItem::parse(page, offset, Arc::clone(&wal))?;

        let mut writer = item.before();
        writer.write_data(0, b"J")?;
        assert!(writer.write_data(5, b"!").is_err());
        writer.after(TransactionId::new(9))?;
        assert_eq!(item.data(), b"Jello");

        wal.rewind();
        let record = wal.next_record()?;
        assert_eq!(
            record,
            Some(WalRecord::update(
                TransactionId::new(9),
                page_id,
                offset,
                wrap_data_item_raw(b"hello"),
                wrap_data_item_raw(b"Jello"),
            ))
        );
        Ok(())
    }

    #[test]
    fn test_dropped_writer_restores_bytes() -> anyhow::Result<()> {
        let (_dir, pages, wal) = setup()?;
        let page_id = pages.new_page(&data_page::init_raw())?;
        let page = pages.get_page(page_id)?;
        let offset = data_page::insert(&page, &wrap_data_item_raw(b"hello"))?;
        let item = DataItem::parse(page, offset, Arc::clone(&wal))?;

        let mut writer = item.before();
        writer.with_data_mut(|data| data.copy_from_slice(b"HELLO"));
        assert_eq!(writer.with_data(|data| data.to_vec()), b"HELLO");
        writer.un_before();

        assert_eq!(item.data(), b"hello");
        wal.rewind();
        assert_eq!(wal.next()?, None);
        Ok(())
    }
}
