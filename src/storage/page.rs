pub mod data_page;
pub mod page_one;

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};
use crate::storage::buffer::PageHandle;
use crate::storage::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

/// A cached page: its number, its bytes and a dirty flag.
///
/// The bytes are only reachable through [`Page::read`] and [`Page::write`],
/// so every mutation marks the page dirty.
pub struct Page {
    page_id: PageId,
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
    dirty: AtomicBool,
}

impl Page {
    pub fn new(page_id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Self {
        Self {
            page_id,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> R {
        f(&self.data.read())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let mut data = self.data.write();
        self.dirty.store(true, Ordering::SeqCst);
        f(&mut data)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    /// Copy of the current bytes.
    pub fn snapshot(&self) -> Box<[u8; PAGE_SIZE]> {
        self.data.read().clone()
    }
}

/// A bounded window `[start, end)` into a pinned page.
///
/// The slice keeps its page pinned for as long as it lives, and every access
/// through it is checked against its bounds.
pub struct PageSlice {
    page: PageHandle,
    start: usize,
    end: usize,
}

impl PageSlice {
    pub fn new(page: PageHandle, start: usize, end: usize) -> DbResult<Self> {
        if start > end || end > PAGE_SIZE {
            return Err(DbError::OutOfBounds {
                start,
                end,
                limit: PAGE_SIZE,
            });
        }
        Ok(Self { page, start, end })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.page.read(|data| f(&data[self.start..self.end]))
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.page.write(|data| f(&mut data[self.start..self.end]))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.read(|bytes| bytes.to_vec())
    }

    /// Overwrite `bytes.len()` bytes at `offset`, relative to the slice start.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> DbResult<()> {
        let end = self.check(offset, bytes.len())?;
        self.write(|data| data[offset..end].copy_from_slice(bytes));
        Ok(())
    }

    pub fn read_at(&self, offset: usize, len: usize) -> DbResult<Vec<u8>> {
        let end = self.check(offset, len)?;
        Ok(self.read(|data| data[offset..end].to_vec()))
    }

    fn check(&self, offset: usize, len: usize) -> DbResult<usize> {
        let end = offset.checked_add(len).filter(|&end| end <= self.len());
        end.ok_or(DbError::OutOfBounds {
            start: offset,
            end: offset.saturating_add(len),
            limit: self.len(),
        })
    }
}
