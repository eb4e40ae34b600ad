use crate::error::{DbError, DbResult};
use crate::storage::page::PageId;
use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 8192;

/// Page-granular access to the database file.
///
/// Pages are numbered from 1; page `n` lives at byte `(n - 1) * PAGE_SIZE`.
pub struct PageManager {
    file: Mutex<File>,
}

impl PageManager {
    pub fn create(path: &Path) -> DbResult<Self> {
        if path.exists() {
            return Err(DbError::FileExists(path.to_path_buf()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        debug!("Created page file {:?}", path);
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn open(path: &Path) -> DbResult<Self> {
        if !path.exists() {
            return Err(DbError::FileNotFound(path.to_path_buf()));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn read_page(&self, page_id: PageId) -> DbResult<Box<[u8; PAGE_SIZE]>> {
        let offset = Self::page_offset(page_id)?;
        let mut file = self.file.lock();
        let file_size = file.metadata()?.len();

        if offset + PAGE_SIZE as u64 > file_size {
            return Err(DbError::corrupted(
                "page file",
                format!("page {} lies beyond the end of the file", page_id.0),
            ));
        }

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..])?;
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> DbResult<()> {
        let offset = Self::page_offset(page_id)?;
        let mut file = self.file.lock();

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;

        Ok(())
    }

    pub fn num_pages(&self) -> DbResult<u32> {
        let file_size = self.file.lock().metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    /// Resize the file to hold exactly `max_page` pages, zero-filling on growth.
    pub fn truncate(&self, max_page: PageId) -> DbResult<()> {
        let file = self.file.lock();
        file.set_len(max_page.0 as u64 * PAGE_SIZE as u64)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn sync(&self) -> DbResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn page_offset(page_id: PageId) -> DbResult<u64> {
        if page_id.0 == 0 {
            return Err(DbError::corrupted("page file", "page numbers start at 1"));
        }
        Ok((page_id.0 as u64 - 1) * PAGE_SIZE as u64)
    }
}
