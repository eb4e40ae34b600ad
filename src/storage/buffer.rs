use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::cache::{CacheBackend, CacheHandle, ResourceCache};
use crate::error::{DbError, DbResult};
use crate::storage::page::{Page, PageId};
use crate::storage::{PageManager, PAGE_SIZE};

/// A pinned page. Dropping the handle unpins it; the last unpin writes a
/// dirty page back to disk.
pub type PageHandle = CacheHandle<Page>;

/// The smallest number of pages a page cache may hold.
pub const MEM_MIN_LIM: usize = 10;

struct PageLoader {
    page_manager: Arc<PageManager>,
}

impl CacheBackend<Page> for PageLoader {
    fn load(&self, key: u64) -> DbResult<Page> {
        let page_id = PageId(key as u32);
        let data = self.page_manager.read_page(page_id)?;
        Ok(Page::new(page_id, data))
    }

    fn evict(&self, _key: u64, page: &Page) -> DbResult<()> {
        if page.is_dirty() {
            self.page_manager.write_page(page.page_id(), &page.snapshot())?;
            page.set_dirty(false);
        }
        Ok(())
    }
}

/// Bounded cache of database pages over a [`PageManager`].
pub struct PageCache {
    pages: ResourceCache<Page>,
    page_manager: Arc<PageManager>,
    page_count: AtomicU32,
}

impl PageCache {
    /// Create an empty page file. `mem` is the memory quota in bytes.
    pub fn create(path: &Path, mem: u64) -> DbResult<Self> {
        Self::check_mem(mem)?;
        Self::new(PageManager::create(path)?, mem)
    }

    pub fn open(path: &Path, mem: u64) -> DbResult<Self> {
        Self::check_mem(mem)?;
        Self::new(PageManager::open(path)?, mem)
    }

    /// Page capacity for a memory quota, or `MemTooSmall` below the minimum.
    pub fn check_mem(mem: u64) -> DbResult<usize> {
        let capacity = (mem / PAGE_SIZE as u64) as usize;
        if capacity < MEM_MIN_LIM {
            return Err(DbError::MemTooSmall(mem));
        }
        Ok(capacity)
    }

    fn new(page_manager: PageManager, mem: u64) -> DbResult<Self> {
        let capacity = Self::check_mem(mem)?;
        let page_manager = Arc::new(page_manager);
        let page_count = page_manager.num_pages()?;
        debug!(
            "Page cache over {} pages with room for {}",
            page_count, capacity
        );

        let loader = PageLoader {
            page_manager: Arc::clone(&page_manager),
        };
        Ok(Self {
            pages: ResourceCache::new(capacity, Box::new(loader)),
            page_manager,
            page_count: AtomicU32::new(page_count),
        })
    }

    /// Append a page initialised with `init` and write it through to disk.
    pub fn new_page(&self, init: &[u8; PAGE_SIZE]) -> DbResult<PageId> {
        let page_id = PageId(self.page_count.fetch_add(1, Ordering::SeqCst) + 1);
        self.page_manager.write_page(page_id, init)?;
        Ok(page_id)
    }

    pub fn get_page(&self, page_id: PageId) -> DbResult<PageHandle> {
        self.pages.get(page_id.0 as u64)
    }

    /// Write a page to disk now, whether or not it is still pinned.
    pub fn flush_page(&self, page: &Page) -> DbResult<()> {
        self.page_manager
            .write_page(page.page_id(), &page.snapshot())?;
        page.set_dirty(false);
        Ok(())
    }

    /// Shrink (or zero-extend) the file to exactly `max_page` pages.
    pub fn truncate_by_page_id(&self, max_page: PageId) -> DbResult<()> {
        self.page_manager.truncate(max_page)?;
        self.page_count.store(max_page.0, Ordering::SeqCst);
        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::SeqCst)
    }

    /// Flush every cached page and sync the file.
    pub fn close(&self) -> DbResult<()> {
        self.pages.close()?;
        self.page_manager.sync()?;
        info!("Closed page cache with {} pages", self.page_count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MEM: u64 = (MEM_MIN_LIM * PAGE_SIZE) as u64;

    fn page_filled(byte: u8) -> [u8; PAGE_SIZE] {
        [byte; PAGE_SIZE]
    }

    #[test]
    fn test_mem_too_small() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let result = PageCache::create(&dir.path().join("t.db"), MEM - 1);
        assert!(matches!(result, Err(DbError::MemTooSmall(_))));
        Ok(())
    }

    #[test]
    fn test_new_page_and_fetch() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let cache = PageCache::create(&dir.path().join("t.db"), MEM)?;

        let first = cache.new_page(&page_filled(1))?;
        let second = cache.new_page(&page_filled(2))?;
        assert_eq!(first, PageId(1));
        assert_eq!(second, PageId(2));
        assert_eq!(cache.page_count(), 2);

        let page = cache.get_page(second)?;
        assert_eq!(page.page_id(), second);
        page.read(|data| assert!(data.iter().all(|&b| b == 2)));

        Ok(())
    }

    #[test]
    fn test_dirty_page_written_on_release() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.db");
        let cache = PageCache::create(&path, MEM)?;
        let page_id = cache.new_page(&page_filled(0))?;

        let page = cache.get_page(page_id)?;
        page.write(|data| data[10] = 42);
        page.release()?;

        let reopened = PageManager::open(&path)?;
        assert_eq!(reopened.read_page(page_id)?[10], 42);

        Ok(())
    }

    #[test]
    fn test_pinned_pages_fill_the_cache() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let cache = PageCache::create(&dir.path().join("t.db"), MEM)?;
        for _ in 0..=MEM_MIN_LIM {
            cache.new_page(&page_filled(0))?;
        }

        let pinned: Vec<_> = (1..=MEM_MIN_LIM as u32)
            .map(|n| cache.get_page(PageId(n)))
            .collect::<DbResult<_>>()?;
        let overflow = PageId(MEM_MIN_LIM as u32 + 1);
        assert!(matches!(
            cache.get_page(overflow),
            Err(DbError::CacheFull { .. })
        ));

        drop(pinned);
        assert!(cache.get_page(overflow).is_ok());
        Ok(())
    }

    #[test]
    fn test_truncate_and_reopen() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.db");
        {
            let cache = PageCache::create(&path, MEM)?;
            for i in 0..5 {
                cache.new_page(&page_filled(i))?;
            }
            cache.truncate_by_page_id(PageId(3))?;
            assert_eq!(cache.page_count(), 3);
            assert_eq!(cache.new_page(&page_filled(9))?, PageId(4));

            let page = cache.get_page(PageId(2))?;
            page.write(|data| data[0] = 77);
            drop(page);
            cache.close()?;
        }

        let cache = PageCache::open(&path, MEM)?;
        assert_eq!(cache.page_count(), 4);
        cache.get_page(PageId(2))?.read(|data| assert_eq!(data[0], 77));
        cache.get_page(PageId(4))?.read(|data| assert_eq!(data[0], 9));
        Ok(())
    }

    #[test]
    fn test_flush_pinned_page() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.db");
        let cache = PageCache::create(&path, MEM)?;
        let page_id = cache.new_page(&page_filled(0))?;

        let page = cache.get_page(page_id)?;
        page.write(|data| data[1] = 5);
        cache.flush_page(&page)?;
        assert!(!page.is_dirty());

        let reader = PageManager::open(&path)?;
        assert_eq!(reader.read_page(page_id)?[1], 5);
        Ok(())
    }
}
