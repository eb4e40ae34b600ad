use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::data_item::{uid_to_address, wrap_data_item_raw, address_to_uid, DataItem};
use super::page_index::PageIndex;
use crate::cache::{CacheBackend, CacheHandle, ResourceCache};
use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::recovery;
use crate::storage::buffer::PageHandle;
use crate::storage::page::data_page::{self, MAX_FREE_SPACE};
use crate::storage::page::page_one;
use crate::storage::wal::{WalManager, WalRecord};
use crate::storage::{PageCache, PageId};
use crate::transaction::{TransactionId, TransactionManager};

/// A pinned data item.
pub type DataItemHandle = CacheHandle<DataItem>;

struct DataItemLoader {
    pages: Arc<PageCache>,
    wal: Arc<WalManager>,
}

impl CacheBackend<DataItem> for DataItemLoader {
    fn load(&self, uid: u64) -> DbResult<DataItem> {
        let (page_id, offset) = uid_to_address(uid);
        if page_id.0 < 2 || page_id.0 > self.pages.page_count() {
            return Err(DbError::NullEntry(uid));
        }
        let page = self.pages.get_page(page_id)?;
        DataItem::parse(page, offset, Arc::clone(&self.wal))
    }

    fn evict(&self, _uid: u64, _item: &DataItem) -> DbResult<()> {
        // Dropping the item unpins its page.
        Ok(())
    }
}

/// Stores and retrieves data items on top of the page cache and the log.
pub struct DataManager {
    items: ResourceCache<DataItem>,
    pages: Arc<PageCache>,
    wal: Arc<WalManager>,
    page_index: PageIndex,
    page_one: Mutex<Option<PageHandle>>,
    insert_retries: usize,
}

impl DataManager {
    /// Create the page file and the log for a new database.
    pub fn create(config: &DatabaseConfig) -> DbResult<Self> {
        let pages = Arc::new(PageCache::create(&config.db_path(), config.mem)?);
        let wal = Arc::new(WalManager::create(&config.log_path())?);

        let page_one_id = pages.new_page(&page_one::init_raw())?;
        let page_one = pages.get_page(page_one_id)?;
        pages.flush_page(&page_one)?;

        info!("Created data files at {:?}", config.path);
        Ok(Self::new(config, pages, wal, page_one))
    }

    /// Open an existing database, recovering it first if the previous session
    /// did not shut down cleanly.
    pub fn open(config: &DatabaseConfig, tm: &TransactionManager) -> DbResult<Self> {
        let pages = Arc::new(PageCache::open(&config.db_path(), config.mem)?);
        let wal = Arc::new(WalManager::open(&config.log_path())?);
        if pages.page_count() == 0 {
            return Err(DbError::corrupted("page file", "page 1 is missing"));
        }

        let page_one = pages.get_page(PageId(1))?;
        if !page_one::check_vc(&page_one) {
            warn!("Database was not closed cleanly, running recovery");
            recovery::recover(tm, &wal, &pages)?;
        }

        let dm = Self::new(config, Arc::clone(&pages), wal, page_one);
        dm.fill_page_index()?;

        if let Some(page_one) = dm.page_one.lock().as_ref() {
            page_one::set_vc_open(page_one);
            pages.flush_page(page_one)?;
        }

        info!(
            "Opened data files at {:?} with {} pages",
            config.path,
            pages.page_count()
        );
        Ok(dm)
    }

    fn new(
        config: &DatabaseConfig,
        pages: Arc<PageCache>,
        wal: Arc<WalManager>,
        page_one: PageHandle,
    ) -> Self {
        let loader = DataItemLoader {
            pages: Arc::clone(&pages),
            wal: Arc::clone(&wal),
        };
        Self {
            items: ResourceCache::new(0, Box::new(loader)),
            pages,
            wal,
            page_index: PageIndex::new(),
            page_one: Mutex::new(Some(page_one)),
            insert_retries: config.insert_retries,
        }
    }

    fn fill_page_index(&self) -> DbResult<()> {
        for number in 2..=self.pages.page_count() {
            let page = self.pages.get_page(PageId(number))?;
            self.page_index
                .add(page.page_id(), data_page::free_space(&page));
            page.release()?;
        }
        Ok(())
    }

    /// Look up a data item. Items whose valid flag is unset read as `None`.
    pub fn read(&self, uid: u64) -> DbResult<Option<DataItemHandle>> {
        let item = self.items.get(uid)?;
        if !item.is_valid() {
            item.release()?;
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// Store `data` as a new item on behalf of `xid` and return its uid.
    pub fn insert(&self, xid: TransactionId, data: &[u8]) -> DbResult<u64> {
        let raw = wrap_data_item_raw(data);
        if raw.len() > MAX_FREE_SPACE {
            return Err(DbError::DataTooLarge {
                size: raw.len(),
                max: MAX_FREE_SPACE,
            });
        }

        let mut selected = None;
        for _ in 0..self.insert_retries {
            if let Some(info) = self.page_index.select(raw.len()) {
                selected = Some(info);
                break;
            }
            let page_id = self.pages.new_page(&data_page::init_raw())?;
            debug!("Allocated data page {}", page_id.0);
            self.page_index.add(page_id, MAX_FREE_SPACE);
        }
        let info = selected.ok_or(DbError::DatabaseBusy {
            attempts: self.insert_retries,
        })?;

        let page = match self.pages.get_page(info.page_id) {
            Ok(page) => page,
            Err(e) => {
                self.page_index.add(info.page_id, info.free_space);
                return Err(e);
            }
        };

        let result = self.insert_into(xid, &page, &raw);
        self.page_index
            .add(info.page_id, data_page::free_space(&page));
        result
    }

    fn insert_into(&self, xid: TransactionId, page: &PageHandle, raw: &[u8]) -> DbResult<u64> {
        let offset = data_page::free_space_offset(page);
        self.wal
            .write_record(&WalRecord::insert(xid, page.page_id(), offset, raw.to_vec()))?;
        let offset = data_page::insert(page, raw)?;
        Ok(address_to_uid(page.page_id(), offset))
    }

    /// Number of pages in the page file, page 1 included.
    pub fn page_count(&self) -> u32 {
        self.pages.page_count()
    }

    /// Flush everything and mark the shutdown as clean.
    pub fn close(&self) -> DbResult<()> {
        self.items.close()?;
        self.wal.close()?;

        if let Some(page_one) = self.page_one.lock().take() {
            page_one::set_vc_close(&page_one);
            self.pages.flush_page(&page_one)?;
            page_one.release()?;
        }
        self.pages.close()
    }
}
