use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};

use crate::access::{BPlusTree, DataManager};
use crate::concurrency::{IsolationLevel, VersionManager};
use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::storage::PageCache;
use crate::transaction::{TransactionId, TransactionManager};

/// High-level database interface that ties the kernel layers together.
pub struct Database {
    config: DatabaseConfig,
    tm: Arc<TransactionManager>,
    dm: Arc<DataManager>,
    vm: VersionManager,
    closed: AtomicBool,
}

impl Database {
    /// Create a new database. Fails if any of its files already exists.
    pub fn create(config: DatabaseConfig) -> DbResult<Self> {
        PageCache::check_mem(config.mem)?;
        for path in [config.db_path(), config.log_path(), config.xid_path()] {
            if path.exists() {
                return Err(DbError::FileExists(path));
            }
        }

        let tm = Arc::new(TransactionManager::create(&config.xid_path())?);
        let dm = Arc::new(DataManager::create(&config)?);
        info!("Created database at {:?}", config.path);
        Ok(Self::assemble(config, tm, dm))
    }

    /// Open an existing database, recovering it if it was not closed cleanly.
    pub fn open(config: DatabaseConfig) -> DbResult<Self> {
        for path in [config.db_path(), config.log_path(), config.xid_path()] {
            if !path.exists() {
                return Err(DbError::FileNotFound(path));
            }
        }

        let tm = Arc::new(TransactionManager::open(&config.xid_path())?);
        let dm = Arc::new(DataManager::open(&config, &tm)?);
        tm.abort_dangling()?;
        info!("Opened database at {:?}", config.path);
        Ok(Self::assemble(config, tm, dm))
    }

    fn assemble(config: DatabaseConfig, tm: Arc<TransactionManager>, dm: Arc<DataManager>) -> Self {
        let vm = VersionManager::new(Arc::clone(&tm), Arc::clone(&dm));
        Self {
            config,
            tm,
            dm,
            vm,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn data_manager(&self) -> &Arc<DataManager> {
        &self.dm
    }

    pub fn version_manager(&self) -> &VersionManager {
        &self.vm
    }

    pub fn begin(&self, level: IsolationLevel) -> DbResult<TransactionId> {
        self.vm.begin(level)
    }

    pub fn commit(&self, xid: TransactionId) -> DbResult<()> {
        self.vm.commit(xid)
    }

    pub fn abort(&self, xid: TransactionId) -> DbResult<()> {
        self.vm.abort(xid)
    }

    pub fn insert(&self, xid: TransactionId, data: &[u8]) -> DbResult<u64> {
        self.vm.insert(xid, data)
    }

    pub fn read(&self, xid: TransactionId, uid: u64) -> DbResult<Option<Vec<u8>>> {
        self.vm.read(xid, uid)
    }

    pub fn delete(&self, xid: TransactionId, uid: u64) -> DbResult<bool> {
        self.vm.delete(xid, uid)
    }

    /// Begin a transaction that aborts itself unless committed.
    pub fn transaction(&self, level: IsolationLevel) -> DbResult<Transaction<'_>> {
        Ok(Transaction {
            db: self,
            xid: self.begin(level)?,
            finished: false,
        })
    }

    /// Create an empty B+Tree and return its boot uid.
    pub fn create_index(&self) -> DbResult<u64> {
        BPlusTree::create(&self.dm)
    }

    pub fn open_index(&self, boot_uid: u64) -> DbResult<BPlusTree> {
        BPlusTree::load(boot_uid, Arc::clone(&self.dm))
    }

    /// Abort running transactions, flush everything and mark the shutdown
    /// clean. Later calls do nothing.
    pub fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.vm.close()?;
        self.dm.close()?;
        self.tm.close()?;
        info!("Closed database at {:?}", self.config.path);
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close database at {:?}: {}", self.config.path, e);
        }
    }
}

/// A transaction bound to a [`Database`].
///
/// Dropping it without [`commit`](Transaction::commit) aborts it.
pub struct Transaction<'a> {
    db: &'a Database,
    xid: TransactionId,
    finished: bool,
}

impl Transaction<'_> {
    pub fn xid(&self) -> TransactionId {
        self.xid
    }

    pub fn insert(&self, data: &[u8]) -> DbResult<u64> {
        self.db.insert(self.xid, data)
    }

    pub fn read(&self, uid: u64) -> DbResult<Option<Vec<u8>>> {
        self.db.read(self.xid, uid)
    }

    pub fn delete(&self, uid: u64) -> DbResult<bool> {
        self.db.delete(self.xid, uid)
    }

    pub fn commit(mut self) -> DbResult<()> {
        self.finished = true;
        self.db.commit(self.xid)
    }

    pub fn abort(mut self) -> DbResult<()> {
        self.finished = true;
        self.db.abort(self.xid)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.db.abort(self.xid) {
            error!("Failed to abort {}: {}", self.xid, e);
        }
    }
}
