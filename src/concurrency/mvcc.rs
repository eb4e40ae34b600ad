//! Multi-version concurrency control.
//!
//! The [`VersionManager`] keeps the set of running transactions, hands out
//! row versions through a [`ResourceCache`] and applies the visibility rules
//! on every read and delete. Deletes take a per-uid lock from the
//! [`LockTable`] that is held until the deleting transaction ends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::lock::LockTable;
use super::version::{wrap_entry_raw, Entry};
use super::visibility;
use crate::access::DataManager;
use crate::cache::{CacheBackend, ResourceCache};
use crate::error::{DbError, DbResult};
use crate::transaction::{TransactionId, TransactionManager, SUPER_XID};

/// Isolation levels supported by the version manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Each read sees every version committed so far.
    #[default]
    ReadCommitted,
    /// All reads see the versions committed before the transaction began.
    RepeatableRead,
}

impl IsolationLevel {
    /// Whether this isolation level reads from a snapshot.
    pub fn uses_snapshot(&self) -> bool {
        matches!(self, IsolationLevel::RepeatableRead)
    }
}

impl TryFrom<u8> for IsolationLevel {
    type Error = DbError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(IsolationLevel::ReadCommitted),
            1 => Ok(IsolationLevel::RepeatableRead),
            other => Err(DbError::corrupted(
                "isolation level",
                format!("unknown level {}", other),
            )),
        }
    }
}

/// A running transaction as seen by the version manager.
#[derive(Debug)]
pub struct TransactionInfo {
    pub xid: TransactionId,
    pub level: IsolationLevel,
    /// Transactions that were running when this one began.
    snapshot: HashSet<TransactionId>,
    /// Set once a conflict aborted the transaction. Every later operation
    /// fails with [`DbError::ConcurrentUpdate`].
    auto_aborted: AtomicBool,
}

impl TransactionInfo {
    pub fn new(xid: TransactionId, level: IsolationLevel, snapshot: HashSet<TransactionId>) -> Self {
        Self {
            xid,
            level,
            snapshot,
            auto_aborted: AtomicBool::new(false),
        }
    }

    pub fn in_snapshot(&self, xid: TransactionId) -> bool {
        !xid.is_super() && self.snapshot.contains(&xid)
    }

    pub fn is_auto_aborted(&self) -> bool {
        self.auto_aborted.load(Ordering::Acquire)
    }

    fn check(&self) -> DbResult<()> {
        if self.is_auto_aborted() {
            return Err(DbError::ConcurrentUpdate(self.xid.value()));
        }
        Ok(())
    }
}

struct EntryLoader {
    dm: Arc<DataManager>,
}

impl CacheBackend<Entry> for EntryLoader {
    fn load(&self, uid: u64) -> DbResult<Entry> {
        Entry::load(&self.dm, uid)?.ok_or(DbError::NullEntry(uid))
    }

    fn evict(&self, _uid: u64, _entry: &Entry) -> DbResult<()> {
        Ok(())
    }
}

/// Transactional row storage on top of the data manager.
pub struct VersionManager {
    tm: Arc<TransactionManager>,
    dm: Arc<DataManager>,
    entries: ResourceCache<Entry>,
    active: Mutex<HashMap<TransactionId, Arc<TransactionInfo>>>,
    lock_table: LockTable,
}

impl VersionManager {
    pub fn new(tm: Arc<TransactionManager>, dm: Arc<DataManager>) -> Self {
        let loader = EntryLoader {
            dm: Arc::clone(&dm),
        };
        let mut active = HashMap::new();
        active.insert(
            SUPER_XID,
            Arc::new(TransactionInfo::new(
                SUPER_XID,
                IsolationLevel::ReadCommitted,
                HashSet::new(),
            )),
        );

        Self {
            tm,
            dm,
            entries: ResourceCache::new(0, Box::new(loader)),
            active: Mutex::new(active),
            lock_table: LockTable::new(),
        }
    }

    /// Start a transaction at the given isolation level.
    pub fn begin(&self, level: IsolationLevel) -> DbResult<TransactionId> {
        let mut active = self.active.lock();
        let xid = self.tm.begin()?;
        let snapshot = if level.uses_snapshot() {
            active.keys().copied().filter(|x| !x.is_super()).collect()
        } else {
            HashSet::new()
        };
        active.insert(xid, Arc::new(TransactionInfo::new(xid, level, snapshot)));
        debug!("Began {} at {:?}", xid, level);
        Ok(xid)
    }

    fn transaction(&self, xid: TransactionId) -> DbResult<Arc<TransactionInfo>> {
        self.active
            .lock()
            .get(&xid)
            .cloned()
            .ok_or(DbError::TransactionNotFound(xid.value()))
    }

    /// Row data at `uid` if the version is visible to `xid`.
    pub fn read(&self, xid: TransactionId, uid: u64) -> DbResult<Option<Vec<u8>>> {
        let t = self.transaction(xid)?;
        t.check()?;

        let entry = match self.entries.get(uid) {
            Ok(entry) => entry,
            Err(DbError::NullEntry(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if visibility::is_visible(&self.tm, &t, &entry)? {
            Ok(Some(entry.data()))
        } else {
            Ok(None)
        }
    }

    /// Store `data` as a new version created by `xid`.
    pub fn insert(&self, xid: TransactionId, data: &[u8]) -> DbResult<u64> {
        let t = self.transaction(xid)?;
        t.check()?;
        self.dm.insert(xid, &wrap_entry_raw(xid, data))
    }

    /// Mark the version at `uid` deleted by `xid`.
    ///
    /// Returns `false` if the version is not visible to `xid` or `xid` already
    /// deleted it. Blocks while another running transaction holds the
    /// version. A lock cycle or a lost update aborts `xid` and fails with
    /// [`DbError::ConcurrentUpdate`].
    pub fn delete(&self, xid: TransactionId, uid: u64) -> DbResult<bool> {
        let t = self.transaction(xid)?;
        t.check()?;

        let entry = match self.entries.get(uid) {
            Ok(entry) => entry,
            Err(DbError::NullEntry(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !visibility::is_visible(&self.tm, &t, &entry)? {
            return Ok(false);
        }

        if let Err(e) = self.lock_table.acquire(xid, uid) {
            warn!("{} aborted on delete of {:#x}: {}", xid, uid, e);
            return Err(self.auto_abort(&t));
        }

        if entry.xmax() == xid {
            return Ok(false);
        }
        if visibility::is_version_skip(&self.tm, &t, &entry)? {
            warn!("{} aborted on delete of {:#x}: version skip", xid, uid);
            return Err(self.auto_abort(&t));
        }
        // The previous holder may have deleted it before releasing.
        if !visibility::is_visible(&self.tm, &t, &entry)? {
            return Ok(false);
        }

        entry.set_xmax(xid)?;
        Ok(true)
    }

    fn auto_abort(&self, t: &TransactionInfo) -> DbError {
        if let Err(e) = self.intern_abort(t.xid, true) {
            return e;
        }
        DbError::ConcurrentUpdate(t.xid.value())
    }

    pub fn commit(&self, xid: TransactionId) -> DbResult<()> {
        if xid.is_super() {
            return Ok(());
        }
        let t = self.transaction(xid)?;
        t.check()?;

        self.active.lock().remove(&xid);
        self.tm.commit(xid)?;
        self.lock_table.release_all(xid);
        debug!("Committed {}", xid);
        Ok(())
    }

    /// Abort `xid`. Aborting a transaction that a conflict already aborted
    /// only forgets it.
    pub fn abort(&self, xid: TransactionId) -> DbResult<()> {
        self.intern_abort(xid, false)
    }

    fn intern_abort(&self, xid: TransactionId, auto: bool) -> DbResult<()> {
        if xid.is_super() {
            return Ok(());
        }

        let t = {
            let mut active = self.active.lock();
            let t = active
                .get(&xid)
                .cloned()
                .ok_or(DbError::TransactionNotFound(xid.value()))?;
            // An auto-aborted transaction stays registered so later calls
            // report the conflict.
            if !auto {
                active.remove(&xid);
            }
            t
        };
        if t.is_auto_aborted() {
            return Ok(());
        }

        self.tm.abort(xid)?;
        self.lock_table.release_all(xid);
        if auto {
            t.auto_aborted.store(true, Ordering::Release);
        }
        debug!("Aborted {}", xid);
        Ok(())
    }

    /// Transactions currently registered, excluding the super transaction.
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut xids: Vec<_> = self
            .active
            .lock()
            .keys()
            .copied()
            .filter(|x| !x.is_super())
            .collect();
        xids.sort();
        xids
    }

    /// Abort every transaction still running and drop cached versions.
    pub fn close(&self) -> DbResult<()> {
        for xid in self.active_transactions() {
            warn!("{} still running at close, aborting it", xid);
            self.abort(xid)?;
        }
        self.entries.close()?;
        info!("Closed version manager");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::storage::PAGE_SIZE;
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const RC: IsolationLevel = IsolationLevel::ReadCommitted;
    const RR: IsolationLevel = IsolationLevel::RepeatableRead;

    fn setup() -> DbResult<(TempDir, Arc<TransactionManager>, Arc<VersionManager>)> {
        let dir = tempdir()?;
        let config = DatabaseConfig::new(dir.path().join("vm")).with_mem(32 * PAGE_SIZE as u64);
        let tm = Arc::new(TransactionManager::create(&config.xid_path())?);
        let dm = Arc::new(DataManager::create(&config)?);
        let vm = Arc::new(VersionManager::new(Arc::clone(&tm), dm));
        Ok((dir, tm, vm))
    }

    fn committed_row(vm: &VersionManager, data: &[u8]) -> DbResult<u64> {
        let xid = vm.begin(RC)?;
        let uid = vm.insert(xid, data)?;
        vm.commit(xid)?;
        Ok(uid)
    }

    fn wait_until_blocked(vm: &VersionManager, xid: TransactionId) {
        while !vm.lock_table.is_waiting(xid) {
            thread::yield_now();
        }
    }

    #[test]
    fn test_isolation_level_from_byte() {
        assert_eq!(IsolationLevel::try_from(0).unwrap(), RC);
        assert_eq!(IsolationLevel::try_from(1).unwrap(), RR);
        assert!(IsolationLevel::try_from(2).is_err());
    }

    #[test]
    fn test_read_own_and_committed_writes() -> anyhow::Result<()> {
        let (_dir, _tm, vm) = setup()?;
        let writer = vm.begin(RC)?;
        let reader = vm.begin(RC)?;

        let uid = vm.insert(writer, b"hello")?;
        assert_eq!(vm.read(writer, uid)?, Some(b"hello".to_vec()));
        assert_eq!(vm.read(reader, uid)?, None);

        vm.commit(writer)?;
        assert_eq!(vm.read(reader, uid)?, Some(b"hello".to_vec()));
        Ok(())
    }

    #[test]
    fn test_repeatable_read_ignores_later_commits() -> anyhow::Result<()> {
        let (_dir, _tm, vm) = setup()?;
        let old = committed_row(&vm, b"old")?;

        let writer = vm.begin(RC)?;
        let reader = vm.begin(RR)?;
        let fresh = vm.insert(writer, b"fresh")?;
        assert!(vm.delete(writer, old)?);
        vm.commit(writer)?;

        assert_eq!(vm.read(reader, fresh)?, None);
        assert_eq!(vm.read(reader, old)?, Some(b"old".to_vec()));

        let late = vm.begin(RR)?;
        assert_eq!(vm.read(late, fresh)?, Some(b"fresh".to_vec()));
        assert_eq!(vm.read(late, old)?, None);
        Ok(())
    }

    #[test]
    fn test_delete_lifecycle() -> anyhow::Result<()> {
        let (_dir, _tm, vm) = setup()?;
        let uid = committed_row(&vm, b"row")?;

        let xid = vm.begin(RC)?;
        assert!(vm.delete(xid, uid)?);
        assert_eq!(vm.read(xid, uid)?, None);
        assert!(!vm.delete(xid, uid)?);
        vm.commit(xid)?;

        let after = vm.begin(RC)?;
        assert_eq!(vm.read(after, uid)?, None);
        assert!(!vm.delete(after, uid)?);
        Ok(())
    }

    #[test]
    fn test_aborted_delete_keeps_row() -> anyhow::Result<()> {
        let (_dir, tm, vm) = setup()?;
        let uid = committed_row(&vm, b"row")?;

        let xid = vm.begin(RC)?;
        assert!(vm.delete(xid, uid)?);
        vm.abort(xid)?;
        assert!(tm.is_aborted(xid)?);

        let reader = vm.begin(RR)?;
        assert_eq!(vm.read(reader, uid)?, Some(b"row".to_vec()));
        assert!(vm.delete(reader, uid)?);
        Ok(())
    }

    #[test]
    fn test_unknown_uid_reads_as_missing() -> anyhow::Result<()> {
        let (_dir, _tm, vm) = setup()?;
        let xid = vm.begin(RC)?;
        assert_eq!(vm.read(xid, 9 << 32)?, None);
        assert!(!vm.delete(xid, 9 << 32)?);
        assert!(matches!(
            vm.read(TransactionId::new(99), 9 << 32),
            Err(DbError::TransactionNotFound(99))
        ));
        Ok(())
    }

    #[test]
    fn test_second_deleter_waits_for_first() -> anyhow::Result<()> {
        let (_dir, _tm, vm) = setup()?;
        let uid = committed_row(&vm, b"contested")?;

        let first = vm.begin(RC)?;
        let second = vm.begin(RC)?;
        assert!(vm.delete(first, uid)?);

        let waiter = {
            let vm = Arc::clone(&vm);
            thread::spawn(move || vm.delete(second, uid))
        };
        wait_until_blocked(&vm, second);
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        vm.commit(first)?;
        assert!(!waiter.join().unwrap()?);
        vm.commit(second)?;
        Ok(())
    }

    #[test]
    fn test_waiter_takes_over_after_abort() -> anyhow::Result<()> {
        let (_dir, _tm, vm) = setup()?;
        let uid = committed_row(&vm, b"contested")?;

        let first = vm.begin(RC)?;
        let second = vm.begin(RC)?;
        assert!(vm.delete(first, uid)?);

        let waiter = {
            let vm = Arc::clone(&vm);
            thread::spawn(move || vm.delete(second, uid))
        };
        wait_until_blocked(&vm, second);

        vm.abort(first)?;
        assert!(waiter.join().unwrap()?);
        vm.commit(second)?;

        let reader = vm.begin(RC)?;
        assert_eq!(vm.read(reader, uid)?, None);
        Ok(())
    }

    #[test]
    fn test_version_skip_aborts() -> anyhow::Result<()> {
        let (_dir, tm, vm) = setup()?;
        let uid = committed_row(&vm, b"row")?;

        let reader = vm.begin(RR)?;
        let deleter = vm.begin(RC)?;
        assert!(vm.delete(deleter, uid)?);
        vm.commit(deleter)?;

        // Still visible to the snapshot, but deleting it would lose an update.
        assert_eq!(vm.read(reader, uid)?, Some(b"row".to_vec()));
        assert!(matches!(
            vm.delete(reader, uid),
            Err(DbError::ConcurrentUpdate(_))
        ));
        assert!(tm.is_aborted(reader)?);

        // Sticky until the caller aborts.
        assert!(vm.read(reader, uid).is_err());
        assert!(vm.commit(reader).is_err());
        vm.abort(reader)?;
        assert!(vm.active_transactions().is_empty());
        Ok(())
    }

    #[test]
    fn test_deadlock_aborts_one_deleter() -> anyhow::Result<()> {
        let (_dir, tm, vm) = setup()?;
        let a = committed_row(&vm, b"a")?;
        let b = committed_row(&vm, b"b")?;

        let t1 = vm.begin(RC)?;
        let t2 = vm.begin(RC)?;
        assert!(vm.delete(t1, a)?);
        assert!(vm.delete(t2, b)?);

        let waiter = {
            let vm = Arc::clone(&vm);
            thread::spawn(move || vm.delete(t2, a))
        };
        wait_until_blocked(&vm, t2);

        assert!(matches!(vm.delete(t1, b), Err(DbError::ConcurrentUpdate(_))));
        assert!(tm.is_aborted(t1)?);

        // t1's delete of `a` was aborted, so t2 may delete it.
        assert!(waiter.join().unwrap()?);
        vm.commit(t2)?;
        vm.abort(t1)?;
        Ok(())
    }

    #[test]
    fn test_concurrent_deletes_one_winner() -> anyhow::Result<()> {
        let (_dir, _tm, vm) = setup()?;
        let uid = committed_row(&vm, b"row")?;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let vm = Arc::clone(&vm);
                thread::spawn(move || -> DbResult<bool> {
                    let xid = vm.begin(RC)?;
                    match vm.delete(xid, uid) {
                        Ok(deleted) => {
                            vm.commit(xid)?;
                            Ok(deleted)
                        }
                        Err(e) if e.is_conflict() => {
                            vm.abort(xid)?;
                            Ok(false)
                        }
                        Err(e) => Err(e),
                    }
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<DbResult<Vec<_>>>()?
            .into_iter()
            .filter(|&deleted| deleted)
            .count();
        assert_eq!(winners, 1);
        Ok(())
    }

    #[test]
    fn test_super_transaction() -> anyhow::Result<()> {
        let (_dir, _tm, vm) = setup()?;
        let uid = vm.insert(SUPER_XID, b"internal")?;
        vm.commit(SUPER_XID)?;
        vm.abort(SUPER_XID)?;

        let reader = vm.begin(RR)?;
        assert_eq!(vm.read(reader, uid)?, Some(b"internal".to_vec()));
        assert!(vm.active_transactions().contains(&reader));
        Ok(())
    }

    #[test]
    fn test_close_aborts_running_transactions() -> anyhow::Result<()> {
        let (_dir, tm, vm) = setup()?;
        let running = vm.begin(RC)?;
        let done = vm.begin(RC)?;
        vm.commit(done)?;

        vm.close()?;
        assert!(tm.is_aborted(running)?);
        assert!(tm.is_committed(done)?);
        assert!(vm.active_transactions().is_empty());
        Ok(())
    }
}
