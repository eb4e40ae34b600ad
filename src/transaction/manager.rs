//! Durable transaction ledger.
//!
//! File layout: an 8-byte big-endian header counting the issued transaction
//! ids, followed by one status byte per id (id `n` lives at byte `8 + n - 1`).
//! The super transaction 0 has no byte and is always committed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::id::{TransactionId, SUPER_XID};
use super::state::TransactionState;
use crate::error::{DbError, DbResult};

/// Size of the xid counter header.
pub const LEN_XID_HEADER: u64 = 8;
/// Size of one status entry.
const XID_FIELD_SIZE: u64 = 1;

struct Ledger {
    file: File,
    /// In-memory mirror of every status byte, indexed by `xid - 1`.
    statuses: Vec<TransactionState>,
}

impl Ledger {
    fn position(xid: TransactionId) -> u64 {
        LEN_XID_HEADER + (xid.value() - 1) * XID_FIELD_SIZE
    }

    fn write_status(&mut self, xid: TransactionId, state: TransactionState) -> DbResult<()> {
        self.file.seek(SeekFrom::Start(Self::position(xid)))?;
        self.file.write_all(&[state.to_byte()])?;
        self.file.sync_data()?;
        Ok(())
    }

    fn write_counter(&mut self, counter: u64) -> DbResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_u64::<BigEndian>(counter)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// The transaction manager records the lifecycle of every transaction on disk.
pub struct TransactionManager {
    ledger: Mutex<Ledger>,
}

impl TransactionManager {
    /// Create an empty ledger at `path`.
    pub fn create(path: &Path) -> DbResult<Self> {
        if path.exists() {
            return Err(DbError::FileExists(path.to_path_buf()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_u64::<BigEndian>(0)?;
        file.sync_all()?;

        debug!("Created transaction ledger at {:?}", path);
        Ok(Self {
            ledger: Mutex::new(Ledger {
                file,
                statuses: Vec::new(),
            }),
        })
    }

    /// Open an existing ledger and validate its length against the header.
    pub fn open(path: &Path) -> DbResult<Self> {
        if !path.exists() {
            return Err(DbError::FileNotFound(path.to_path_buf()));
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < LEN_XID_HEADER {
            return Err(DbError::corrupted(
                "transaction ledger",
                format!("file is {} bytes, shorter than its header", file_len),
            ));
        }

        file.seek(SeekFrom::Start(0))?;
        let counter = file.read_u64::<BigEndian>()?;
        let expected = LEN_XID_HEADER + counter * XID_FIELD_SIZE;
        if file_len != expected {
            return Err(DbError::corrupted(
                "transaction ledger",
                format!(
                    "header counts {} transactions but file is {} bytes",
                    counter, file_len
                ),
            ));
        }

        let mut raw = Vec::with_capacity(counter as usize);
        file.read_to_end(&mut raw)?;
        let statuses = raw
            .into_iter()
            .map(TransactionState::from_byte)
            .collect::<DbResult<Vec<_>>>()?;

        debug!("Opened transaction ledger with {} transactions", counter);
        Ok(Self {
            ledger: Mutex::new(Ledger { file, statuses }),
        })
    }

    /// Start a new transaction and return its id.
    pub fn begin(&self) -> DbResult<TransactionId> {
        let mut ledger = self.ledger.lock();
        let xid = TransactionId::new(ledger.statuses.len() as u64 + 1);

        ledger.write_status(xid, TransactionState::Active)?;
        ledger.write_counter(xid.value())?;
        ledger.statuses.push(TransactionState::Active);

        Ok(xid)
    }

    /// Mark a transaction as committed.
    pub fn commit(&self, xid: TransactionId) -> DbResult<()> {
        self.set_state(xid, TransactionState::Committed)
    }

    /// Mark a transaction as aborted.
    pub fn abort(&self, xid: TransactionId) -> DbResult<()> {
        self.set_state(xid, TransactionState::Aborted)
    }

    fn set_state(&self, xid: TransactionId, state: TransactionState) -> DbResult<()> {
        if xid.is_super() {
            return Ok(());
        }

        let mut ledger = self.ledger.lock();
        let index = Self::index(&ledger, xid)?;
        ledger.write_status(xid, state)?;
        ledger.statuses[index] = state;
        Ok(())
    }

    fn index(ledger: &Ledger, xid: TransactionId) -> DbResult<usize> {
        let index = xid.value() as usize - 1;
        if index >= ledger.statuses.len() {
            return Err(DbError::TransactionNotFound(xid.value()));
        }
        Ok(index)
    }

    /// Gets the recorded state of a transaction.
    pub fn state(&self, xid: TransactionId) -> DbResult<TransactionState> {
        if xid == SUPER_XID {
            return Ok(TransactionState::Committed);
        }

        let ledger = self.ledger.lock();
        let index = Self::index(&ledger, xid)?;
        Ok(ledger.statuses[index])
    }

    pub fn is_active(&self, xid: TransactionId) -> DbResult<bool> {
        Ok(self.state(xid)?.is_active())
    }

    pub fn is_committed(&self, xid: TransactionId) -> DbResult<bool> {
        Ok(self.state(xid)?.is_committed())
    }

    pub fn is_aborted(&self, xid: TransactionId) -> DbResult<bool> {
        Ok(self.state(xid)?.is_aborted())
    }

    /// Number of transaction ids issued so far.
    pub fn xid_count(&self) -> u64 {
        self.ledger.lock().statuses.len() as u64
    }

    /// Returns every transaction still marked active.
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let ledger = self.ledger.lock();
        ledger
            .statuses
            .iter()
            .enumerate()
            .filter(|(_, state)| state.is_active())
            .map(|(i, _)| TransactionId::new(i as u64 + 1))
            .collect()
    }

    /// Force every transaction still marked active to aborted.
    ///
    /// Used at open time: nothing can be running yet, so an active entry is
    /// a transaction that died with the previous process.
    pub fn abort_dangling(&self) -> DbResult<Vec<TransactionId>> {
        let dangling = self.active_transactions();
        for &xid in &dangling {
            warn!("Transaction {} was left active, marking it aborted", xid);
            self.abort(xid)?;
        }
        Ok(dangling)
    }

    /// Flush the ledger file.
    pub fn close(&self) -> DbResult<()> {
        let ledger = self.ledger.lock();
        ledger.file.sync_all()?;
        info!(
            "Closed transaction ledger with {} transactions",
            ledger.statuses.len()
        );
        Ok(())
    }
}
