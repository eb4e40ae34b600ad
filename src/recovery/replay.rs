use std::collections::BTreeSet;

use log::{debug, info};

use crate::access::data_item::set_raw_invalid;
use crate::error::DbResult;
use crate::storage::page::data_page;
use crate::storage::wal::{InsertRecord, UpdateRecord, WalManager, WalRecord};
use crate::storage::{PageCache, PageId};
use crate::transaction::{TransactionId, TransactionManager};

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Number of records found in the log.
    pub records_analyzed: usize,
    pub records_redone: usize,
    /// Number of records whose effect was rolled back.
    pub records_undone: usize,
    /// Transactions found active and marked aborted.
    pub transactions_aborted: usize,
    /// Page count the file was truncated to.
    pub max_page: u32,
}

struct Analysis {
    records: usize,
    max_page: PageId,
    losers: BTreeSet<TransactionId>,
}

/// Replays the log against the page file.
pub struct Recovery<'a> {
    tm: &'a TransactionManager,
    wal: &'a WalManager,
    pages: &'a PageCache,
}

impl<'a> Recovery<'a> {
    pub fn new(tm: &'a TransactionManager, wal: &'a WalManager, pages: &'a PageCache) -> Self {
        Recovery { tm, wal, pages }
    }

    pub fn run(&self) -> DbResult<RecoveryStats> {
        info!("Recovery started");

        let analysis = self.analyze()?;
        self.pages.truncate_by_page_id(analysis.max_page)?;
        debug!("Truncated page file to {} pages", analysis.max_page.0);

        let records_redone = self.redo()?;
        let records_undone = self.undo(&analysis.losers)?;

        let mut transactions_aborted = 0;
        for &xid in &analysis.losers {
            if self.tm.is_active(xid)? {
                self.tm.abort(xid)?;
                transactions_aborted += 1;
            }
        }

        let stats = RecoveryStats {
            records_analyzed: analysis.records,
            records_redone,
            records_undone,
            transactions_aborted,
            max_page: analysis.max_page.0,
        };
        info!("Recovery finished: {:?}", stats);
        Ok(stats)
    }

    fn analyze(&self) -> DbResult<Analysis> {
        let mut analysis = Analysis {
            records: 0,
            max_page: PageId(1),
            losers: BTreeSet::new(),
        };

        self.wal.rewind();
        while let Some(record) = self.wal.next_record()? {
            analysis.records += 1;
            analysis.max_page = analysis.max_page.max(record.page_id());
            let xid = record.xid();
            if !self.tm.is_committed(xid)? {
                analysis.losers.insert(xid);
            }
        }
        Ok(analysis)
    }

    fn redo(&self) -> DbResult<usize> {
        let mut redone = 0;
        self.wal.rewind();
        while let Some(record) = self.wal.next_record()? {
            let page = self.pages.get_page(record.page_id())?;
            match &record {
                WalRecord::Insert(InsertRecord { offset, raw, .. }) => {
                    data_page::recover_insert(&page, raw, *offset)?;
                }
                WalRecord::Update(UpdateRecord {
                    offset, new_raw, ..
                }) => {
                    data_page::recover_update(&page, new_raw, *offset)?;
                }
            }
            page.release()?;
            redone += 1;
        }
        Ok(redone)
    }

    fn undo(&self, losers: &BTreeSet<TransactionId>) -> DbResult<usize> {
        let mut pending = Vec::new();
        self.wal.rewind();
        while let Some(record) = self.wal.next_record()? {
            if losers.contains(&record.xid()) {
                pending.push(record);
            }
        }

        let mut undone = 0;
        for record in pending.iter().rev() {
            let page = self.pages.get_page(record.page_id())?;
            match record {
                WalRecord::Insert(InsertRecord { offset, raw, .. }) => {
                    let mut raw = raw.clone();
                    set_raw_invalid(&mut raw);
                    data_page::recover_insert(&page, &raw, *offset)?;
                    undone += 1;
                }
                WalRecord::Update(UpdateRecord {
                    offset,
                    old_raw,
                    new_raw,
                    ..
                }) => {
                    // A committed writer may have overwritten the item after
                    // this transaction released it.
                    let start = *offset as usize;
                    let current = page.read(|data| {
                        data.get(start..start + new_raw.len()) == Some(new_raw.as_slice())
                    });
                    if current {
                        data_page::recover_update(&page, old_raw, *offset)?;
                        undone += 1;
                    }
                }
            }
            page.release()?;
        }
        Ok(undone)
    }
}

/// Recover the page file from the log.
pub fn recover(
    tm: &TransactionManager,
    wal: &WalManager,
    pages: &PageCache,
) -> DbResult<RecoveryStats> {
    Recovery::new(tm, wal, pages).run()
}
