//! Visibility of row versions to transactions.

use crate::concurrency::mvcc::{IsolationLevel, TransactionInfo};
use crate::concurrency::version::Entry;
use crate::error::DbResult;
use crate::transaction::{TransactionId, TransactionManager};

/// Whether the version was deleted by a transaction `t` must not see, which
/// makes deleting it a lost update. Only repeatable read checks this.
pub fn is_version_skip(tm: &TransactionManager, t: &TransactionInfo, e: &Entry) -> DbResult<bool> {
    if t.level == IsolationLevel::ReadCommitted {
        return Ok(false);
    }
    let xmax = e.xmax();
    Ok(!xmax.is_super() && tm.is_committed(xmax)? && (xmax > t.xid || t.in_snapshot(xmax)))
}

pub fn is_visible(tm: &TransactionManager, t: &TransactionInfo, e: &Entry) -> DbResult<bool> {
    check(tm, t, e.xmin(), e.xmax())
}

fn check(
    tm: &TransactionManager,
    t: &TransactionInfo,
    xmin: TransactionId,
    xmax: TransactionId,
) -> DbResult<bool> {
    match t.level {
        IsolationLevel::ReadCommitted => read_committed(tm, t.xid, xmin, xmax),
        IsolationLevel::RepeatableRead => repeatable_read(tm, t, xmin, xmax),
    }
}

fn read_committed(
    tm: &TransactionManager,
    xid: TransactionId,
    xmin: TransactionId,
    xmax: TransactionId,
) -> DbResult<bool> {
    if xmin == xid && xmax.is_super() {
        return Ok(true);
    }

    if tm.is_committed(xmin)? {
        if xmax.is_super() {
            return Ok(true);
        }
        if xmax != xid && !tm.is_committed(xmax)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn repeatable_read(
    tm: &TransactionManager,
    t: &TransactionInfo,
    xmin: TransactionId,
    xmax: TransactionId,
) -> DbResult<bool> {
    let xid = t.xid;
    if xmin == xid && xmax.is_super() {
        return Ok(true);
    }

    if tm.is_committed(xmin)? && xmin < xid && !t.in_snapshot(xmin) {
        if xmax.is_super() {
            return Ok(true);
        }
        if xmax != xid
            && (!tm.is_committed(xmax)? || xmax > xid || t.in_snapshot(xmax))
        {
            return Ok(true);
        }
    }
    Ok(false)
}
