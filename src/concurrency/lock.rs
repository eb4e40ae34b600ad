//! Exclusive per-uid locks held until the owning transaction ends.
//!
//! A transaction that asks for a uid held by another transaction joins a FIFO
//! queue for it and blocks. Before blocking, the wait-for graph is checked;
//! if waiting would close a cycle the request fails with
//! [`DbError::Deadlock`] instead.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::error::{DbError, DbResult};
use crate::transaction::TransactionId;

#[derive(Default)]
struct LockState {
    /// uid -> holder.
    holders: HashMap<u64, TransactionId>,
    /// Transaction -> uids it holds, in acquisition order.
    held: HashMap<TransactionId, Vec<u64>>,
    /// uid -> transactions queued for it.
    waiting: HashMap<u64, VecDeque<TransactionId>>,
    /// Transaction -> the uid it is blocked on.
    waits_for: HashMap<TransactionId, u64>,
}

impl LockState {
    fn grant(&mut self, xid: TransactionId, uid: u64) {
        self.holders.insert(uid, xid);
        self.held.entry(xid).or_default().push(uid);
    }

    /// Whether `holder` already waits, directly or transitively, on `waiter`.
    fn would_cause_deadlock(&self, waiter: TransactionId, holder: TransactionId) -> bool {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(holder);

        while let Some(current) = queue.pop_front() {
            if current == waiter {
                return true;
            }
            if visited.insert(current) {
                // A transaction blocks on at most one uid at a time.
                if let Some(next) = self
                    .waits_for
                    .get(&current)
                    .and_then(|uid| self.holders.get(uid))
                {
                    queue.push_back(*next);
                }
            }
        }

        false
    }

    fn dequeue(&mut self, xid: TransactionId, uid: u64) {
        self.waits_for.remove(&xid);
        if let Some(queue) = self.waiting.get_mut(&uid) {
            queue.retain(|&w| w != xid);
            if queue.is_empty() {
                self.waiting.remove(&uid);
            }
        }
    }

    /// Hand `uid` to the first transaction still queued for it.
    fn pass_on(&mut self, uid: u64) {
        self.holders.remove(&uid);
        let Some(queue) = self.waiting.get_mut(&uid) else {
            return;
        };
        let next = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(&uid);
        }
        if let Some(next) = next {
            self.waits_for.remove(&next);
            self.grant(next, uid);
        }
    }
}

/// Lock table used by deletes.
#[derive(Default)]
pub struct LockTable {
    state: Mutex<LockState>,
    granted: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `uid` for `xid`, blocking while another transaction holds it.
    pub fn acquire(&self, xid: TransactionId, uid: u64) -> DbResult<()> {
        let mut state = self.state.lock();

        let holder = match state.holders.get(&uid) {
            None => {
                state.grant(xid, uid);
                return Ok(());
            }
            Some(&holder) if holder == xid => return Ok(()),
            Some(&holder) => holder,
        };

        if state.would_cause_deadlock(xid, holder) {
            debug!("Deadlock: {} would wait on {} for {:#x}", xid, holder, uid);
            return Err(DbError::Deadlock {
                xid: xid.value(),
                uid,
            });
        }

        state.waits_for.insert(xid, uid);
        state.waiting.entry(uid).or_default().push_back(xid);

        while state.holders.get(&uid) != Some(&xid) {
            if !state.waits_for.contains_key(&xid) {
                // Released by `release_all` while waiting.
                return Err(DbError::Deadlock {
                    xid: xid.value(),
                    uid,
                });
            }
            self.granted.wait(&mut state);
        }
        Ok(())
    }

    /// Release every uid held by `xid` and withdraw any pending request.
    pub fn release_all(&self, xid: TransactionId) {
        let mut state = self.state.lock();

        if let Some(&uid) = state.waits_for.get(&xid) {
            state.dequeue(xid, uid);
        }
        if let Some(uids) = state.held.remove(&xid) {
            for uid in uids {
                state.pass_on(uid);
            }
        }
        self.granted.notify_all();
    }

    pub fn holder(&self, uid: u64) -> Option<TransactionId> {
        self.state.lock().holders.get(&uid).copied()
    }

    /// Whether `xid` is currently queued for some uid.
    pub fn is_waiting(&self, xid: TransactionId) -> bool {
        self.state.lock().waits_for.contains_key(&xid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn xid(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    #[test]
    fn test_acquire_is_reentrant() {
        let table = LockTable::new();
        table.acquire(xid(1), 10).unwrap();
        table.acquire(xid(1), 10).unwrap();
        assert_eq!(table.holder(10), Some(xid(1)));

        table.release_all(xid(1));
        assert_eq!(table.holder(10), None);
    }

    #[test]
    fn test_waiter_blocks_until_release() {
        let table = Arc::new(LockTable::new());
        table.acquire(xid(1), 10).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.acquire(xid(2), 10).unwrap();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        table.release_all(xid(1));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert_eq!(table.holder(10), Some(xid(2)));
    }

    #[test]
    fn test_waiters_are_served_in_order() {
        let table = Arc::new(LockTable::new());
        table.acquire(xid(1), 10).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut handles = vec![];
        for n in 2..=3 {
            let shared = Arc::clone(&table);
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                shared.acquire(xid(n), 10).unwrap();
                tx.send(n).unwrap();
                thread::sleep(Duration::from_millis(20));
                shared.release_all(xid(n));
            }));
            // Make sure 2 queues before 3.
            while table.state.lock().waits_for.get(&xid(n)).is_none() {
                thread::yield_now();
            }
        }

        table.release_all(xid(1));
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(rx.recv().unwrap(), 3);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_deadlock_detected() {
        let table = Arc::new(LockTable::new());
        table.acquire(xid(1), 10).unwrap();
        table.acquire(xid(2), 20).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.acquire(xid(1), 20))
        };
        while table.state.lock().waits_for.get(&xid(1)).is_none() {
            thread::yield_now();
        }

        // 2 -> 10 (held by 1) while 1 -> 20 (held by 2).
        let result = table.acquire(xid(2), 10);
        assert!(matches!(result, Err(DbError::Deadlock { xid: 2, uid: 10 })));

        table.release_all(xid(2));
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(table.holder(20), Some(xid(1)));
    }

    #[test]
    fn test_longer_cycle_detected() {
        let table = Arc::new(LockTable::new());
        for n in 1..=3 {
            table.acquire(xid(n), n * 10).unwrap();
        }

        let mut waiters = vec![];
        // 1 waits on 20 (held by 2), 2 waits on 30 (held by 3).
        for (waiter, uid) in [(1, 20), (2, 30)] {
            let shared = Arc::clone(&table);
            waiters.push(thread::spawn(move || shared.acquire(xid(waiter), uid)));
            while table.state.lock().waits_for.get(&xid(waiter)).is_none() {
                thread::yield_now();
            }
        }

        assert!(table.acquire(xid(3), 10).is_err());
        table.release_all(xid(3));
        let first = waiters.remove(0);
        let second = waiters.remove(0);
        assert!(second.join().unwrap().is_ok());
        table.release_all(xid(2));
        assert!(first.join().unwrap().is_ok());
    }
}
