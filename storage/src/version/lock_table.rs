// storage/src/version/lock_table.rs

//! Per-row write locks.
//!
//! A transaction takes the lock of a row before deleting or updating it and
//! keeps every lock until it finishes. Waiters queue per row; releasing hands
//! the row to exactly the next waiter, which learns who held it before.

use crate::{Result, StorageError, Uid, Xid};
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};

/// How a lock was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// The row was free.
    Immediate,
    /// The caller already held it.
    Reentrant,
    /// The caller waited; `previous` held the row until it finished.
    AfterWait { previous: Xid },
}

#[derive(Default)]
struct LockState {
    holders: HashMap<Uid, Xid>,
    held: HashMap<Xid, Vec<Uid>>,
    waiters: HashMap<Uid, VecDeque<Xid>>,
    waiting_on: HashMap<Xid, Uid>,
    // Waiter -> transaction that handed it the lock.
    handed_from: HashMap<Xid, Xid>,
    cancelled: HashSet<Xid>,
    closed: bool,
}

impl LockState {
    fn grant(&mut self, xid: Xid, uid: Uid) {
        self.holders.insert(uid, xid);
        self.held.entry(xid).or_default().push(uid);
    }

    /// Following holders through the rows they wait on from `uid`, do we
    /// come back to `xid`?
    fn closes_cycle(&self, xid: Xid, uid: Uid) -> bool {
        let mut seen = HashSet::new();
        let mut row = uid;
        while let Some(&holder) = self.holders.get(&row) {
            if holder == xid {
                return true;
            }
            if !seen.insert(holder) {
                return false;
            }
            match self.waiting_on.get(&holder) {
                Some(&next) => row = next,
                None => return false,
            }
        }
        false
    }

    fn stop_waiting(&mut self, xid: Xid) {
        if let Some(uid) = self.waiting_on.remove(&xid) {
            if let Some(queue) = self.waiters.get_mut(&uid) {
                queue.retain(|w| *w != xid);
                if queue.is_empty() {
                    self.waiters.remove(&uid);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct LockTable {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock of `uid` for `xid`, blocking while another transaction
    /// holds it.
    ///
    /// Fails with `Deadlock` if the wait would close a cycle, with
    /// `TransactionFailed` if `xid` was released while waiting, and with
    /// `LockTableClosed` on shutdown.
    pub fn acquire(&self, xid: Xid, uid: Uid) -> Result<LockGrant> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::LockTableClosed);
        }

        match state.holders.get(&uid).copied() {
            None => {
                state.grant(xid, uid);
                return Ok(LockGrant::Immediate);
            }
            Some(holder) if holder == xid => return Ok(LockGrant::Reentrant),
            Some(_) => {}
        }

        if state.closes_cycle(xid, uid) {
            warn!("deadlock: xid {} waiting on row {:#x}", xid, uid);
            return Err(StorageError::Deadlock { xid, uid });
        }

        state.waiters.entry(uid).or_default().push_back(xid);
        state.waiting_on.insert(xid, uid);
        trace!("xid {} waits for row {:#x}", xid, uid);

        loop {
            self.changed.wait(&mut state);

            if state.holders.get(&uid) == Some(&xid) {
                let previous = state.handed_from.remove(&xid).unwrap_or_default();
                return Ok(LockGrant::AfterWait { previous });
            }
            if state.cancelled.remove(&xid) {
                return Err(StorageError::TransactionFailed(xid));
            }
            if state.closed {
                state.stop_waiting(xid);
                return Err(StorageError::LockTableClosed);
            }
        }
    }

    /// Releases every lock `xid` holds, handing each row to its next waiter,
    /// and cancels a wait `xid` may be blocked in.
    pub fn release_all(&self, xid: Xid) {
        let mut state = self.state.lock();

        if state.waiting_on.contains_key(&xid) {
            state.stop_waiting(xid);
            state.cancelled.insert(xid);
        }

        for uid in state.held.remove(&xid).unwrap_or_default() {
            let next = state.waiters.get_mut(&uid).and_then(VecDeque::pop_front);
            if state.waiters.get(&uid).is_some_and(VecDeque::is_empty) {
                state.waiters.remove(&uid);
            }
            match next {
                Some(next) => {
                    state.waiting_on.remove(&next);
                    state.handed_from.insert(next, xid);
                    state.grant(next, uid);
                    trace!("row {:#x} handed from xid {} to xid {}", uid, xid, next);
                }
                None => {
                    state.holders.remove(&uid);
                }
            }
        }

        self.changed.notify_all();
    }

    pub fn holder(&self, uid: Uid) -> Option<Xid> {
        self.state.lock().holders.get(&uid).copied()
    }

    pub fn held_by(&self, xid: Xid) -> Vec<Uid> {
        self.state.lock().held.get(&xid).cloned().unwrap_or_default()
    }

    /// Number of transactions blocked on `uid`.
    pub fn waiting(&self, uid: Uid) -> usize {
        self.state.lock().waiters.get(&uid).map_or(0, VecDeque::len)
    }

    /// Refuses new locks and wakes every waiter with `LockTableClosed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_all();
    }
}
