// storage/src/version/transaction.rs

use crate::transaction::{IsolationLevel, SUPER_XID};
use crate::{Result, StorageError, Uid, Xid};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct Bookkeeping {
    // Versions this transaction replaced: old uid -> new uid.
    updated: HashMap<Uid, Uid>,
    // Remaps published by committed transactions that were in our snapshot.
    committed_updates: HashMap<Xid, HashMap<Uid, Uid>>,
    // Versions this transaction stamped as deleted.
    deleted: Vec<Uid>,
    failed: bool,
}

/// In-memory MVCC state of one active transaction.
pub struct Transaction {
    xid: Xid,
    level: IsolationLevel,
    snapshot: HashSet<Xid>,
    book: Mutex<Bookkeeping>,
}

impl Transaction {
    /// `snapshot` is the set of other transactions active when this one began.
    pub fn new(xid: Xid, level: IsolationLevel, mut snapshot: HashSet<Xid>) -> Self {
        snapshot.remove(&xid);
        Self {
            xid,
            level,
            snapshot,
            book: Mutex::new(Bookkeeping::default()),
        }
    }

    /// The always-committed super transaction: read committed, empty snapshot.
    pub fn super_transaction() -> Self {
        Self::new(SUPER_XID, IsolationLevel::ReadCommitted, HashSet::new())
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    pub fn in_snapshot(&self, xid: Xid) -> bool {
        self.snapshot.contains(&xid)
    }

    pub fn snapshot(&self) -> &HashSet<Xid> {
        &self.snapshot
    }

    pub fn record_update(&self, old: Uid, new: Uid) {
        self.book.lock().updated.insert(old, new);
    }

    pub fn updates(&self) -> HashMap<Uid, Uid> {
        self.book.lock().updated.clone()
    }

    /// Takes the remaps of a transaction from our snapshot that just committed.
    pub fn receive_updates(&self, from: Xid, updates: HashMap<Uid, Uid>) {
        self.book
            .lock()
            .committed_updates
            .entry(from)
            .or_default()
            .extend(updates);
    }

    /// Where `from` moved `uid` to, if it published such a remap to us.
    pub fn successor(&self, from: Xid, uid: Uid) -> Option<Uid> {
        self.book
            .lock()
            .committed_updates
            .get(&from)
            .and_then(|updates| updates.get(&uid))
            .copied()
    }

    pub fn record_delete(&self, uid: Uid) {
        self.book.lock().deleted.push(uid);
    }

    pub fn deleted(&self) -> Vec<Uid> {
        self.book.lock().deleted.clone()
    }

    pub fn mark_failed(&self) {
        self.book.lock().failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.book.lock().failed
    }

    /// Fails with `TransactionFailed` once a conflict has been reported.
    pub fn check(&self) -> Result<()> {
        if self.is_failed() {
            return Err(StorageError::TransactionFailed(self.xid));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.xid)
            .field("level", &self.level)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}
