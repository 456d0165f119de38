// storage/src/version/mod.rs

//! Multi-version concurrency control over [`DataManager`] records.
//!
//! Every row version is a record wrapped as `[xmin][xmax][row]`. Deleting
//! stamps xmax; updating deletes the old version, inserts a new one and
//! remembers the remap so waiters can chase the row to its successor.

mod lock_table;
mod transaction;
mod visibility;
mod wrap;

pub use lock_table::{LockGrant, LockTable};
pub use transaction::Transaction;
pub use visibility::{is_version_skip, is_visible};
pub use wrap::{VersionHeader, VersionWrap};

use crate::data::DataManager;
use crate::transaction::{
    IsolationLevel, TransactionManager, TransactionObserver, TransactionState, TransactionStatus,
    SUPER_XID,
};
use crate::{Result, StorageError, Uid, Xid};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A stored version as seen by one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowVersion {
    pub header: VersionHeader,
    pub visible: bool,
    pub data: Vec<u8>,
}

pub struct VersionManager {
    dm: DataManager,
    status: Arc<dyn TransactionStatus>,
    active: RwLock<HashMap<Xid, Arc<Transaction>>>,
    lock_table: LockTable,
    super_txn: Arc<Transaction>,
}

impl VersionManager {
    pub fn new(dm: DataManager, status: Arc<dyn TransactionStatus>) -> Self {
        Self {
            dm,
            status,
            active: RwLock::new(HashMap::new()),
            lock_table: LockTable::new(),
            super_txn: Arc::new(Transaction::super_transaction()),
        }
    }

    /// Creates a version manager reading states from `tm`'s log and
    /// subscribes it to `tm`'s transitions.
    pub fn attach(dm: DataManager, tm: &TransactionManager) -> Arc<Self> {
        let vm = Arc::new(Self::new(dm, tm.status_log()));
        tm.subscribe(vm.clone());
        vm
    }

    pub fn data_manager(&self) -> &DataManager {
        &self.dm
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    /// Transaction state for `xid`; xid 0 is the super transaction.
    pub fn transaction(&self, xid: Xid) -> Result<Arc<Transaction>> {
        if xid == SUPER_XID {
            return Ok(Arc::clone(&self.super_txn));
        }
        self.active
            .read()
            .get(&xid)
            .cloned()
            .ok_or(StorageError::UnknownTransaction(xid))
    }

    pub fn active_xids(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self.active.read().keys().copied().collect();
        xids.sort_unstable();
        xids
    }

    fn usable(&self, xid: Xid) -> Result<Arc<Transaction>> {
        let txn = self.transaction(xid)?;
        txn.check()?;
        Ok(txn)
    }

    /// Stores a new version of a row created by `xid`.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        self.usable(xid)?;
        self.dm.insert(&VersionWrap::wrap_raw(xid, data))
    }

    /// The row at `uid` if `xid` can see it.
    pub fn read(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>> {
        let txn = self.usable(xid)?;
        let wrap = match VersionWrap::select(&self.dm, uid)? {
            Some(wrap) => wrap,
            None => return Ok(None),
        };

        if is_visible(self.status.as_ref(), &txn, wrap.header()?)? {
            Ok(Some(wrap.data()?))
        } else {
            Ok(None)
        }
    }

    /// The version at `uid` whether or not `xid` can see it, for callers that
    /// walk older versions themselves. `None` if the record is invalid.
    pub fn read_version(&self, xid: Xid, uid: Uid) -> Result<Option<RowVersion>> {
        let txn = self.usable(xid)?;
        let wrap = match VersionWrap::select(&self.dm, uid)? {
            Some(wrap) => wrap,
            None => return Ok(None),
        };

        let header = wrap.header()?;
        Ok(Some(RowVersion {
            header,
            visible: is_visible(self.status.as_ref(), &txn, header)?,
            data: wrap.data()?,
        }))
    }

    /// Marks the version at `uid` deleted by `xid`. Returns false if `xid`
    /// cannot see it or has already deleted it.
    pub fn delete(&self, xid: Xid, uid: Uid) -> Result<bool> {
        let txn = self.usable(xid)?;
        Ok(self.delete_version(&txn, uid)?.is_some())
    }

    /// Replaces the row at `uid` with `data`. Returns the new version's uid,
    /// or `None` if `xid` cannot see the row.
    pub fn update(&self, xid: Xid, uid: Uid, data: &[u8]) -> Result<Option<Uid>> {
        self.update_with(xid, uid, |_, _| Ok(data.to_vec()))
    }

    /// Like [`update`](Self::update), but builds the new row from the version
    /// actually replaced, which is a successor of `uid` if the row moved while
    /// we waited for its lock.
    pub fn update_with<F>(&self, xid: Xid, uid: Uid, build: F) -> Result<Option<Uid>>
    where
        F: FnOnce(Uid, &[u8]) -> Result<Vec<u8>>,
    {
        let txn = self.usable(xid)?;
        let old = match self.delete_version(&txn, uid)? {
            Some(old) => old,
            None => return Ok(None),
        };

        let previous = VersionWrap::load(&self.dm, old)?.data()?;
        let data = build(old, &previous)?;
        let new = self.dm.insert(&VersionWrap::wrap_raw(xid, &data))?;
        txn.record_update(old, new);
        debug!("xid {} moved row {:#x} to {:#x}", xid, old, new);
        Ok(Some(new))
    }

    /// Records that `xid` replaced `old` by `new`, for callers that delete and
    /// insert themselves.
    pub fn record_update(&self, xid: Xid, old: Uid, new: Uid) -> Result<()> {
        self.usable(xid)?.record_update(old, new);
        Ok(())
    }

    // Returns the uid actually stamped, which differs from `uid` when the row
    // was chased to a successor.
    fn delete_version(&self, txn: &Transaction, uid: Uid) -> Result<Option<Uid>> {
        let xid = txn.xid();
        if xid == SUPER_XID {
            return Err(StorageError::SuperTransactionWrite);
        }

        let wrap = match VersionWrap::select(&self.dm, uid)? {
            Some(wrap) => wrap,
            None => return Ok(None),
        };
        if !is_visible(self.status.as_ref(), txn, wrap.header()?)? {
            return Ok(None);
        }

        let target = self.lock_row(txn, uid)?;
        let wrap = if target == uid {
            wrap
        } else {
            VersionWrap::load(&self.dm, target)?
        };

        let header = wrap.header()?;
        if header.xmax == xid {
            return Ok(None);
        }
        if is_version_skip(self.status.as_ref(), txn, header)? {
            return Err(self.conflict(txn, target, header.xmax));
        }
        if !is_visible(self.status.as_ref(), txn, header)? {
            return Ok(None);
        }

        wrap.set_xmax(xid)?;
        txn.record_delete(target);
        Ok(Some(target))
    }

    /// Locks `uid`, following remaps published by the transactions that held
    /// it before us. Returns the uid finally locked.
    ///
    /// A version the previous holder deleted is checked for a version skip
    /// before the remap is followed, so a repeatable-read waiter fails on the
    /// row it saw instead of landing on a successor it cannot see.
    fn lock_row(&self, txn: &Transaction, uid: Uid) -> Result<Uid> {
        let mut target = uid;
        loop {
            let grant = match self.lock_table.acquire(txn.xid(), target) {
                Ok(grant) => grant,
                Err(e @ StorageError::Deadlock { .. }) => {
                    self.fail(txn);
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            let previous = match grant {
                LockGrant::AfterWait { previous } => previous,
                LockGrant::Immediate | LockGrant::Reentrant => return Ok(target),
            };
            let header = VersionWrap::load(&self.dm, target)?.header()?;
            if is_version_skip(self.status.as_ref(), txn, header)? {
                return Err(self.conflict(txn, target, header.xmax));
            }
            match txn.successor(previous, target) {
                Some(next) if next != target => {
                    debug!(
                        "xid {} chases row {:#x} to {:#x} (moved by xid {})",
                        txn.xid(),
                        target,
                        next,
                        previous
                    );
                    target = next;
                }
                _ => return Ok(target),
            }
        }
    }

    // Conflicts leave the transaction unusable and free its rows at once.
    fn fail(&self, txn: &Transaction) {
        txn.mark_failed();
        self.lock_table.release_all(txn.xid());
    }

    fn conflict(&self, txn: &Transaction, uid: Uid, deleter: Xid) -> StorageError {
        let xid = txn.xid();
        warn!(
            "xid {} hit a concurrent update on row {:#x} (deleted by xid {})",
            xid, uid, deleter
        );
        self.fail(txn);
        StorageError::ConcurrentUpdate { xid, uid }
    }

    // Runs once the commit is durable: waiters chase these remaps, so an
    // observer that rejects the commit must not have published them.
    fn publish_updates(&self, xid: Xid) {
        let active = self.active.read();
        let updates = match active.get(&xid) {
            Some(txn) => txn.updates(),
            None => return,
        };
        if updates.is_empty() {
            return;
        }
        for other in active.values() {
            if other.xid() != xid && other.in_snapshot(xid) {
                other.receive_updates(xid, updates.clone());
            }
        }
    }

    /// Wakes every blocked row lock waiter with `LockTableClosed`.
    pub fn close(&self) {
        self.lock_table.close();
    }
}

impl TransactionObserver for VersionManager {
    fn on_begin(&self, xid: Xid, level: IsolationLevel) -> Result<()> {
        let mut active = self.active.write();
        let snapshot = active.keys().copied().collect();
        active.insert(xid, Arc::new(Transaction::new(xid, level, snapshot)));
        Ok(())
    }

    fn on_commit(&self, xid: Xid) -> Result<()> {
        self.transaction(xid)?.check()
    }

    fn on_abort(&self, xid: Xid) -> Result<()> {
        let txn = self.transaction(xid)?;

        let mut first_error = None;
        for uid in txn.deleted() {
            let cleared = VersionWrap::load(&self.dm, uid).and_then(|wrap| wrap.clear_xmax_if(xid));
            if let Err(e) = cleared {
                warn!("xid {} could not clear its delete mark on {:#x}: {}", xid, uid, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn on_finish(&self, xid: Xid, state: TransactionState) {
        if state == TransactionState::Committed {
            self.publish_updates(xid);
        }
        self.active.write().remove(&xid);
        self.lock_table.release_all(xid);
        debug!("xid {} finished as {:?}", xid, state);
    }
}
