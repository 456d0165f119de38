// storage/src/transaction/mod.rs

//! Durable transaction status log.
//!
//! The xid file is an 8-byte big-endian counter holding the last issued xid,
//! followed by one status byte per issued xid at `8 + (xid - 1)`.
//! Xid 0 is the super transaction: always committed, never in the file.

use crate::{Result, StorageError, Xid};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

pub const SUPER_XID: Xid = 0;

const HEADER_LEN: u64 = 8;

const ACTIVE: u8 = 0;
const COMMITTED: u8 = 1;
const ABORTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    fn to_byte(self) -> u8 {
        match self {
            TransactionState::Active => ACTIVE,
            TransactionState::Committed => COMMITTED,
            TransactionState::Aborted => ABORTED,
        }
    }

    fn from_byte(xid: Xid, byte: u8) -> Result<Self> {
        match byte {
            ACTIVE => Ok(TransactionState::Active),
            COMMITTED => Ok(TransactionState::Committed),
            ABORTED => Ok(TransactionState::Aborted),
            other => Err(StorageError::CorruptXidFile(format!(
                "xid {} has status byte {}",
                xid, other
            ))),
        }
    }
}

/// Read access to transaction states.
pub trait TransactionStatus: Send + Sync {
    fn state(&self, xid: Xid) -> Result<TransactionState>;

    fn is_active(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        Ok(self.state(xid)? == TransactionState::Active)
    }

    fn is_committed(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        Ok(self.state(xid)? == TransactionState::Committed)
    }

    fn is_aborted(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        Ok(self.state(xid)? == TransactionState::Aborted)
    }
}

/// Hooks run by [`TransactionManager`] on every transition.
///
/// `on_begin`, `on_commit` and `on_abort` run before the status byte changes;
/// an error from `on_begin` or `on_commit` cancels the transition.
/// `on_finish` runs after the new status is durable; effects other
/// transactions may act on belong there, since a later observer can still
/// reject the commit after an earlier `on_commit` succeeded.
pub trait TransactionObserver: Send + Sync {
    fn on_begin(&self, xid: Xid, level: IsolationLevel) -> Result<()>;

    fn on_commit(&self, xid: Xid) -> Result<()>;

    fn on_abort(&self, xid: Xid) -> Result<()>;

    fn on_finish(&self, _xid: Xid, _state: TransactionState) {}
}

struct XidLogState {
    file: File,
    counter: Xid,
}

/// The xid file.
pub struct XidLog {
    state: Mutex<XidLogState>,
}

impl XidLog {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(&0u64.to_be_bytes())?;
        file.sync_all()?;

        info!("created xid log {}", path.display());
        Ok(Self {
            state: Mutex::new(XidLogState { file, counter: 0 }),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(StorageError::CorruptXidFile(format!(
                "{} bytes is shorter than the header",
                len
            )));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let counter = u64::from_be_bytes(header);

        if counter.checked_add(HEADER_LEN) != Some(len) {
            return Err(StorageError::CorruptXidFile(format!(
                "counter {} does not match file length {}",
                counter, len
            )));
        }

        info!("opened xid log {} at xid {}", path.display(), counter);
        Ok(Self {
            state: Mutex::new(XidLogState { file, counter }),
        })
    }

    /// Last issued xid.
    pub fn counter(&self) -> Xid {
        self.state.lock().counter
    }

    /// Issues the next xid, durably marked active.
    fn issue(&self) -> Result<Xid> {
        let mut state = self.state.lock();
        let xid = state.counter + 1;

        state.file.seek(SeekFrom::Start(status_position(xid)))?;
        state.file.write_all(&[ACTIVE])?;
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&xid.to_be_bytes())?;
        state.file.sync_data()?;

        state.counter = xid;
        Ok(xid)
    }

    fn set_state(&self, xid: Xid, new_state: TransactionState) -> Result<()> {
        let mut state = self.state.lock();
        if xid == SUPER_XID || xid > state.counter {
            return Err(StorageError::UnknownTransaction(xid));
        }

        state.file.seek(SeekFrom::Start(status_position(xid)))?;
        state.file.write_all(&[new_state.to_byte()])?;
        state.file.sync_data()?;
        Ok(())
    }
}

impl TransactionStatus for XidLog {
    fn state(&self, xid: Xid) -> Result<TransactionState> {
        if xid == SUPER_XID {
            return Ok(TransactionState::Committed);
        }

        let mut state = self.state.lock();
        if xid > state.counter {
            return Err(StorageError::UnknownTransaction(xid));
        }

        let mut byte = [0u8; 1];
        state.file.seek(SeekFrom::Start(status_position(xid)))?;
        state.file.read_exact(&mut byte)?;
        TransactionState::from_byte(xid, byte[0])
    }
}

fn status_position(xid: Xid) -> u64 {
    HEADER_LEN + (xid - 1)
}

/// Issues xids and drives transitions through the log and the observers.
pub struct TransactionManager {
    log: Arc<XidLog>,
    observers: RwLock<Vec<Arc<dyn TransactionObserver>>>,
    // Serializes begin/commit/abort so observers see transitions in log order.
    transition: Mutex<()>,
}

impl TransactionManager {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self::with_log(XidLog::create(path)?))
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::with_log(XidLog::open(path)?))
    }

    fn with_log(log: XidLog) -> Self {
        Self {
            log: Arc::new(log),
            observers: RwLock::new(Vec::new()),
            transition: Mutex::new(()),
        }
    }

    /// The status log, for components that only need to read states.
    pub fn status_log(&self) -> Arc<XidLog> {
        Arc::clone(&self.log)
    }

    pub fn subscribe(&self, observer: Arc<dyn TransactionObserver>) {
        self.observers.write().push(observer);
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn TransactionObserver>) {
        self.observers
            .write()
            .retain(|registered| !Arc::ptr_eq(registered, observer));
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        let _transition = self.transition.lock();
        let xid = self.log.issue()?;

        let observers = self.observers();
        for observer in &observers {
            if let Err(e) = observer.on_begin(xid, level) {
                warn!("begin of xid {} rejected: {}", xid, e);
                for observer in &observers {
                    if let Err(e) = observer.on_abort(xid) {
                        warn!("abort hook for xid {} failed: {}", xid, e);
                    }
                }
                self.log.set_state(xid, TransactionState::Aborted)?;
                self.finish(&observers, xid, TransactionState::Aborted);
                return Err(e);
            }
        }

        debug!("began xid {} ({:?})", xid, level);
        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        let _transition = self.transition.lock();
        self.check_active(xid)?;

        let observers = self.observers();
        for observer in &observers {
            observer.on_commit(xid)?;
        }
        self.log.set_state(xid, TransactionState::Committed)?;
        self.finish(&observers, xid, TransactionState::Committed);

        debug!("committed xid {}", xid);
        Ok(())
    }

    /// Aborts `xid`. Observer failures are logged; the abort always lands.
    pub fn abort(&self, xid: Xid) -> Result<()> {
        let _transition = self.transition.lock();
        self.check_active(xid)?;

        let observers = self.observers();
        for observer in &observers {
            if let Err(e) = observer.on_abort(xid) {
                warn!("abort hook for xid {} failed: {}", xid, e);
            }
        }
        self.log.set_state(xid, TransactionState::Aborted)?;
        self.finish(&observers, xid, TransactionState::Aborted);

        debug!("aborted xid {}", xid);
        Ok(())
    }

    pub fn state(&self, xid: Xid) -> Result<TransactionState> {
        self.log.state(xid)
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        self.log.is_active(xid)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        self.log.is_committed(xid)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool> {
        self.log.is_aborted(xid)
    }

    /// Last issued xid.
    pub fn last_xid(&self) -> Xid {
        self.log.counter()
    }

    fn observers(&self) -> Vec<Arc<dyn TransactionObserver>> {
        self.observers.read().clone()
    }

    fn check_active(&self, xid: Xid) -> Result<()> {
        // Only transactions still active may commit or abort.
        if !self.log.is_active(xid)? {
            return Err(StorageError::UnknownTransaction(xid));
        }
        Ok(())
    }

    fn finish(&self, observers: &[Arc<dyn TransactionObserver>], xid: Xid, state: TransactionState) {
        for observer in observers {
            observer.on_finish(xid, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager() -> (tempfile::TempDir, TransactionManager) {
        let dir = tempfile::tempdir().unwrap();
        let tm = TransactionManager::create(&dir.path().join("xid")).unwrap();
        (dir, tm)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        reject_commit: bool,
    }

    impl TransactionObserver for Recorder {
        fn on_begin(&self, xid: Xid, level: IsolationLevel) -> Result<()> {
            self.events.lock().push(format!("begin {} {:?}", xid, level));
            Ok(())
        }

        fn on_commit(&self, xid: Xid) -> Result<()> {
            if self.reject_commit {
                return Err(StorageError::TransactionFailed(xid));
            }
            self.events.lock().push(format!("commit {}", xid));
            Ok(())
        }

        fn on_abort(&self, xid: Xid) -> Result<()> {
            self.events.lock().push(format!("abort {}", xid));
            Ok(())
        }

        fn on_finish(&self, xid: Xid, state: TransactionState) {
            self.events.lock().push(format!("finish {} {:?}", xid, state));
        }
    }

    #[test]
    fn test_begin_commit_abort() {
        let (_dir, tm) = manager();
        let a = tm.begin(IsolationLevel::ReadCommitted).unwrap();
        let b = tm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!((a, b), (1, 2));
        assert!(tm.is_active(a).unwrap());

        tm.commit(a).unwrap();
        tm.abort(b).unwrap();
        assert!(tm.is_committed(a).unwrap());
        assert!(tm.is_aborted(b).unwrap());
        assert!(!tm.is_active(b).unwrap());
    }

    #[test]
    fn test_super_xid() {
        let (_dir, tm) = manager();
        assert!(tm.is_committed(SUPER_XID).unwrap());
        assert!(!tm.is_active(SUPER_XID).unwrap());
        assert!(!tm.is_aborted(SUPER_XID).unwrap());
        assert!(tm.commit(SUPER_XID).is_err());
    }

    #[test]
    fn test_unknown_xid() {
        let (_dir, tm) = manager();
        assert!(matches!(
            tm.state(1),
            Err(StorageError::UnknownTransaction(1))
        ));
        let xid = tm.begin(IsolationLevel::default()).unwrap();
        tm.commit(xid).unwrap();
        // Finished transactions cannot transition again.
        assert!(tm.commit(xid).is_err());
        assert!(tm.abort(xid).is_err());
    }

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xid");
        let tm = TransactionManager::create(&path).unwrap();
        let a = tm.begin(IsolationLevel::ReadCommitted).unwrap();
        let b = tm.begin(IsolationLevel::ReadCommitted).unwrap();
        tm.begin(IsolationLevel::ReadCommitted).unwrap();
        tm.commit(a).unwrap();
        tm.abort(b).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 3, 1, 2, 0]);
    }

    #[test]
    fn test_reopen_keeps_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xid");
        {
            let tm = TransactionManager::create(&path).unwrap();
            let a = tm.begin(IsolationLevel::ReadCommitted).unwrap();
            tm.commit(a).unwrap();
            tm.begin(IsolationLevel::ReadCommitted).unwrap();
        }

        let tm = TransactionManager::open(&path).unwrap();
        assert_eq!(tm.last_xid(), 2);
        assert!(tm.is_committed(1).unwrap());
        assert!(tm.is_active(2).unwrap());
        assert_eq!(tm.begin(IsolationLevel::ReadCommitted).unwrap(), 3);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xid");
        TransactionManager::create(&path).unwrap();
        assert!(TransactionManager::create(&path).is_err());
    }

    #[test]
    fn test_open_rejects_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();

        let short = dir.path().join("short");
        std::fs::write(&short, [0u8; 5]).unwrap();
        assert!(matches!(
            TransactionManager::open(&short),
            Err(StorageError::CorruptXidFile(_))
        ));

        let mismatched = dir.path().join("mismatched");
        let mut bytes = 4u64.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[1, 1]);
        std::fs::write(&mismatched, bytes).unwrap();
        assert!(matches!(
            TransactionManager::open(&mismatched),
            Err(StorageError::CorruptXidFile(_))
        ));
    }

    #[test]
    fn test_observer_order() {
        let (_dir, tm) = manager();
        let recorder = Arc::new(Recorder::default());
        tm.subscribe(recorder.clone());

        let a = tm.begin(IsolationLevel::RepeatableRead).unwrap();
        tm.commit(a).unwrap();
        let b = tm.begin(IsolationLevel::ReadCommitted).unwrap();
        tm.abort(b).unwrap();

        assert_eq!(
            *recorder.events.lock(),
            vec![
                "begin 1 RepeatableRead",
                "commit 1",
                "finish 1 Committed",
                "begin 2 ReadCommitted",
                "abort 2",
                "finish 2 Aborted",
            ]
        );
    }

    #[test]
    fn test_rejected_commit_stays_active() {
        let (_dir, tm) = manager();
        let recorder = Arc::new(Recorder {
            reject_commit: true,
            ..Default::default()
        });
        tm.subscribe(recorder.clone());

        let xid = tm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(matches!(
            tm.commit(xid),
            Err(StorageError::TransactionFailed(_))
        ));
        assert!(tm.is_active(xid).unwrap());
        tm.abort(xid).unwrap();
        assert!(tm.is_aborted(xid).unwrap());
    }

    #[test]
    fn test_unsubscribe() {
        let (_dir, tm) = manager();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn TransactionObserver> = recorder.clone();
        tm.subscribe(Arc::clone(&observer));
        tm.unsubscribe(&observer);

        tm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(recorder.events.lock().is_empty());
    }
}
