mod common;

use pagedb_storage::{IsolationLevel, StorageError, VersionWrap, SUPER_XID};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Barrier};
use std::thread;

const RC: IsolationLevel = IsolationLevel::ReadCommitted;
const RR: IsolationLevel = IsolationLevel::RepeatableRead;

#[test]
fn test_committed_insert_visible_to_later_transactions() {
    let engine = common::setup_engine();
    let vm = engine.version_manager("rows");

    let writer = engine.tm.begin(RC).unwrap();
    let uid = vm.insert(writer, b"hello").unwrap();
    engine.tm.commit(writer).unwrap();

    for level in [RC, RR] {
        let reader = engine.tm.begin(level).unwrap();
        assert_eq!(vm.read(reader, uid).unwrap(), Some(b"hello".to_vec()));
        engine.tm.commit(reader).unwrap();
    }
}

#[test]
fn test_repeatable_read_hides_concurrent_commit() {
    let engine = common::setup_engine();
    let vm = engine.version_manager("rows");

    let writer = engine.tm.begin(RC).unwrap();
    let uid = vm.insert(writer, b"row").unwrap();

    let snapshot_reader = engine.tm.begin(RR).unwrap();
    let rc_reader = engine.tm.begin(RC).unwrap();
    assert_eq!(vm.read(snapshot_reader, uid).unwrap(), None);
    assert_eq!(vm.read(rc_reader, uid).unwrap(), None);

    engine.tm.commit(writer).unwrap();
    assert_eq!(vm.read(snapshot_reader, uid).unwrap(), None);
    assert_eq!(vm.read(rc_reader, uid).unwrap(), Some(b"row".to_vec()));
}

#[test]
fn test_concurrent_deletes_succeed_once() {
    let engine = common::setup_engine();
    let vm = engine.version_manager("rows");
    let uid = vm.insert(SUPER_XID, b"contended").unwrap();

    let xids = [engine.tm.begin(RC).unwrap(), engine.tm.begin(RC).unwrap()];
    let barrier = Arc::new(Barrier::new(xids.len()));
    let handles: Vec<_> = xids
        .into_iter()
        .map(|xid| {
            let vm = Arc::clone(&vm);
            let tm = Arc::clone(&engine.tm);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let deleted = vm.delete(xid, uid).unwrap();
                tm.commit(xid).unwrap();
                deleted
            })
        })
        .collect();

    let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|deleted| **deleted).count(), 1);

    let wrap = VersionWrap::load(vm.data_manager(), uid).unwrap();
    let winner = if results[0] { xids[0] } else { xids[1] };
    assert_eq!(wrap.xmax().unwrap(), winner);
}

#[test]
fn test_repeatable_read_delete_conflict_aborts() {
    let engine = common::setup_engine();
    let vm = engine.version_manager("rows");
    let uid = vm.insert(SUPER_XID, b"row").unwrap();

    let first = engine.tm.begin(RC).unwrap();
    let second = engine.tm.begin(RR).unwrap();
    assert!(vm.delete(first, uid).unwrap());

    let blocked = {
        let vm = Arc::clone(&vm);
        thread::spawn(move || vm.delete(second, uid))
    };
    common::wait_for("second delete to block", || vm.lock_table().waiting(uid) == 1);
    engine.tm.commit(first).unwrap();

    assert!(matches!(
        blocked.join().unwrap(),
        Err(StorageError::ConcurrentUpdate { xid, .. }) if xid == second
    ));
    assert!(matches!(
        engine.tm.commit(second),
        Err(StorageError::TransactionFailed(_))
    ));
    engine.tm.abort(second).unwrap();
    assert!(vm.active_xids().is_empty());
}

#[test]
fn test_waiter_gets_row_after_abort() {
    let engine = common::setup_engine();
    let vm = engine.version_manager("rows");
    let uid = vm.insert(SUPER_XID, b"row").unwrap();

    let first = engine.tm.begin(RC).unwrap();
    let second = engine.tm.begin(RR).unwrap();
    assert!(vm.delete(first, uid).unwrap());

    let blocked = {
        let vm = Arc::clone(&vm);
        thread::spawn(move || vm.delete(second, uid))
    };
    common::wait_for("second delete to block", || vm.lock_table().waiting(uid) == 1);
    engine.tm.abort(first).unwrap();

    assert!(blocked.join().unwrap().unwrap());
    engine.tm.commit(second).unwrap();
    assert_eq!(vm.read(SUPER_XID, uid).unwrap(), None);
}

#[test]
fn test_waiter_chases_committed_update() {
    let engine = common::setup_engine();
    let vm = engine.version_manager("rows");
    let old = vm.insert(SUPER_XID, b"v1").unwrap();

    let updater = engine.tm.begin(RC).unwrap();
    let deleter = engine.tm.begin(RC).unwrap();
    let new = vm.update(updater, old, b"v2").unwrap().unwrap();

    let blocked = {
        let vm = Arc::clone(&vm);
        thread::spawn(move || vm.delete(deleter, old))
    };
    common::wait_for("delete to block", || vm.lock_table().waiting(old) == 1);
    engine.tm.commit(updater).unwrap();

    // The delete lands on the successor the updater created.
    assert!(blocked.join().unwrap().unwrap());
    assert_eq!(vm.lock_table().holder(new), Some(deleter));
    engine.tm.commit(deleter).unwrap();

    let reader = engine.tm.begin(RC).unwrap();
    assert_eq!(vm.read(reader, old).unwrap(), None);
    assert_eq!(vm.read(reader, new).unwrap(), None);
}

#[test]
fn test_repeatable_read_update_conflicts_with_committed_update() {
    let engine = common::setup_engine();
    let vm = engine.version_manager("rows");
    let old = vm.insert(SUPER_XID, b"v1").unwrap();

    let updater = engine.tm.begin(RC).unwrap();
    let snapshot_writer = engine.tm.begin(RR).unwrap();
    let new = vm.update(updater, old, b"v2").unwrap().unwrap();

    let blocked = {
        let vm = Arc::clone(&vm);
        thread::spawn(move || vm.update(snapshot_writer, old, b"v3"))
    };
    common::wait_for("update to block", || vm.lock_table().waiting(old) == 1);
    engine.tm.commit(updater).unwrap();

    // The row it saw was replaced under it; chasing would lose the update.
    assert!(matches!(
        blocked.join().unwrap(),
        Err(StorageError::ConcurrentUpdate { xid, uid }) if xid == snapshot_writer && uid == old
    ));
    assert!(matches!(
        engine.tm.commit(snapshot_writer),
        Err(StorageError::TransactionFailed(_))
    ));
    engine.tm.abort(snapshot_writer).unwrap();

    let reader = engine.tm.begin(RC).unwrap();
    assert_eq!(vm.read(reader, new).unwrap(), Some(b"v2".to_vec()));
    assert_eq!(vm.read(reader, old).unwrap(), None);
}

#[test]
fn test_rejected_commit_publishes_no_remaps() {
    let engine = common::setup_engine();
    let rows = engine.version_manager("rows");
    let other = engine.version_manager("other");
    let old = rows.insert(SUPER_XID, b"v1").unwrap();
    let contended = other.insert(SUPER_XID, b"x").unwrap();

    let updater = engine.tm.begin(RR).unwrap();
    let waiter = engine.tm.begin(RC).unwrap();
    let deleter = engine.tm.begin(RC).unwrap();
    rows.update(updater, old, b"v2").unwrap().unwrap();

    let blocked = {
        let rows = Arc::clone(&rows);
        thread::spawn(move || rows.delete(waiter, old))
    };
    common::wait_for("delete to block", || rows.lock_table().waiting(old) == 1);

    // A later deleter commits first, so the updater fails in the other table.
    assert!(other.delete(deleter, contended).unwrap());
    engine.tm.commit(deleter).unwrap();
    assert!(matches!(
        other.delete(updater, contended),
        Err(StorageError::ConcurrentUpdate { .. })
    ));

    assert!(matches!(
        engine.tm.commit(updater),
        Err(StorageError::TransactionFailed(_))
    ));
    engine.tm.abort(updater).unwrap();

    // The waiter stays on the original row instead of the aborted successor.
    assert!(blocked.join().unwrap().unwrap());
    assert_eq!(rows.lock_table().holder(old), Some(waiter));
    engine.tm.commit(waiter).unwrap();
    assert_eq!(rows.read(SUPER_XID, old).unwrap(), None);
}

#[test]
fn test_deadlock_fails_one_transaction() {
    let engine = common::setup_engine();
    let vm = engine.version_manager("rows");
    let a = vm.insert(SUPER_XID, b"a").unwrap();
    let b = vm.insert(SUPER_XID, b"b").unwrap();

    let first = engine.tm.begin(RC).unwrap();
    let second = engine.tm.begin(RC).unwrap();
    assert!(vm.delete(first, a).unwrap());
    assert!(vm.delete(second, b).unwrap());

    let blocked = {
        let vm = Arc::clone(&vm);
        thread::spawn(move || vm.delete(first, b))
    };
    common::wait_for("first to wait on b", || vm.lock_table().waiting(b) == 1);

    assert!(matches!(
        vm.delete(second, a),
        Err(StorageError::Deadlock { .. })
    ));
    engine.tm.abort(second).unwrap();

    assert!(blocked.join().unwrap().unwrap());
    engine.tm.commit(first).unwrap();
    assert_eq!(vm.read(SUPER_XID, a).unwrap(), None);
    assert_eq!(vm.read(SUPER_XID, b).unwrap(), None);
}

#[test]
fn test_status_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pagedb.xid");
    let (committed, aborted, active) = {
        let tm = pagedb_storage::TransactionManager::create(&path).unwrap();
        let committed = tm.begin(RC).unwrap();
        let aborted = tm.begin(RC).unwrap();
        let active = tm.begin(RR).unwrap();
        tm.commit(committed).unwrap();
        tm.abort(aborted).unwrap();
        (committed, aborted, active)
    };

    let tm = pagedb_storage::TransactionManager::open(&path).unwrap();
    assert!(tm.is_committed(committed).unwrap());
    assert!(tm.is_aborted(aborted).unwrap());
    assert!(tm.is_active(active).unwrap());
    assert!(tm.is_committed(SUPER_XID).unwrap());
    assert_eq!(tm.begin(RC).unwrap(), active + 1);
}
