//! Storage engine for pagedb
//!
//! This crate provides the lower half of a relational engine: fixed-size
//! pages behind a reference-counted cache, addressable records, a disk
//! resident B+Tree primary index, a durable transaction status log and
//! snapshot isolated (MVCC) row versions.
//!
//! Records are addressed by a 64-bit uid, `(page_no << 32) | offset`.
//! Index nodes and row versions share one page store.

pub mod btree;
pub mod cache;
pub mod config;
pub mod data;
pub mod file;
pub mod page;
pub mod table;
pub mod transaction;
pub mod version;

pub use btree::{BPlusTree, Entry};
pub use config::EngineConfig;
pub use data::{DataItem, DataItemRef, DataManager};
pub use page::{Page, PageCache, PageHandle, PageIndex, PageInfo, PAGE_SIZE};
pub use table::{Column, Row, Table};
pub use transaction::{
    IsolationLevel, TransactionManager, TransactionObserver, TransactionState,
    TransactionStatus, XidLog, SUPER_XID,
};
pub use version::{RowVersion, Transaction, VersionManager, VersionWrap};

pub use pagedb_core::{Value, ValueError, ValueType};

use thiserror::Error;

/// Page number; the first page of a file is page 1.
pub type PageNo = u32;

/// Record address: page number in the high 32 bits, in-page offset in the low 32.
pub type Uid = u64;

/// Transaction id. 0 is the always-committed super transaction.
pub type Xid = u64;

pub const fn uid_of(page_no: PageNo, offset: u32) -> Uid {
    ((page_no as u64) << 32) | offset as u64
}

pub fn split_uid(uid: Uid) -> (PageNo, u32) {
    ((uid >> 32) as PageNo, (uid & 0xffff_ffff) as u32)
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page {0} not found")]
    PageNotFound(PageNo),

    #[error("Page {page_no} is full: need {needed} bytes, have {available}")]
    PageFull {
        page_no: PageNo,
        needed: usize,
        available: usize,
    },

    #[error("Page {page_no} is corrupt: {reason}")]
    CorruptPage { page_no: PageNo, reason: String },

    #[error("Invalid record {uid:#x}: {reason}")]
    InvalidRecord { uid: Uid, reason: String },

    #[error("Record of {len} bytes exceeds the maximum of {max}")]
    RecordTooLarge { len: usize, max: usize },

    #[error("Node {uid:#x} is corrupt: {reason}")]
    CorruptNode { uid: Uid, reason: String },

    #[error("Key too long: {len} bytes exceeds maximum {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("Transaction status file is corrupt: {0}")]
    CorruptXidFile(String),

    #[error("Transaction {0} is unknown")]
    UnknownTransaction(Xid),

    #[error("Transaction {0} has failed and must be aborted")]
    TransactionFailed(Xid),

    #[error("Concurrent update detected on record {uid:#x} by transaction {xid}")]
    ConcurrentUpdate { xid: Xid, uid: Uid },

    #[error("Deadlock detected: transaction {xid} waiting on record {uid:#x}")]
    Deadlock { xid: Xid, uid: Uid },

    #[error("The super transaction cannot delete or update records")]
    SuperTransactionWrite,

    #[error("Primary key is null or missing")]
    NullPrimaryKey,

    #[error("Duplicate primary key {0}")]
    DuplicateKey(Value),

    #[error("Table has no primary key column")]
    MissingPrimaryKey,

    #[error("Column {column} expects {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: ValueType,
        actual: Value,
    },

    #[error("Column {0} cannot be null")]
    NullColumn(String),

    #[error("Row has {actual} values, table has {expected} columns")]
    ColumnCount { expected: usize, actual: usize },

    #[error("Cache is closed")]
    CacheClosed,

    #[error("Lock table is closed")]
    LockTableClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Value error: {0}")]
    Value(#[from] ValueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
