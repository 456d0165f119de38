// storage/src/table/mod.rs

//! Primary-key tables over the index and the version store.
//!
//! A table owns one file holding both its B+Tree and its row versions. The
//! index maps each key to the newest version stored for it. Every stored row
//! starts with the uid of the version it replaced, so a reader that cannot
//! see the newest version walks back to the one its snapshot allows:
//!
//! ```text
//! [previous uid:8][value 0][value 1]...
//! ```
//!
//! Keys are never removed from the index; a deleted row is a key whose
//! versions are all invisible.

use crate::btree::{BPlusTree, MAX_KEY_SIZE};
use crate::config::EngineConfig;
use crate::data::DataManager;
use crate::page::HEADER_SIZE;
use crate::transaction::{TransactionManager, TransactionObserver};
use crate::version::VersionManager;
use crate::{uid_of, Result, StorageError, Uid, Value, ValueType, Xid};
use bytes::{Buf, BufMut};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The root slot is the first record written to a table file.
pub const ROOT_SLOT_UID: Uid = uid_of(1, HEADER_SIZE as u32);

const PREVIOUS_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value_type: ValueType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl Column {
    /// A nullable, non-key column.
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            nullable: true,
            primary_key: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn set(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        for value in &self.values {
            value.encode(out);
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.values.iter().map(Value::encoded_len).sum()
    }

    /// Decodes one value per column. Trailing bytes are an error.
    pub fn decode(mut buf: &[u8], columns: &[Column]) -> Result<Self> {
        let mut values = Vec::with_capacity(columns.len());
        for _ in columns {
            values.push(Value::decode(&mut buf)?);
        }
        if buf.has_remaining() {
            return Err(StorageError::InvalidRecord {
                uid: 0,
                reason: format!("{} trailing bytes after row", buf.remaining()),
            });
        }
        Ok(Self { values })
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

pub struct Table {
    name: String,
    columns: Vec<Column>,
    key_index: usize,
    dm: DataManager,
    tree: BPlusTree,
    vm: Arc<VersionManager>,
    tm: Arc<TransactionManager>,
}

impl Table {
    /// Creates `{data_dir}/{name}.idb`; fails if it already exists.
    pub fn create(
        config: &EngineConfig,
        name: &str,
        columns: Vec<Column>,
        tm: &Arc<TransactionManager>,
    ) -> Result<Self> {
        let key_index = key_column(&columns)?;
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.table_path(name);
        let dm = DataManager::create(&path)?;
        let tree = BPlusTree::create(dm.clone(), config.btree_order)?;
        if tree.root_slot() != ROOT_SLOT_UID {
            return Err(StorageError::CorruptNode {
                uid: tree.root_slot(),
                reason: format!("root slot must be the first record ({:#x})", ROOT_SLOT_UID),
            });
        }

        info!("created table {} at {}", name, path.display());
        Ok(Self::assemble(name, columns, key_index, dm, tree, tm))
    }

    /// Opens an existing table file. `columns` must match the ones it was
    /// created with.
    pub fn open(
        config: &EngineConfig,
        name: &str,
        columns: Vec<Column>,
        tm: &Arc<TransactionManager>,
    ) -> Result<Self> {
        let key_index = key_column(&columns)?;
        let path = config.table_path(name);
        let dm = DataManager::open(&path)?;
        let tree = BPlusTree::load(dm.clone(), ROOT_SLOT_UID, config.btree_order)?;

        info!("opened table {} at {}", name, path.display());
        Ok(Self::assemble(name, columns, key_index, dm, tree, tm))
    }

    fn assemble(
        name: &str,
        columns: Vec<Column>,
        key_index: usize,
        dm: DataManager,
        tree: BPlusTree,
        tm: &Arc<TransactionManager>,
    ) -> Self {
        let vm = VersionManager::attach(dm.clone(), tm);
        Self {
            name: name.to_string(),
            columns,
            key_index,
            dm,
            tree,
            vm,
            tm: Arc::clone(tm),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key(&self) -> &Column {
        &self.columns[self.key_index]
    }

    pub fn index(&self) -> &BPlusTree {
        &self.tree
    }

    pub fn version_manager(&self) -> &Arc<VersionManager> {
        &self.vm
    }

    /// Inserts `row` under `xid` and returns the uid of its version.
    pub fn insert(&self, xid: Xid, row: Row) -> Result<Uid> {
        let key = self.key_of(&row)?.clone();
        if key.is_null() {
            return Err(StorageError::NullPrimaryKey);
        }
        self.check_row(&row)?;
        let len = key.encoded_len();
        if len > MAX_KEY_SIZE {
            return Err(StorageError::KeyTooLong {
                len,
                max: MAX_KEY_SIZE,
            });
        }

        let head = self.tree.search(&key)?;
        if let Some(uid) = head {
            if self.find_visible(xid, uid)?.is_some() {
                return Err(StorageError::DuplicateKey(key));
            }
        }

        let uid = self.vm.insert(xid, &self.stored(head.unwrap_or(0), &row))?;
        self.tree.add(key, uid)?;
        Ok(uid)
    }

    /// The row stored under `key` as `xid` sees it.
    pub fn select(&self, xid: Xid, key: &Value) -> Result<Option<Row>> {
        match self.tree.search(key)? {
            Some(head) => Ok(self.find_visible(xid, head)?.map(|(_, row)| row)),
            None => Ok(None),
        }
    }

    /// Deletes the row under `key`. False if `xid` sees no such row.
    pub fn delete(&self, xid: Xid, key: &Value) -> Result<bool> {
        let head = match self.tree.search(key)? {
            Some(head) => head,
            None => return Ok(false),
        };
        match self.find_visible(xid, head)? {
            Some((uid, _)) => self.vm.delete(xid, uid),
            None => Ok(false),
        }
    }

    /// Overwrites the stored row with the non-null values of `row`, located by
    /// its primary key. False if `xid` sees no such row.
    pub fn update(&self, xid: Xid, row: Row) -> Result<bool> {
        let key = self.key_of(&row)?.clone();
        if key.is_null() {
            return Err(StorageError::MissingPrimaryKey);
        }
        let head = match self.tree.search(&key)? {
            Some(head) => head,
            None => return Ok(false),
        };
        let uid = match self.find_visible(xid, head)? {
            Some((uid, _)) => uid,
            None => return Ok(false),
        };

        let new = self.vm.update_with(xid, uid, |replaced, stored| {
            let (_, mut merged) = self.split_stored(stored)?;
            for (index, value) in row.values().iter().enumerate() {
                if !value.is_null() {
                    merged.set(index, value.clone());
                }
            }
            self.check_row(&merged)?;
            Ok(self.stored(replaced, &merged))
        })?;

        match new {
            Some(new) => {
                self.tree.add(key, new)?;
                debug!("table {}: row {:#x} replaced by {:#x}", self.name, uid, new);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rows with keys in `from..=to`, in key order.
    pub fn scan(&self, xid: Xid, from: &Value, to: &Value) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for entry in self.tree.scan(from, to)? {
            if let Some((_, row)) = self.find_visible(xid, entry.value)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Detaches from the transaction manager, wakes blocked writers and
    /// flushes the file.
    pub fn close(&self) -> Result<()> {
        let observer: Arc<dyn TransactionObserver> = self.vm.clone();
        self.tm.unsubscribe(&observer);
        self.vm.close();
        self.dm.close()?;
        info!("closed table {}", self.name);
        Ok(())
    }

    fn key_of<'a>(&self, row: &'a Row) -> Result<&'a Value> {
        row.get(self.key_index).ok_or(StorageError::ColumnCount {
            expected: self.columns.len(),
            actual: row.len(),
        })
    }

    fn check_row(&self, row: &Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(StorageError::ColumnCount {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        for (column, value) in self.columns.iter().zip(row.values()) {
            if value.is_null() {
                if !column.nullable {
                    return Err(StorageError::NullColumn(column.name.clone()));
                }
            } else if !value.type_compatible(column.value_type) {
                return Err(StorageError::TypeMismatch {
                    column: column.name.clone(),
                    expected: column.value_type,
                    actual: value.clone(),
                });
            }
        }
        Ok(())
    }

    fn stored(&self, previous: Uid, row: &Row) -> Vec<u8> {
        let mut raw = Vec::with_capacity(PREVIOUS_LEN + row.encoded_len());
        raw.put_u64(previous);
        row.encode(&mut raw);
        raw
    }

    fn split_stored(&self, raw: &[u8]) -> Result<(Uid, Row)> {
        if raw.len() < PREVIOUS_LEN {
            return Err(StorageError::InvalidRecord {
                uid: 0,
                reason: format!("{} bytes is too short for a row", raw.len()),
            });
        }
        let (mut previous, row) = raw.split_at(PREVIOUS_LEN);
        Ok((previous.get_u64(), Row::decode(row, &self.columns)?))
    }

    // Walks from the newest version of a key to the first one `xid` sees.
    fn find_visible(&self, xid: Xid, head: Uid) -> Result<Option<(Uid, Row)>> {
        let mut uid = head;
        loop {
            let version = match self.vm.read_version(xid, uid)? {
                Some(version) => version,
                None => return Ok(None),
            };
            let (previous, row) = self.split_stored(&version.data)?;
            if version.visible {
                return Ok(Some((uid, row)));
            }
            if previous == 0 {
                return Ok(None);
            }
            uid = previous;
        }
    }
}

fn key_column(columns: &[Column]) -> Result<usize> {
    let mut keys = columns
        .iter()
        .enumerate()
        .filter(|(_, column)| column.primary_key);
    match (keys.next(), keys.next()) {
        (Some((index, _)), None) => Ok(index),
        _ => Err(StorageError::MissingPrimaryKey),
    }
}
