// storage/src/btree/node.rs

use crate::data::{DataManager, ENVELOPE_SIZE};
use crate::page::{HEADER_SIZE, PAGE_SIZE};
use crate::{Result, StorageError, Uid, Value};
use bytes::{Buf, BufMut};
use std::cmp::Ordering;

/// Default order: at most 400 children, 399 keys per node.
pub const ORDER: usize = 400;

/// Largest encoded key (type tag included) an index accepts.
pub const MAX_KEY_SIZE: usize = 32;

/// Every node record is padded to this size so it fills exactly one page and
/// can be rewritten in place.
pub const NODE_SIZE: usize = PAGE_SIZE - HEADER_SIZE - ENVELOPE_SIZE;

const IS_LEAF_OFFSET: usize = 0;
const KEY_COUNT_OFFSET: usize = 1;
const SIBLING_OFFSET: usize = 5;
const KEYS_OFFSET: usize = 13;

/// A key and the record uid it maps to.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: Value,
    pub value: Uid,
}

/// Decoded B+Tree node.
///
/// Leaves hold one value uid per key. Internal nodes hold one more child uid
/// than keys; child `i` covers keys below `keys[i]`, the last child the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) uid: Uid,
    pub(crate) is_leaf: bool,
    pub(crate) sibling: Uid,
    pub(crate) keys: Vec<Value>,
    pub(crate) children: Vec<Uid>,
}

impl Node {
    pub fn leaf(keys: Vec<Value>, values: Vec<Uid>, sibling: Uid) -> Self {
        Self {
            uid: 0,
            is_leaf: true,
            sibling,
            keys,
            children: values,
        }
    }

    pub fn internal(keys: Vec<Value>, children: Vec<Uid>, sibling: Uid) -> Self {
        Self {
            uid: 0,
            is_leaf: false,
            sibling,
            keys,
            children,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn sibling(&self) -> Uid {
        self.sibling
    }

    pub fn keys(&self) -> &[Value] {
        &self.keys
    }

    pub fn children(&self) -> &[Uid] {
        &self.children
    }

    pub fn load(dm: &DataManager, uid: Uid) -> Result<Self> {
        let item = dm.get(uid)?;
        let data = item.data()?;
        Self::decode(uid, &data)
    }

    /// Writes a new node record and returns the node with its uid set.
    pub fn insert(mut self, dm: &DataManager) -> Result<Self> {
        let encoded = self.encode()?;
        self.uid = dm.insert(&encoded)?;
        Ok(self)
    }

    /// Rewrites this node's record in place.
    pub fn store(&self, dm: &DataManager) -> Result<()> {
        let encoded = self.encode()?;
        dm.get(self.uid)?.update(&encoded)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(NODE_SIZE);
        buf.put_u8(u8::from(self.is_leaf));
        buf.put_u32(self.keys.len() as u32);
        buf.put_u64(self.sibling);
        for key in &self.keys {
            key.encode(&mut buf);
        }
        for child in &self.children {
            buf.put_u64(*child);
        }

        if buf.len() > NODE_SIZE {
            return Err(StorageError::CorruptNode {
                uid: self.uid,
                reason: format!("encoded node of {} bytes exceeds {}", buf.len(), NODE_SIZE),
            });
        }
        buf.resize(NODE_SIZE, 0);
        Ok(buf)
    }

    pub fn decode(uid: Uid, data: &[u8]) -> Result<Self> {
        let corrupt = |reason: String| StorageError::CorruptNode { uid, reason };

        if data.len() < KEYS_OFFSET {
            return Err(corrupt(format!("{} bytes is shorter than a node header", data.len())));
        }
        let is_leaf = match data[IS_LEAF_OFFSET] {
            0 => false,
            1 => true,
            other => return Err(corrupt(format!("leaf flag {}", other))),
        };
        let key_count = (&data[KEY_COUNT_OFFSET..SIBLING_OFFSET]).get_u32() as usize;
        let sibling = (&data[SIBLING_OFFSET..KEYS_OFFSET]).get_u64();

        let mut buf = &data[KEYS_OFFSET..];
        // Each key takes at least its 4-byte type tag.
        if key_count > buf.remaining() / 4 {
            return Err(corrupt(format!("key count {} cannot fit", key_count)));
        }
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let key = Value::decode(&mut buf).map_err(|e| corrupt(e.to_string()))?;
            keys.push(key);
        }

        let child_count = if is_leaf { key_count } else { key_count + 1 };
        if buf.remaining() < child_count * 8 {
            return Err(corrupt(format!(
                "{} children need {} bytes, {} left",
                child_count,
                child_count * 8,
                buf.remaining()
            )));
        }
        let children = (0..child_count).map(|_| buf.get_u64()).collect();

        Ok(Self {
            uid,
            is_leaf,
            sibling,
            keys,
            children,
        })
    }

    /// Number of keys less than or equal to `key`: the index of the child
    /// an internal node routes `key` to.
    pub fn find_key_index(&self, key: &Value) -> usize {
        self.keys
            .partition_point(|k| k.compare(key) != Ordering::Greater)
    }

    /// Exact-match lookup in a leaf.
    pub fn search_leaf(&self, key: &Value) -> Option<Uid> {
        self.locate(key).ok().map(|i| self.children[i])
    }

    /// Inserts into a leaf in key order, replacing the value of an existing key.
    pub fn upsert(&mut self, key: Value, value: Uid) {
        match self.locate(&key) {
            Ok(i) => self.children[i] = value,
            Err(i) => {
                self.keys.insert(i, key);
                self.children.insert(i, value);
            }
        }
    }

    /// Adds the separator and right half produced by splitting child `index`.
    pub fn insert_child(&mut self, index: usize, separator: Value, child: Uid) {
        self.keys.insert(index, separator);
        self.children.insert(index + 1, child);
    }

    pub fn entries(&self) -> impl Iterator<Item = Entry> + '_ {
        self.keys
            .iter()
            .zip(&self.children)
            .map(|(key, value)| Entry {
                key: key.clone(),
                value: *value,
            })
    }

    fn locate(&self, key: &Value) -> std::result::Result<usize, usize> {
        self.keys.binary_search_by(|k| k.compare(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn longs(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Long(*v)).collect()
    }

    #[test]
    fn test_encode_layout() {
        let node = Node::leaf(longs(&[7]), vec![0xAA], 0x1122);
        let bytes = node.encode().unwrap();

        assert_eq!(bytes.len(), NODE_SIZE);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 1]);
        assert_eq!(&bytes[5..13], &0x1122u64.to_be_bytes());
        // LONG tag then the value, then the value uid.
        assert_eq!(&bytes[13..17], &5i32.to_be_bytes());
        assert_eq!(&bytes[17..25], &7i64.to_be_bytes());
        assert_eq!(&bytes[25..33], &0xAAu64.to_be_bytes());
    }

    #[test]
    fn test_decode_round_trip() {
        let keys = vec![
            Value::Long(1),
            Value::String("m".into()),
            Value::Int(-3),
        ];
        let node = Node::internal(keys, vec![10, 20, 30, 40], 99);
        let decoded = Node::decode(5, &node.encode().unwrap()).unwrap();

        assert_eq!(decoded.uid(), 5);
        assert!(!decoded.is_leaf());
        assert_eq!(decoded.sibling(), 99);
        assert_eq!(decoded.keys(), node.keys());
        assert_eq!(decoded.children(), &[10, 20, 30, 40]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut bytes = Node::leaf(vec![], vec![], 0).encode().unwrap();
        bytes[0] = 7;
        assert!(matches!(
            Node::decode(1, &bytes),
            Err(StorageError::CorruptNode { uid: 1, .. })
        ));

        let mut bytes = Node::leaf(vec![], vec![], 0).encode().unwrap();
        bytes[1..5].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(Node::decode(1, &bytes).is_err());

        assert!(Node::decode(1, &[1, 0, 0]).is_err());
    }

    #[test]
    fn test_find_key_index_counts_keys_le() {
        let node = Node::internal(longs(&[10, 20, 30]), vec![1, 2, 3, 4], 0);
        assert_eq!(node.find_key_index(&Value::Long(5)), 0);
        assert_eq!(node.find_key_index(&Value::Long(10)), 1);
        assert_eq!(node.find_key_index(&Value::Long(25)), 2);
        assert_eq!(node.find_key_index(&Value::Long(30)), 3);
        assert_eq!(node.find_key_index(&Value::Long(99)), 3);
    }

    #[test]
    fn test_upsert_keeps_order() {
        let mut node = Node::leaf(vec![], vec![], 0);
        node.upsert(Value::Long(3), 30);
        node.upsert(Value::Long(1), 10);
        node.upsert(Value::Long(2), 20);
        node.upsert(Value::Long(1), 11);

        assert_eq!(node.keys(), longs(&[1, 2, 3]).as_slice());
        assert_eq!(node.children(), &[11, 20, 30]);
        assert_eq!(node.search_leaf(&Value::Long(2)), Some(20));
        assert_eq!(node.search_leaf(&Value::Long(4)), None);
    }

    #[test]
    fn test_full_node_fits() {
        let keys: Vec<Value> = (0..ORDER as i64 - 1)
            .map(|i| Value::String(format!("{:0>24}", i)))
            .collect();
        assert!(keys.iter().all(|k| k.encoded_len() <= MAX_KEY_SIZE));
        let node = Node::internal(keys, (0..ORDER as u64).collect(), 0);
        assert!(node.encode().is_ok());
    }
}
