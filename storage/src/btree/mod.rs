// storage/src/btree/mod.rs

//! Disk-resident B+Tree mapping keys to record uids.
//!
//! Nodes are ordinary records in a [`DataManager`] and refer to each other
//! only by uid. The uid of the root lives in an 8-byte root slot record so
//! the tree can be reopened; a root split rewrites the slot.
//!
//! Keys are never removed. Deleted rows are filtered above the index.

mod node;

pub use node::{Entry, Node, MAX_KEY_SIZE, NODE_SIZE, ORDER};

use crate::data::DataManager;
use crate::{Result, StorageError, Uid, Value};
use bytes::Buf;
use log::debug;
use parking_lot::RwLock;
use std::cmp::Ordering;

pub struct BPlusTree {
    dm: DataManager,
    root_slot: Uid,
    // Current root uid. Writers hold it exclusively for a whole `add`.
    root: RwLock<Uid>,
    order: usize,
}

impl BPlusTree {
    /// Creates an empty tree: the root slot record first, then an empty leaf.
    pub fn create(dm: DataManager, order: usize) -> Result<Self> {
        Self::check_order(order)?;

        let root_slot = dm.insert(&0u64.to_be_bytes())?;
        let root = Node::leaf(Vec::new(), Vec::new(), 0).insert(&dm)?;
        dm.get(root_slot)?.update(&root.uid().to_be_bytes())?;

        debug!("created tree with root slot {:#x}, root {:#x}", root_slot, root.uid());
        Ok(Self {
            dm,
            root_slot,
            root: RwLock::new(root.uid()),
            order,
        })
    }

    /// Opens a tree whose root uid is stored in `root_slot`.
    pub fn load(dm: DataManager, root_slot: Uid, order: usize) -> Result<Self> {
        Self::check_order(order)?;

        let slot = dm.get(root_slot)?.data()?;
        if slot.len() != 8 {
            return Err(StorageError::CorruptNode {
                uid: root_slot,
                reason: format!("root slot holds {} bytes", slot.len()),
            });
        }
        let root = (&slot[..]).get_u64();
        // Decode once so a bad slot fails here rather than on first use.
        Node::load(&dm, root)?;

        Ok(Self {
            dm,
            root_slot,
            root: RwLock::new(root),
            order,
        })
    }

    fn check_order(order: usize) -> Result<()> {
        if !(3..=ORDER).contains(&order) {
            return Err(StorageError::InvalidConfig(format!(
                "tree order {} outside 3..={}",
                order, ORDER
            )));
        }
        Ok(())
    }

    pub fn root_slot(&self) -> Uid {
        self.root_slot
    }

    pub fn root_uid(&self) -> Uid {
        *self.root.read()
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn max_keys(&self) -> usize {
        self.order - 1
    }

    /// Fill level a non-root node keeps after splits; underflow is never
    /// repaired because keys are never removed.
    pub fn min_keys(&self) -> usize {
        self.order.div_ceil(2) - 1
    }

    /// Maps `key` to `value`, replacing the value if the key exists.
    pub fn add(&self, key: Value, value: Uid) -> Result<()> {
        if key.is_null() {
            return Err(StorageError::NullPrimaryKey);
        }
        let len = key.encoded_len();
        if len > MAX_KEY_SIZE {
            return Err(StorageError::KeyTooLong {
                len,
                max: MAX_KEY_SIZE,
            });
        }

        let mut root = self.root.write();
        if let Some((separator, right)) = self.insert_into(*root, key, value)? {
            let new_root = Node::internal(vec![separator], vec![*root, right], 0).insert(&self.dm)?;
            self.dm
                .get(self.root_slot)?
                .update(&new_root.uid().to_be_bytes())?;
            debug!("root split, new root {:#x}", new_root.uid());
            *root = new_root.uid();
        }
        Ok(())
    }

    // Returns the separator and uid of the new right sibling if `uid` split.
    fn insert_into(&self, uid: Uid, key: Value, value: Uid) -> Result<Option<(Value, Uid)>> {
        let mut node = Node::load(&self.dm, uid)?;

        if node.is_leaf {
            node.upsert(key, value);
        } else {
            let index = node.find_key_index(&key);
            let child = node.children[index];
            match self.insert_into(child, key, value)? {
                Some((separator, right)) => node.insert_child(index, separator, right),
                None => return Ok(None),
            }
        }

        if node.keys.len() > self.max_keys() {
            let split = self.split(&mut node)?;
            node.store(&self.dm)?;
            return Ok(Some(split));
        }
        node.store(&self.dm)?;
        Ok(None)
    }

    /// Moves the upper half of `node` into a new right sibling and returns the
    /// separator with the sibling's uid. `node` itself is not stored.
    fn split(&self, node: &mut Node) -> Result<(Value, Uid)> {
        let (separator, right) = if node.is_leaf {
            let mid = node.keys.len().div_ceil(2);
            let keys = node.keys.split_off(mid);
            let values = node.children.split_off(mid);
            let separator = keys[0].clone();
            (separator, Node::leaf(keys, values, node.sibling))
        } else {
            // Round down here: the separator leaves the node, and the right
            // half must keep at least min_keys for odd orders too. An
            // overflowing node holds `order` keys, so for even orders
            // (the default 400) this equals rounding up.
            let mid = node.keys.len() / 2;
            let mut keys = node.keys.split_off(mid);
            let children = node.children.split_off(mid + 1);
            let separator = keys.remove(0);
            (separator, Node::internal(keys, children, node.sibling))
        };

        let right = right.insert(&self.dm)?;
        node.sibling = right.uid();
        debug!(
            "split node {:#x}: {} keys stay, {} move to {:#x}",
            node.uid,
            node.keys.len(),
            right.keys.len(),
            right.uid()
        );
        Ok((separator, right.uid()))
    }

    /// Value stored for `key`, if any.
    pub fn search(&self, key: &Value) -> Result<Option<Uid>> {
        let root = self.root.read();
        let leaf = self.find_leaf(*root, key)?;
        Ok(leaf.search_leaf(key))
    }

    /// Entries with `from <= key <= to`, in key order.
    pub fn scan(&self, from: &Value, to: &Value) -> Result<Vec<Entry>> {
        let root = self.root.read();
        let mut node = self.find_leaf(*root, from)?;
        let mut entries = Vec::new();

        loop {
            for entry in node.entries() {
                if entry.key.compare(to) == Ordering::Greater {
                    return Ok(entries);
                }
                if entry.key.compare(from) != Ordering::Less {
                    entries.push(entry);
                }
            }
            if node.sibling == 0 {
                return Ok(entries);
            }
            node = Node::load(&self.dm, node.sibling)?;
        }
    }

    /// Every entry in key order, following the leaf chain.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        let root = self.root.read();
        let mut node = Node::load(&self.dm, *root)?;
        while !node.is_leaf {
            node = Node::load(&self.dm, node.children[0])?;
        }

        let mut entries = Vec::new();
        loop {
            entries.extend(node.entries());
            if node.sibling == 0 {
                return Ok(entries);
            }
            node = Node::load(&self.dm, node.sibling)?;
        }
    }

    fn find_leaf(&self, root: Uid, key: &Value) -> Result<Node> {
        let mut node = Node::load(&self.dm, root)?;
        while !node.is_leaf {
            let child = node.children[node.find_key_index(key)];
            node = Node::load(&self.dm, child)?;
        }
        Ok(node)
    }

    /// Walks the whole tree checking ordering, fan-out and fill bounds.
    /// Returns the number of leaf entries.
    pub fn check_invariants(&self) -> Result<usize> {
        let root = self.root.read();
        let mut leaves = Vec::new();
        let count = self.check_node(*root, None, None, true, &mut leaves)?;

        // Leaves in tree order must form the sibling chain, ending in 0.
        for (i, leaf) in leaves.iter().enumerate() {
            let expected = leaves.get(i + 1).copied().unwrap_or(0);
            let sibling = Node::load(&self.dm, *leaf)?.sibling;
            if sibling != expected {
                return Err(StorageError::CorruptNode {
                    uid: *leaf,
                    reason: format!("leaf sibling {:#x}, expected {:#x}", sibling, expected),
                });
            }
        }
        Ok(count)
    }

    fn check_node(
        &self,
        uid: Uid,
        lower: Option<&Value>,
        upper: Option<&Value>,
        is_root: bool,
        leaves: &mut Vec<Uid>,
    ) -> Result<usize> {
        let node = Node::load(&self.dm, uid)?;
        let corrupt = |reason: String| StorageError::CorruptNode { uid, reason };

        if node.keys.len() > self.max_keys() {
            return Err(corrupt(format!("{} keys over the maximum", node.keys.len())));
        }
        if !is_root && node.keys.len() < self.min_keys() {
            return Err(corrupt(format!("{} keys under the minimum", node.keys.len())));
        }
        for pair in node.keys.windows(2) {
            if pair[0].compare(&pair[1]) != Ordering::Less {
                return Err(corrupt(format!("keys {} and {} out of order", pair[0], pair[1])));
            }
        }
        for key in &node.keys {
            let below = lower.is_some_and(|l| key.compare(l) == Ordering::Less);
            let above = upper.is_some_and(|u| key.compare(u) != Ordering::Less);
            if below || above {
                return Err(corrupt(format!("key {} outside its parent's range", key)));
            }
        }

        if node.is_leaf {
            leaves.push(uid);
            return Ok(node.keys.len());
        }

        if node.children.len() != node.keys.len() + 1 {
            return Err(corrupt(format!(
                "{} children for {} keys",
                node.children.len(),
                node.keys.len()
            )));
        }
        let mut count = 0;
        for (i, child) in node.children.iter().enumerate() {
            let lo = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
            let hi = node.keys.get(i).or(upper);
            count += self.check_node(*child, lo, hi, false, leaves)?;
        }
        Ok(count)
    }
}
