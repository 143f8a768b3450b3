//! In-memory B-tree store
//!
//! Every tree is identified by its root page number. Table trees map a
//! 64-bit rowid to a record; index trees hold decoded keys ordered under a
//! `KeyInfo`. Positions are expressed as keys, never as slot numbers, so a
//! cursor survives inserts and deletes around it: "next" is always "the
//! first key greater than the one I am on".

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::types::{Pgno, RowId, Value};
use crate::vdbe::ops::KeyInfo;
use crate::vdbe::value::compare_keys;

// ============================================================================
// Index Tree
// ============================================================================

/// Ordered set of index keys
#[derive(Debug, Clone)]
pub struct IndexTree {
    pub key_info: Arc<KeyInfo>,
    entries: Vec<Vec<Value>>,
}

impl IndexTree {
    pub fn new(key_info: Arc<KeyInfo>) -> Self {
        IndexTree {
            key_info,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Compare two keys over their first `n` fields
    pub fn compare(&self, a: &[Value], b: &[Value], n: usize) -> Ordering {
        let ki = &self.key_info;
        compare_keys(a, b, n, |i| ki.collation(i), |i| ki.is_desc(i))
    }

    fn full(&self, a: &[Value], b: &[Value]) -> Ordering {
        self.compare(a, b, a.len().max(b.len()))
    }

    /// Insert `key`, replacing an entry that compares equal on every field
    pub fn insert(&mut self, key: Vec<Value>) {
        let pos = self.entries.partition_point(|e| self.full(e, &key) == Ordering::Less);
        if pos < self.entries.len() && self.full(&self.entries[pos], &key) == Ordering::Equal {
            self.entries[pos] = key;
        } else {
            self.entries.insert(pos, key);
        }
    }

    /// Remove the entry equal to `key` on its first `key.len()` fields
    pub fn delete(&mut self, key: &[Value]) -> bool {
        let n = key.len();
        let pos = self.entries.partition_point(|e| self.compare(e, key, n) == Ordering::Less);
        if pos < self.entries.len() && self.compare(&self.entries[pos], key, n) == Ordering::Equal {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn first(&self) -> Option<&Vec<Value>> {
        self.entries.first()
    }

    pub fn last(&self) -> Option<&Vec<Value>> {
        self.entries.last()
    }

    /// Smallest entry strictly greater than `key` (full comparison)
    pub fn next_after(&self, key: &[Value]) -> Option<&Vec<Value>> {
        let pos = self.entries.partition_point(|e| self.full(e, key) != Ordering::Greater);
        self.entries.get(pos)
    }

    /// Largest entry strictly less than `key` (full comparison)
    pub fn prev_before(&self, key: &[Value]) -> Option<&Vec<Value>> {
        let pos = self.entries.partition_point(|e| self.full(e, key) == Ordering::Less);
        if pos == 0 {
            None
        } else {
            self.entries.get(pos - 1)
        }
    }

    /// First entry whose `probe.len()`-field prefix is >= probe (or > when `strict`)
    pub fn seek_ge(&self, probe: &[Value], strict: bool) -> Option<&Vec<Value>> {
        let n = probe.len();
        let pos = self.entries.partition_point(|e| {
            let c = self.compare(e, probe, n);
            c == Ordering::Less || (strict && c == Ordering::Equal)
        });
        self.entries.get(pos)
    }

    /// Last entry whose prefix is <= probe (or < when `strict`)
    pub fn seek_le(&self, probe: &[Value], strict: bool) -> Option<&Vec<Value>> {
        let n = probe.len();
        let pos = self.entries.partition_point(|e| {
            let c = self.compare(e, probe, n);
            c == Ordering::Less || (!strict && c == Ordering::Equal)
        });
        if pos == 0 {
            None
        } else {
            self.entries.get(pos - 1)
        }
    }

    /// Whether some entry matches `probe` on its leading fields
    pub fn contains_prefix(&self, probe: &[Value]) -> Option<&Vec<Value>> {
        self.seek_ge(probe, false)
            .filter(|e| self.compare(e, probe, probe.len()) == Ordering::Equal)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vec<Value>> {
        self.entries.iter()
    }
}

// ============================================================================
// Btree
// ============================================================================

/// A single tree
#[derive(Debug, Clone)]
pub enum Tree {
    Table(BTreeMap<RowId, Vec<u8>>),
    Index(IndexTree),
}

impl Tree {
    pub fn len(&self) -> usize {
        match self {
            Tree::Table(t) => t.len(),
            Tree::Index(i) => i.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collection of trees keyed by root page
#[derive(Debug, Clone, Default)]
pub struct Btree {
    trees: HashMap<Pgno, Tree>,
}

fn no_tree(root: Pgno) -> Error {
    Error::with_message(ErrorCode::Corrupt, format!("no b-tree at root page {}", root))
}

impl Btree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&mut self, root: Pgno) {
        self.trees.insert(root, Tree::Table(BTreeMap::new()));
    }

    pub fn create_index(&mut self, root: Pgno, key_info: Arc<KeyInfo>) {
        self.trees.insert(root, Tree::Index(IndexTree::new(key_info)));
    }

    pub fn drop_tree(&mut self, root: Pgno) {
        self.trees.remove(&root);
    }

    pub fn exists(&self, root: Pgno) -> bool {
        self.trees.contains_key(&root)
    }

    /// Remove every entry of a tree, returning how many there were
    pub fn clear(&mut self, root: Pgno) -> Result<usize> {
        match self.trees.get_mut(&root) {
            Some(Tree::Table(t)) => {
                let n = t.len();
                t.clear();
                Ok(n)
            }
            Some(Tree::Index(i)) => {
                let n = i.len();
                i.clear();
                Ok(n)
            }
            None => Err(no_tree(root)),
        }
    }

    pub fn tree(&self, root: Pgno) -> Result<&Tree> {
        self.trees.get(&root).ok_or_else(|| no_tree(root))
    }

    pub fn table(&self, root: Pgno) -> Result<&BTreeMap<RowId, Vec<u8>>> {
        match self.trees.get(&root) {
            Some(Tree::Table(t)) => Ok(t),
            _ => Err(no_tree(root)),
        }
    }

    pub fn table_mut(&mut self, root: Pgno) -> Result<&mut BTreeMap<RowId, Vec<u8>>> {
        match self.trees.get_mut(&root) {
            Some(Tree::Table(t)) => Ok(t),
            _ => Err(no_tree(root)),
        }
    }

    pub fn index(&self, root: Pgno) -> Result<&IndexTree> {
        match self.trees.get(&root) {
            Some(Tree::Index(i)) => Ok(i),
            _ => Err(no_tree(root)),
        }
    }

    pub fn index_mut(&mut self, root: Pgno) -> Result<&mut IndexTree> {
        match self.trees.get_mut(&root) {
            Some(Tree::Index(i)) => Ok(i),
            _ => Err(no_tree(root)),
        }
    }
}

/// Smallest rowid strictly greater than `after` (or the first when `None`)
pub fn table_next(t: &BTreeMap<RowId, Vec<u8>>, after: Option<RowId>) -> Option<RowId> {
    match after {
        None => t.keys().next().copied(),
        Some(r) => t.range((Bound::Excluded(r), Bound::Unbounded)).next().map(|(k, _)| *k),
    }
}

/// Largest rowid strictly less than `before` (or the last when `None`)
pub fn table_prev(t: &BTreeMap<RowId, Vec<u8>>, before: Option<RowId>) -> Option<RowId> {
    match before {
        None => t.keys().next_back().copied(),
        Some(r) => t.range(..r).next_back().map(|(k, _)| *k),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(v: &[i64]) -> Vec<Value> {
        v.iter().map(|i| Value::Integer(*i)).collect()
    }

    #[test]
    fn test_index_insert_keeps_order_and_replaces_equal() {
        let mut t = IndexTree::new(Arc::new(KeyInfo::new(2)));
        t.insert(ints(&[3, 1]));
        t.insert(ints(&[1, 2]));
        t.insert(ints(&[2, 3]));
        t.insert(ints(&[1, 2]));
        let keys: Vec<_> = t.iter().map(|k| k[0].to_i64()).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_index_seek_and_step() {
        let mut t = IndexTree::new(Arc::new(KeyInfo::new(2)));
        for (a, r) in [(10, 1), (20, 2), (20, 3), (30, 4)] {
            t.insert(ints(&[a, r]));
        }
        assert_eq!(t.seek_ge(&ints(&[20]), false).unwrap()[1], Value::Integer(2));
        assert_eq!(t.seek_ge(&ints(&[20]), true).unwrap()[0], Value::Integer(30));
        assert_eq!(t.seek_le(&ints(&[20]), false).unwrap()[1], Value::Integer(3));
        assert_eq!(t.seek_le(&ints(&[20]), true).unwrap()[0], Value::Integer(10));
        let cur = ints(&[20, 2]);
        assert_eq!(t.next_after(&cur).unwrap()[1], Value::Integer(3));
        assert_eq!(t.prev_before(&cur).unwrap()[0], Value::Integer(10));
    }

    #[test]
    fn test_cursor_position_survives_delete() {
        let mut t = IndexTree::new(Arc::new(KeyInfo::new(1)));
        for i in 1..=4 {
            t.insert(ints(&[i]));
        }
        let cur = ints(&[2]);
        assert!(t.delete(&cur));
        assert_eq!(t.next_after(&cur).unwrap()[0], Value::Integer(3));
    }

    #[test]
    fn test_desc_key_order() {
        let mut ki = KeyInfo::new(1);
        ki.sort_orders[0] = true;
        let mut t = IndexTree::new(Arc::new(ki));
        for i in 1..=3 {
            t.insert(ints(&[i]));
        }
        assert_eq!(t.first().unwrap()[0], Value::Integer(3));
    }

    #[test]
    fn test_table_navigation() {
        let mut b = Btree::new();
        b.create_table(2);
        let t = b.table_mut(2).unwrap();
        t.insert(5, vec![]);
        t.insert(9, vec![]);
        let t = b.table(2).unwrap();
        assert_eq!(table_next(t, None), Some(5));
        assert_eq!(table_next(t, Some(5)), Some(9));
        assert_eq!(table_prev(t, Some(9)), Some(5));
        assert_eq!(table_prev(t, None), Some(9));
        assert_eq!(b.clear(2).unwrap(), 2);
    }
}
