//! In-memory, multi-valued B+Tree secondary index.
//!
//! Each indexed column value (`i64` key) maps to a bucket of RIDs — every
//! row currently carrying that value — rather than a single record. Splits
//! and merges operate on whole nodes owned by their parent; there is no
//! on-disk representation, so a table rebuilds its indexes by scanning on
//! open rather than loading a persisted tree.

mod node;
#[cfg(test)]
mod tests;

use node::{Arena, DeleteOutcome, InsertOutcome, Node, NodeId};

use common::Rid;

/// A secondary index over one column of a table.
///
/// Nodes live in an `Arena` rather than an owned `Box` tree so that leaves
/// can carry a `next` link to their right sibling — `range`/`bulk_search`
/// descend to the starting leaf once and then walk that chain, rather than
/// re-entering the tree from the root for every leaf in the span.
#[derive(Debug)]
pub struct BPlusTree {
    arena: Arena,
    root: NodeId,
    max_node_size: usize,
}

impl BPlusTree {
    pub const DEFAULT_MAX_NODE_SIZE: usize = 16;

    pub fn new(max_node_size: usize) -> Self {
        let mut arena = Arena::new();
        let root = arena.alloc(Node::new_leaf());
        Self { arena, root, max_node_size }
    }

    /// Records that `rid` now carries `key` in the indexed column.
    pub fn insert(&mut self, key: i64, rid: Rid) {
        match self.arena.insert(self.root, key, rid, self.max_node_size) {
            InsertOutcome::Absorbed => {}
            InsertOutcome::Split { split_key, right } => {
                let left = self.root;
                self.root = self.arena.alloc(Node::Internal {
                    keys: vec![split_key],
                    children: vec![left, right],
                });
            }
        }
    }

    /// All RIDs currently carrying `key`.
    pub fn search(&self, key: i64) -> Vec<Rid> {
        self.arena.search(self.root, key)
    }

    /// All `(key, rids)` pairs in `[low, high]` (either bound `None` for
    /// unbounded), in ascending key order. Descends to the starting leaf
    /// once, then walks leaf `next` links rather than recursing through
    /// the whole tree.
    pub fn range(&self, low: Option<i64>, high: Option<i64>) -> Vec<(i64, Vec<Rid>)> {
        let mut out = Vec::new();
        self.arena.range(self.root, low, high, &mut out);
        out
    }

    /// Every RID in `[low, high]`, flattened and in ascending key order.
    pub fn bulk_search(&self, low: Option<i64>, high: Option<i64>) -> Vec<Rid> {
        self.range(low, high)
            .into_iter()
            .flat_map(|(_, rids)| rids)
            .collect()
    }

    /// Sum of the indexed column's values over `[low, high]`, counting each
    /// RID in a key's bucket once.
    pub fn sum_range(&self, low: i64, high: i64) -> i64 {
        self.range(Some(low), Some(high))
            .into_iter()
            .map(|(key, rids)| key * rids.len() as i64)
            .sum()
    }

    /// The indexed value currently held by `rid`, found by a linear scan of
    /// every leaf. Used to resolve deletes/updates that know only the RID.
    pub fn find_by_rid(&self, rid: Rid) -> Option<i64> {
        self.arena.find_by_rid(self.root, rid)
    }

    /// Removes `rid` from `key`'s bucket. Returns whether the pair was
    /// present.
    pub fn remove(&mut self, key: i64, rid: Rid) -> bool {
        match self.arena.remove(self.root, key, rid, self.max_node_size) {
            DeleteOutcome::Ok { found } | DeleteOutcome::Underflow { found } => {
                self.collapse_root_if_needed();
                found
            }
        }
    }

    /// After a delete, an internal root with a single child is replaced by
    /// that child, shrinking the tree's height.
    fn collapse_root_if_needed(&mut self) {
        let only_child = match self.arena.get(self.root) {
            Node::Internal { children, .. } if children.len() == 1 => Some(children[0]),
            _ => None,
        };
        if let Some(child) = only_child {
            let old_root = self.root;
            self.root = child;
            self.arena.dealloc(old_root);
        }
    }
}
