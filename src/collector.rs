//! Change collection for mutation sessions.
//!
//! Every trie mutation records the nodes it creates and the nodes it
//! supersedes. The collector keeps only the net delta: a node that is
//! created and later replaced (or deleted) within the same session leaves
//! no trace beyond the chain's endpoints.

use std::collections::HashMap;

use crate::node::Node;
use crate::HashKey;

/// A single net rewrite: `new` replaces `old` (if any) in the trie.
#[derive(Debug, Clone)]
pub struct NodeChange {
    pub old: Option<Node>,
    pub new: Node,
}

/// Per-session record of introduced and superseded nodes.
#[derive(Debug, Default)]
pub struct ChangeCollector {
    changes: HashMap<HashKey, NodeChange>,
    deletes: HashMap<HashKey, Node>,
}

impl ChangeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `new` supersedes `old`. If `old` was itself introduced
    /// in this session, its record is re-targeted so that intermediate
    /// rewrites never accumulate.
    pub fn add_change(&mut self, old: Option<Node>, new: Node) {
        let new_key = new.hash_key();
        if let Some(old_node) = old {
            let old_key = old_node.hash_key();
            if let Some(prev) = self.changes.remove(&old_key) {
                self.changes.insert(
                    new_key,
                    NodeChange {
                        old: prev.old,
                        new,
                    },
                );
                return;
            }
            self.changes.insert(
                new_key,
                NodeChange {
                    old: Some(old_node),
                    new,
                },
            );
        } else {
            self.changes.insert(new_key, NodeChange { old: None, new });
        }
    }

    /// Records an outright deletion. A node introduced this session is
    /// simply withdrawn instead.
    pub fn delete_change(&mut self, node: Node) {
        let key = node.hash_key();
        if self.changes.remove(&key).is_none() {
            self.deletes.insert(key, node);
        }
    }

    pub fn changes(&self) -> impl Iterator<Item = (&HashKey, &NodeChange)> {
        self.changes.iter()
    }

    pub fn deletes(&self) -> impl Iterator<Item = (&HashKey, &Node)> {
        self.deletes.iter()
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.deletes.is_empty()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
        self.deletes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{LeafNode, Node};
    use crate::path::Path;

    fn leaf(path: &str, value: &str) -> Node {
        Node::Leaf(LeafNode::new(
            Path::new(),
            Path::from_hex(path).unwrap(),
            value.as_bytes().to_vec(),
            0,
        ))
    }

    #[test]
    fn records_fresh_and_replacing_changes() {
        let mut cc = ChangeCollector::new();
        let a = leaf("01", "a");
        let b = leaf("01", "b");
        cc.add_change(None, a.clone());
        cc.add_change(Some(a.clone()), b.clone());
        // a was introduced this session: the chain collapses to (None -> b)
        assert_eq!(cc.change_count(), 1);
        let (_, change) = cc.changes().next().unwrap();
        assert!(change.old.is_none());
        assert_eq!(change.new, b);
    }

    #[test]
    fn preserves_preexisting_old() {
        let mut cc = ChangeCollector::new();
        let a = leaf("01", "a");
        let b = leaf("01", "b");
        let c = leaf("01", "c");
        // a predates the session
        cc.add_change(Some(a.clone()), b.clone());
        cc.add_change(Some(b), c.clone());
        assert_eq!(cc.change_count(), 1);
        let (_, change) = cc.changes().next().unwrap();
        assert_eq!(change.old.as_ref().unwrap(), &a);
        assert_eq!(change.new, c);
    }

    #[test]
    fn delete_withdraws_session_nodes() {
        let mut cc = ChangeCollector::new();
        let a = leaf("01", "a");
        cc.add_change(None, a.clone());
        cc.delete_change(a);
        assert!(cc.is_empty());

        let b = leaf("02", "b");
        cc.delete_change(b);
        assert_eq!(cc.delete_count(), 1);
        assert_eq!(cc.change_count(), 0);
    }

    #[test]
    fn clear_resets_everything() {
        let mut cc = ChangeCollector::new();
        cc.add_change(None, leaf("01", "a"));
        cc.delete_change(leaf("02", "b"));
        cc.clear();
        assert!(cc.is_empty());
    }
}
