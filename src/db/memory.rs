//! In-memory node database.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

use crate::context::OpContext;
use crate::db::{DBIterVisitor, NodeDB};
use crate::error::TrieError;
use crate::node::Node;
use crate::HashKey;

/// An in-memory node store backed by a `BTreeMap`, so iteration order is
/// stable under insertion.
#[derive(Debug, Default)]
pub struct MemoryNodeDB {
    nodes: RwLock<BTreeMap<HashKey, Node>>,
}

impl MemoryNodeDB {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unique node no other stored node references, decoding
    /// the DB's link structure. Fails with `Structural` when several such
    /// roots exist; returns `None` for an empty DB.
    ///
    /// Used by tooling as an integrity check after squashing layers.
    pub fn compute_root(&self) -> Result<Option<Node>, TrieError> {
        let nodes = self.nodes.read();
        let mut referenced: BTreeSet<HashKey> = BTreeSet::new();
        for node in nodes.values() {
            match node {
                Node::Extension(ext) => {
                    referenced.insert(ext.child);
                }
                Node::Full(full) => {
                    for child in full.children.iter().flatten() {
                        referenced.insert(*child);
                    }
                    if let Some(value) = full.value {
                        referenced.insert(value);
                    }
                }
                _ => {}
            }
        }
        let mut root = None;
        for (key, node) in nodes.iter() {
            if !referenced.contains(key) {
                if root.is_some() {
                    return Err(TrieError::Structural(
                        "multiple unreferenced roots in node DB".into(),
                    ));
                }
                root = Some(node.clone());
            }
        }
        Ok(root)
    }
}

impl NodeDB for MemoryNodeDB {
    fn get_node(&self, key: &HashKey) -> Result<Node, TrieError> {
        self.nodes
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| TrieError::NodeNotFound(hex::encode(key)))
    }

    fn put_node(&self, key: &HashKey, node: &Node) -> Result<(), TrieError> {
        self.nodes.write().insert(*key, node.clone());
        Ok(())
    }

    fn delete_node(&self, key: &HashKey) -> Result<(), TrieError> {
        self.nodes.write().remove(key);
        Ok(())
    }

    fn multi_put(&self, entries: &[(HashKey, Node)]) -> Result<(), TrieError> {
        let mut nodes = self.nodes.write();
        for (key, node) in entries {
            nodes.insert(*key, node.clone());
        }
        Ok(())
    }

    fn multi_delete(&self, keys: &[HashKey]) -> Result<(), TrieError> {
        let mut nodes = self.nodes.write();
        for key in keys {
            nodes.remove(key);
        }
        Ok(())
    }

    fn iterate(&self, ctx: &OpContext, visitor: &mut DBIterVisitor<'_>) -> Result<(), TrieError> {
        // Snapshot so visitors can freely read the DB.
        let entries: Vec<(HashKey, Node)> = self
            .nodes
            .read()
            .iter()
            .map(|(k, n)| (*k, n.clone()))
            .collect();
        for (key, node) in &entries {
            ctx.check_cancelled()?;
            visitor(key, node)?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.nodes.read().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ExtensionNode, LeafNode};
    use crate::path::Path;
    use crate::Version;

    fn leaf(path: &str, value: &str, origin: Version) -> (HashKey, Node) {
        let node = Node::Leaf(LeafNode::new(
            Path::new(),
            Path::from_hex(path).unwrap(),
            value.as_bytes().to_vec(),
            origin,
        ));
        (node.hash_key(), node)
    }

    #[test]
    fn put_get_delete() {
        let db = MemoryNodeDB::new();
        let (key, node) = leaf("0102", "hello", 0);
        assert!(matches!(
            db.get_node(&key),
            Err(TrieError::NodeNotFound(_))
        ));
        db.put_node(&key, &node).unwrap();
        assert_eq!(db.get_node(&key).unwrap(), node);
        assert_eq!(db.size(), 1);
        // idempotent re-put and absent-key delete
        db.put_node(&key, &node).unwrap();
        assert_eq!(db.size(), 1);
        db.delete_node(&[0xee; 32]).unwrap();
        db.delete_node(&key).unwrap();
        assert_eq!(db.size(), 0);
    }

    #[test]
    fn multi_ops() {
        let db = MemoryNodeDB::new();
        let entries: Vec<_> = (0..5)
            .map(|i| leaf(&format!("0{i}"), &format!("v{i}"), 0))
            .collect();
        db.multi_put(&entries).unwrap();
        assert_eq!(db.size(), 5);
        let keys: Vec<_> = entries.iter().map(|(k, _)| *k).take(3).collect();
        db.multi_delete(&keys).unwrap();
        assert_eq!(db.size(), 2);
    }

    #[test]
    fn iterate_visits_all_once() {
        let db = MemoryNodeDB::new();
        let entries: Vec<_> = (0..4)
            .map(|i| leaf(&format!("0{i}"), &format!("v{i}"), 0))
            .collect();
        db.multi_put(&entries).unwrap();
        let mut seen = Vec::new();
        db.iterate(&OpContext::background(), &mut |key, _| {
            seen.push(*key);
            Ok(())
        })
        .unwrap();
        seen.sort();
        let mut expected: Vec<_> = entries.iter().map(|(k, _)| *k).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn compute_root_finds_unique_root() {
        let db = MemoryNodeDB::new();
        assert!(db.compute_root().unwrap().is_none());

        let (leaf_key, leaf_node) = leaf("0102", "v", 0);
        db.put_node(&leaf_key, &leaf_node).unwrap();
        let ext = Node::Extension(ExtensionNode::new(
            Path::from_hex("ab").unwrap(),
            leaf_key,
            0,
        ));
        db.put_node(&ext.hash_key(), &ext).unwrap();
        assert_eq!(db.compute_root().unwrap().unwrap(), ext);

        // a second unreferenced node makes the root ambiguous
        let (k2, n2) = leaf("ff", "loose", 0);
        db.put_node(&k2, &n2).unwrap();
        assert!(matches!(
            db.compute_root(),
            Err(TrieError::Structural(_))
        ));
    }

    #[test]
    fn prune_below_version_sweeps_old_nodes() {
        let db = MemoryNodeDB::new();
        for i in 0..10u64 {
            let (k, n) = leaf(&format!("0{i}"), "v", i);
            db.put_node(&k, &n).unwrap();
        }
        db.prune_below_version(&OpContext::background(), 5).unwrap();
        assert_eq!(db.size(), 5);
        let mut min_seen = u64::MAX;
        db.iterate(&OpContext::background(), &mut |_, node| {
            min_seen = min_seen.min(node.version());
            Ok(())
        })
        .unwrap();
        assert!(min_seen >= 5);
    }
}
