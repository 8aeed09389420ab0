//! Layered node database.
//!
//! Stacks a writable in-memory layer atop an arbitrary parent DB. Blocks
//! stage their mutations in such an overlay over the persistent state DB,
//! and each transaction stages its own overlay over the block's.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::OpContext;
use crate::db::{DBIterVisitor, MemoryNodeDB, NodeDB};
use crate::error::TrieError;
use crate::node::Node;
use crate::HashKey;

/// A read-through overlay: reads try the current layer then the parent,
/// writes land in the current layer only.
pub struct LevelNodeDB {
    current: MemoryNodeDB,
    prev: Arc<dyn NodeDB>,
    /// When set, deletes are forwarded to the parent as well. Test hook;
    /// normal operation masks the parent entry instead.
    propagate_deletes: bool,
    masked: RwLock<BTreeSet<HashKey>>,
}

impl LevelNodeDB {
    pub fn new(current: MemoryNodeDB, prev: Arc<dyn NodeDB>, propagate_deletes: bool) -> Self {
        Self {
            current,
            prev,
            propagate_deletes,
            masked: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn current(&self) -> &MemoryNodeDB {
        &self.current
    }

    pub fn prev(&self) -> &Arc<dyn NodeDB> {
        &self.prev
    }
}

impl NodeDB for LevelNodeDB {
    fn get_node(&self, key: &HashKey) -> Result<Node, TrieError> {
        if self.masked.read().contains(key) {
            return Err(TrieError::NodeNotFound(hex::encode(key)));
        }
        match self.current.get_node(key) {
            Ok(node) => Ok(node),
            Err(TrieError::NodeNotFound(_)) => self.prev.get_node(key),
            Err(err) => Err(err),
        }
    }

    fn put_node(&self, key: &HashKey, node: &Node) -> Result<(), TrieError> {
        self.masked.write().remove(key);
        self.current.put_node(key, node)
    }

    fn delete_node(&self, key: &HashKey) -> Result<(), TrieError> {
        self.current.delete_node(key)?;
        if self.propagate_deletes {
            self.prev.delete_node(key)?;
        } else {
            self.masked.write().insert(*key);
        }
        Ok(())
    }

    fn multi_put(&self, entries: &[(HashKey, Node)]) -> Result<(), TrieError> {
        {
            let mut masked = self.masked.write();
            for (key, _) in entries {
                masked.remove(key);
            }
        }
        self.current.multi_put(entries)
    }

    fn multi_delete(&self, keys: &[HashKey]) -> Result<(), TrieError> {
        self.current.multi_delete(keys)?;
        if self.propagate_deletes {
            self.prev.multi_delete(keys)?;
        } else {
            let mut masked = self.masked.write();
            for key in keys {
                masked.insert(*key);
            }
        }
        Ok(())
    }

    fn iterate(&self, ctx: &OpContext, visitor: &mut DBIterVisitor<'_>) -> Result<(), TrieError> {
        let masked = self.masked.read().clone();
        let mut seen: BTreeSet<HashKey> = BTreeSet::new();
        self.current.iterate(ctx, &mut |key, node| {
            if masked.contains(key) {
                return Ok(());
            }
            seen.insert(*key);
            visitor(key, node)
        })?;
        self.prev.iterate(ctx, &mut |key, node| {
            if masked.contains(key) || seen.contains(key) {
                return Ok(());
            }
            visitor(key, node)
        })
    }

    fn size(&self) -> u64 {
        // Layer sizes summed; observability only, no cross-layer dedup.
        self.current.size() + self.prev.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LeafNode;
    use crate::path::Path;

    fn leaf(path: &str, value: &str) -> (HashKey, Node) {
        let node = Node::Leaf(LeafNode::new(
            Path::new(),
            Path::from_hex(path).unwrap(),
            value.as_bytes().to_vec(),
            0,
        ));
        (node.hash_key(), node)
    }

    fn overlay(propagate: bool) -> (Arc<MemoryNodeDB>, LevelNodeDB) {
        let parent = Arc::new(MemoryNodeDB::new());
        let level = LevelNodeDB::new(MemoryNodeDB::new(), parent.clone(), propagate);
        (parent, level)
    }

    #[test]
    fn reads_fall_through_to_parent() {
        let (parent, level) = overlay(false);
        let (key, node) = leaf("01", "parent");
        parent.put_node(&key, &node).unwrap();
        assert_eq!(level.get_node(&key).unwrap(), node);
        // current layer shadows the parent
        let (k2, n2) = leaf("02", "current");
        level.put_node(&k2, &n2).unwrap();
        assert_eq!(level.get_node(&k2).unwrap(), n2);
        assert_eq!(parent.size(), 1);
        assert_eq!(level.current().size(), 1);
    }

    #[test]
    fn delete_masks_parent_entry() {
        let (parent, level) = overlay(false);
        let (key, node) = leaf("01", "v");
        parent.put_node(&key, &node).unwrap();
        level.delete_node(&key).unwrap();
        assert!(matches!(
            level.get_node(&key),
            Err(TrieError::NodeNotFound(_))
        ));
        // parent untouched
        assert!(parent.get_node(&key).is_ok());
        // re-putting clears the mask
        level.put_node(&key, &node).unwrap();
        assert!(level.get_node(&key).is_ok());
    }

    #[test]
    fn propagated_delete_reaches_parent() {
        let (parent, level) = overlay(true);
        let (key, node) = leaf("01", "v");
        parent.put_node(&key, &node).unwrap();
        level.delete_node(&key).unwrap();
        assert!(parent.get_node(&key).is_err());
    }

    #[test]
    fn iterate_yields_each_hash_once() {
        let (parent, level) = overlay(false);
        let (shared_key, shared) = leaf("01", "shared");
        parent.put_node(&shared_key, &shared).unwrap();
        level.put_node(&shared_key, &shared).unwrap();
        let (pk, pn) = leaf("02", "parent-only");
        parent.put_node(&pk, &pn).unwrap();
        let (ck, cn) = leaf("03", "current-only");
        level.put_node(&ck, &cn).unwrap();
        let (mk, mn) = leaf("04", "masked");
        parent.put_node(&mk, &mn).unwrap();
        level.delete_node(&mk).unwrap();

        let mut seen = Vec::new();
        level
            .iterate(&OpContext::background(), &mut |key, _| {
                seen.push(*key);
                Ok(())
            })
            .unwrap();
        seen.sort();
        let mut expected = vec![shared_key, pk, ck];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn chains_stack() {
        let (parent, level1) = overlay(false);
        let level1 = Arc::new(level1);
        let level2 = LevelNodeDB::new(MemoryNodeDB::new(), level1.clone(), false);
        let (key, node) = leaf("01", "deep");
        parent.put_node(&key, &node).unwrap();
        assert_eq!(level2.get_node(&key).unwrap(), node);
    }
}
