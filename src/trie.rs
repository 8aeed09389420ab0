//! The Merkle Patricia Trie.
//!
//! A trie is a `(root, node DB, version)` triple. Nodes live in the DB keyed
//! by content hash; mutation rewrites the path from the touched position up
//! to the root and records every rewrite in the trie's change collector, so
//! a block can later flush exactly its own delta to durable storage.
//!
//! Mutations take the writer side of the trie's lock; reads copy the
//! published root under the reader side and then walk the content-addressed
//! DB without holding it.

use std::io;
use std::sync::Arc;

use metrics::counter;
use parking_lot::RwLock;

use crate::collector::ChangeCollector;
use crate::context::{OpContext, PruneStage};
use crate::db::NodeDB;
use crate::error::TrieError;
use crate::node::{
    ExtensionNode, FullNode, LeafNode, Node, ValueNode, NODE_TYPE_EXTENSION, NODE_TYPE_FULL,
    NODE_TYPE_LEAF, NODE_TYPE_VALUE,
};
use crate::path::Path;
use crate::{HashKey, Value, Version, BATCH_SIZE, EMPTY_ROOT};

struct TrieState {
    root: HashKey,
    version: Version,
    collector: ChangeCollector,
}

/// A versioned Merkle Patricia Trie over a shared node database.
pub struct MerklePatriciaTrie {
    db: Arc<dyn NodeDB>,
    state: RwLock<TrieState>,
}

impl MerklePatriciaTrie {
    /// Creates an empty trie. Nodes written through it are stamped with
    /// `version`.
    pub fn new(db: Arc<dyn NodeDB>, version: Version) -> Self {
        Self {
            db,
            state: RwLock::new(TrieState {
                root: EMPTY_ROOT,
                version,
                collector: ChangeCollector::new(),
            }),
        }
    }

    /// The backing node database handle.
    pub fn node_db(&self) -> Arc<dyn NodeDB> {
        self.db.clone()
    }

    pub fn root(&self) -> HashKey {
        self.state.read().root
    }

    /// Swaps the active root without mutating anything.
    pub fn set_root(&self, root: HashKey) {
        self.state.write().root = root;
    }

    pub fn version(&self) -> Version {
        self.state.read().version
    }

    pub fn set_version(&self, version: Version) {
        self.state.write().version = version;
    }

    pub fn is_empty(&self) -> bool {
        self.root() == EMPTY_ROOT
    }

    /// Clears the change collector, optionally re-baselining the root.
    pub fn reset_change_collector(&self, root: Option<HashKey>) {
        let mut st = self.state.write();
        st.collector.clear();
        if let Some(root) = root {
            st.root = root;
        }
    }

    /// Number of pending `(old, new)` records in the collector.
    pub fn change_count(&self) -> usize {
        self.state.read().collector.change_count()
    }

    // ------------------------------------------------------------------
    // lookup

    /// Resolves the value stored at `path`.
    pub fn get<V: Value>(&self, path: &Path) -> Result<V, TrieError> {
        let bytes = self.get_raw(path)?;
        V::decode(&bytes)
    }

    /// Resolves the raw value bytes stored at `path`.
    pub fn get_raw(&self, path: &Path) -> Result<Vec<u8>, TrieError> {
        let root = self.root();
        if root == EMPTY_ROOT {
            return Err(TrieError::ValueNotPresent);
        }
        self.get_at(&root, path)
    }

    fn get_at(&self, key: &HashKey, path: &Path) -> Result<Vec<u8>, TrieError> {
        match self.db.get_node(key)? {
            Node::Leaf(leaf) => {
                if leaf.path == *path {
                    Ok(leaf.value)
                } else {
                    Err(TrieError::ValueNotPresent)
                }
            }
            Node::Extension(ext) => {
                if path.starts_with(&ext.path) {
                    self.get_at(&ext.child, &path.slice_from(ext.path.len()))
                } else {
                    Err(TrieError::ValueNotPresent)
                }
            }
            Node::Full(full) => {
                if path.is_empty() {
                    let vkey = full.value.ok_or(TrieError::ValueNotPresent)?;
                    self.resolve_value(&vkey)
                } else {
                    let nibble = path.first().expect("path checked non-empty");
                    match full.children[nibble as usize] {
                        Some(child) => self.get_at(&child, &path.slice_from(1)),
                        None => Err(TrieError::ValueNotPresent),
                    }
                }
            }
            Node::Value(_) => Err(TrieError::Structural(
                "value node reached during traversal".into(),
            )),
        }
    }

    fn resolve_value(&self, key: &HashKey) -> Result<Vec<u8>, TrieError> {
        match self.db.get_node(key)? {
            Node::Value(value) => Ok(value.value),
            other => Err(TrieError::Structural(format!(
                "value slot references a non-value node (type {})",
                other.node_type()
            ))),
        }
    }

    /// Returns the ordered list of nodes traversed from the root to the
    /// node holding the value at `path` (for Merkle proofs).
    pub fn get_path_nodes(&self, path: &Path) -> Result<Vec<Node>, TrieError> {
        let root = self.root();
        if root == EMPTY_ROOT {
            return Err(TrieError::ValueNotPresent);
        }
        let mut nodes = Vec::new();
        self.path_nodes_at(&root, path, &mut nodes)?;
        Ok(nodes)
    }

    fn path_nodes_at(
        &self,
        key: &HashKey,
        path: &Path,
        out: &mut Vec<Node>,
    ) -> Result<(), TrieError> {
        let node = self.db.get_node(key)?;
        match &node {
            Node::Leaf(leaf) => {
                if leaf.path == *path {
                    out.push(node);
                    Ok(())
                } else {
                    Err(TrieError::ValueNotPresent)
                }
            }
            Node::Extension(ext) => {
                if path.starts_with(&ext.path) {
                    let rest = path.slice_from(ext.path.len());
                    let child = ext.child;
                    out.push(node);
                    self.path_nodes_at(&child, &rest, out)
                } else {
                    Err(TrieError::ValueNotPresent)
                }
            }
            Node::Full(full) => {
                if path.is_empty() {
                    if full.value.is_none() {
                        return Err(TrieError::ValueNotPresent);
                    }
                    out.push(node);
                    Ok(())
                } else {
                    let nibble = path.first().expect("path checked non-empty");
                    match full.children[nibble as usize] {
                        Some(child) => {
                            let rest = path.slice_from(1);
                            out.push(node);
                            self.path_nodes_at(&child, &rest, out)
                        }
                        None => Err(TrieError::ValueNotPresent),
                    }
                }
            }
            Node::Value(_) => Err(TrieError::Structural(
                "value node reached during traversal".into(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // insert

    /// Inserts `value` at `path`, rewriting nodes along the way, and
    /// returns the new root. An empty encoding deletes the path instead.
    pub fn insert<V: Value>(&self, path: &Path, value: &V) -> Result<HashKey, TrieError> {
        let bytes = value.encode();
        if bytes.is_empty() {
            return self.delete(path);
        }
        if path.is_empty() {
            return Err(TrieError::InvalidInput("empty path on insert"));
        }
        let mut st = self.state.write();
        let new_root = if st.root == EMPTY_ROOT {
            let leaf = Node::Leaf(LeafNode::new(Path::new(), path.clone(), bytes, st.version));
            self.put_new(&mut st, leaf, None)?
        } else {
            let root = st.root;
            self.insert_at(&mut st, &root, &Path::new(), path, &bytes)?
        };
        st.root = new_root;
        Ok(new_root)
    }

    fn insert_at(
        &self,
        st: &mut TrieState,
        key: &HashKey,
        prefix: &Path,
        path: &Path,
        bytes: &[u8],
    ) -> Result<HashKey, TrieError> {
        match self.db.get_node(key)? {
            Node::Leaf(leaf) => self.insert_at_leaf(st, leaf, prefix, path, bytes),
            Node::Extension(ext) => self.insert_at_extension(st, ext, prefix, path, bytes),
            Node::Full(full) => self.insert_at_full(st, full, prefix, path, bytes),
            Node::Value(_) => Err(TrieError::Structural(
                "value node reached during traversal".into(),
            )),
        }
    }

    fn insert_at_leaf(
        &self,
        st: &mut TrieState,
        leaf: LeafNode,
        prefix: &Path,
        path: &Path,
        bytes: &[u8],
    ) -> Result<HashKey, TrieError> {
        if leaf.path == *path {
            let replacement = Node::Leaf(LeafNode::new(
                leaf.prefix.clone(),
                leaf.path.clone(),
                bytes.to_vec(),
                st.version,
            ));
            return self.put_new(st, replacement, Some(Node::Leaf(leaf)));
        }

        let m = leaf.path.common_prefix_len(path);
        let mut full = FullNode::new(st.version);

        if m == leaf.path.len() {
            // old value sits exactly at the divergence point
            let value = Node::Value(ValueNode::new(leaf.value.clone(), st.version));
            full.value = Some(self.put_new(st, value, None)?);
        } else {
            let nibble = leaf.path.get(m).expect("m < old path length");
            let moved = Node::Leaf(LeafNode::new(
                prefix.concat(&path.slice_to(m)).child(nibble),
                leaf.path.slice_from(m + 1),
                leaf.value.clone(),
                st.version,
            ));
            full.children[nibble as usize] = Some(self.put_new(st, moved, None)?);
        }

        if m == path.len() {
            let value = Node::Value(ValueNode::new(bytes.to_vec(), st.version));
            full.value = Some(self.put_new(st, value, None)?);
        } else {
            let nibble = path.get(m).expect("m < new path length");
            let fresh = Node::Leaf(LeafNode::new(
                prefix.concat(&path.slice_to(m)).child(nibble),
                path.slice_from(m + 1),
                bytes.to_vec(),
                st.version,
            ));
            full.children[nibble as usize] = Some(self.put_new(st, fresh, None)?);
        }

        if m > 0 {
            let full_key = self.put_new(st, Node::Full(full), None)?;
            let ext = Node::Extension(ExtensionNode::new(path.slice_to(m), full_key, st.version));
            self.put_new(st, ext, Some(Node::Leaf(leaf)))
        } else {
            self.put_new(st, Node::Full(full), Some(Node::Leaf(leaf)))
        }
    }

    fn insert_at_extension(
        &self,
        st: &mut TrieState,
        ext: ExtensionNode,
        prefix: &Path,
        path: &Path,
        bytes: &[u8],
    ) -> Result<HashKey, TrieError> {
        let m = ext.path.common_prefix_len(path);
        if m == ext.path.len() {
            let child = self.insert_at(
                st,
                &ext.child,
                &prefix.concat(&ext.path),
                &path.slice_from(m),
                bytes,
            )?;
            let replacement =
                Node::Extension(ExtensionNode::new(ext.path.clone(), child, st.version));
            return self.put_new(st, replacement, Some(Node::Extension(ext)));
        }

        let mut full = FullNode::new(st.version);
        let branch = ext.path.get(m).expect("m < extension path length");
        if ext.path.len() - m == 1 {
            // the extension shrinks to nothing: its child hangs directly
            // off the branch (a zero-length extension is forbidden)
            full.children[branch as usize] = Some(ext.child);
        } else {
            let shortened = Node::Extension(ExtensionNode::new(
                ext.path.slice_from(m + 1),
                ext.child,
                st.version,
            ));
            full.children[branch as usize] = Some(self.put_new(st, shortened, None)?);
        }

        if m == path.len() {
            let value = Node::Value(ValueNode::new(bytes.to_vec(), st.version));
            full.value = Some(self.put_new(st, value, None)?);
        } else {
            let nibble = path.get(m).expect("m < new path length");
            let fresh = Node::Leaf(LeafNode::new(
                prefix.concat(&path.slice_to(m)).child(nibble),
                path.slice_from(m + 1),
                bytes.to_vec(),
                st.version,
            ));
            full.children[nibble as usize] = Some(self.put_new(st, fresh, None)?);
        }

        if m > 0 {
            let full_key = self.put_new(st, Node::Full(full), None)?;
            let above = Node::Extension(ExtensionNode::new(path.slice_to(m), full_key, st.version));
            self.put_new(st, above, Some(Node::Extension(ext)))
        } else {
            self.put_new(st, Node::Full(full), Some(Node::Extension(ext)))
        }
    }

    fn insert_at_full(
        &self,
        st: &mut TrieState,
        full: FullNode,
        prefix: &Path,
        path: &Path,
        bytes: &[u8],
    ) -> Result<HashKey, TrieError> {
        let mut replacement = FullNode::new(st.version);
        replacement.children = full.children;
        replacement.value = full.value;

        if path.is_empty() {
            let old_value = match full.value {
                Some(vkey) => Some(self.db.get_node(&vkey)?),
                None => None,
            };
            let value = Node::Value(ValueNode::new(bytes.to_vec(), st.version));
            replacement.value = Some(self.put_new(st, value, old_value)?);
        } else {
            let nibble = path.first().expect("path checked non-empty");
            match full.children[nibble as usize] {
                Some(child) => {
                    replacement.children[nibble as usize] = Some(self.insert_at(
                        st,
                        &child,
                        &prefix.child(nibble),
                        &path.slice_from(1),
                        bytes,
                    )?);
                }
                None => {
                    let fresh = Node::Leaf(LeafNode::new(
                        prefix.child(nibble),
                        path.slice_from(1),
                        bytes.to_vec(),
                        st.version,
                    ));
                    replacement.children[nibble as usize] = Some(self.put_new(st, fresh, None)?);
                }
            }
        }
        self.put_new(st, Node::Full(replacement), Some(Node::Full(full)))
    }

    // ------------------------------------------------------------------
    // delete

    /// Removes the value at `path`, collapsing nodes that drop below their
    /// minimum shape, and returns the new root. Fails with `NodeNotFound`
    /// if the path holds no value.
    pub fn delete(&self, path: &Path) -> Result<HashKey, TrieError> {
        if path.is_empty() {
            return Err(TrieError::InvalidInput("empty path on delete"));
        }
        let mut st = self.state.write();
        if st.root == EMPTY_ROOT {
            return Err(TrieError::NodeNotFound(path.to_string()));
        }
        let root = st.root;
        let new_root = self
            .delete_at(&mut st, &root, &Path::new(), path)?
            .unwrap_or(EMPTY_ROOT);
        st.root = new_root;
        Ok(new_root)
    }

    fn delete_at(
        &self,
        st: &mut TrieState,
        key: &HashKey,
        prefix: &Path,
        path: &Path,
    ) -> Result<Option<HashKey>, TrieError> {
        match self.db.get_node(key)? {
            Node::Leaf(leaf) => {
                if leaf.path == *path {
                    self.remove_node(st, Node::Leaf(leaf))?;
                    Ok(None)
                } else {
                    Err(TrieError::NodeNotFound(path.to_string()))
                }
            }
            Node::Extension(ext) => self.delete_at_extension(st, ext, prefix, path),
            Node::Full(full) => self.delete_at_full(st, full, prefix, path),
            Node::Value(_) => Err(TrieError::Structural(
                "value node reached during traversal".into(),
            )),
        }
    }

    fn delete_at_extension(
        &self,
        st: &mut TrieState,
        ext: ExtensionNode,
        prefix: &Path,
        path: &Path,
    ) -> Result<Option<HashKey>, TrieError> {
        if !path.starts_with(&ext.path) {
            return Err(TrieError::NodeNotFound(path.to_string()));
        }
        let sub = self.delete_at(
            st,
            &ext.child,
            &prefix.concat(&ext.path),
            &path.slice_from(ext.path.len()),
        )?;
        let Some(child_key) = sub else {
            // sole child vanished, so the extension goes too
            self.remove_node(st, Node::Extension(ext))?;
            return Ok(None);
        };
        match self.db.get_node(&child_key)? {
            Node::Leaf(child) => {
                let merged = Node::Leaf(LeafNode::new(
                    prefix.clone(),
                    ext.path.concat(&child.path),
                    child.value.clone(),
                    st.version,
                ));
                self.remove_node(st, Node::Leaf(child))?;
                Ok(Some(self.put_new(st, merged, Some(Node::Extension(ext)))?))
            }
            Node::Extension(child) => {
                // no consecutive extensions
                let merged = Node::Extension(ExtensionNode::new(
                    ext.path.concat(&child.path),
                    child.child,
                    st.version,
                ));
                self.remove_node(st, Node::Extension(child))?;
                Ok(Some(self.put_new(st, merged, Some(Node::Extension(ext)))?))
            }
            Node::Full(_) => {
                let replacement = Node::Extension(ExtensionNode::new(
                    ext.path.clone(),
                    child_key,
                    st.version,
                ));
                Ok(Some(self.put_new(
                    st,
                    replacement,
                    Some(Node::Extension(ext)),
                )?))
            }
            Node::Value(_) => Err(TrieError::Structural(
                "value node as extension child".into(),
            )),
        }
    }

    fn delete_at_full(
        &self,
        st: &mut TrieState,
        full: FullNode,
        prefix: &Path,
        path: &Path,
    ) -> Result<Option<HashKey>, TrieError> {
        let mut replacement = FullNode::new(st.version);
        replacement.children = full.children;
        replacement.value = full.value;

        if path.is_empty() {
            let vkey = full
                .value
                .ok_or_else(|| TrieError::NodeNotFound(prefix.to_string()))?;
            let value = self.db.get_node(&vkey)?;
            self.remove_node(st, value)?;
            replacement.value = None;
        } else {
            let nibble = path.first().expect("path checked non-empty");
            let child = full.children[nibble as usize]
                .ok_or_else(|| TrieError::NodeNotFound(path.to_string()))?;
            replacement.children[nibble as usize] =
                self.delete_at(st, &child, &prefix.child(nibble), &path.slice_from(1))?;
        }

        match replacement.outgoing() {
            0 => {
                self.remove_node(st, Node::Full(full))?;
                Ok(None)
            }
            1 => self.collapse_full(st, full, replacement, prefix),
            _ => Ok(Some(self.put_new(
                st,
                Node::Full(replacement),
                Some(Node::Full(full)),
            )?)),
        }
    }

    /// A Full node reduced to a single outgoing reference is rewritten as a
    /// Leaf or Extension.
    fn collapse_full(
        &self,
        st: &mut TrieState,
        old: FullNode,
        reduced: FullNode,
        prefix: &Path,
    ) -> Result<Option<HashKey>, TrieError> {
        if let Some(vkey) = reduced.value {
            let value = self.db.get_node(&vkey)?;
            let bytes = match &value {
                Node::Value(v) => v.value.clone(),
                _ => {
                    return Err(TrieError::Structural(
                        "value slot references a non-value node".into(),
                    ))
                }
            };
            let leaf = Node::Leaf(LeafNode::new(prefix.clone(), Path::new(), bytes, st.version));
            self.remove_node(st, value)?;
            return Ok(Some(self.put_new(st, leaf, Some(Node::Full(old)))?));
        }

        let nibble = reduced
            .single_child_index()
            .expect("collapse_full called with exactly one outgoing reference");
        let child_key = reduced.children[nibble as usize].expect("slot checked occupied");
        match self.db.get_node(&child_key)? {
            Node::Leaf(child) => {
                let mut merged_path = Path::new();
                merged_path.push(nibble);
                merged_path.extend(&child.path);
                let leaf = Node::Leaf(LeafNode::new(
                    prefix.clone(),
                    merged_path,
                    child.value.clone(),
                    st.version,
                ));
                self.remove_node(st, Node::Leaf(child))?;
                Ok(Some(self.put_new(st, leaf, Some(Node::Full(old)))?))
            }
            Node::Extension(child) => {
                let mut merged_path = Path::new();
                merged_path.push(nibble);
                merged_path.extend(&child.path);
                let ext =
                    Node::Extension(ExtensionNode::new(merged_path, child.child, st.version));
                self.remove_node(st, Node::Extension(child))?;
                Ok(Some(self.put_new(st, ext, Some(Node::Full(old)))?))
            }
            Node::Full(_) => {
                let mut step = Path::new();
                step.push(nibble);
                let ext = Node::Extension(ExtensionNode::new(step, child_key, st.version));
                Ok(Some(self.put_new(st, ext, Some(Node::Full(old)))?))
            }
            Node::Value(_) => Err(TrieError::Structural(
                "value node in a child slot".into(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // iteration

    /// Depth-first walk of the trie. A Full node's value is visited before
    /// its children; children run in nibble order 0..15. Only nodes whose
    /// variant bit is set in `mask` reach the visitor; value visits carry a
    /// `None` key. A visitor error aborts the walk.
    pub fn iterate<F>(&self, ctx: &OpContext, visitor: &mut F, mask: u8) -> Result<(), TrieError>
    where
        F: FnMut(&Path, Option<&HashKey>, &Node) -> Result<(), TrieError>,
    {
        let root = self.root();
        if root == EMPTY_ROOT {
            return Ok(());
        }
        self.iterate_at(ctx, &root, &Path::new(), visitor, mask)
    }

    /// Walks the subtree rooted at `key` instead of the trie root.
    pub fn iterate_from<F>(
        &self,
        ctx: &OpContext,
        key: &HashKey,
        visitor: &mut F,
        mask: u8,
    ) -> Result<(), TrieError>
    where
        F: FnMut(&Path, Option<&HashKey>, &Node) -> Result<(), TrieError>,
    {
        self.iterate_at(ctx, key, &Path::new(), visitor, mask)
    }

    fn iterate_at<F>(
        &self,
        ctx: &OpContext,
        key: &HashKey,
        path: &Path,
        visitor: &mut F,
        mask: u8,
    ) -> Result<(), TrieError>
    where
        F: FnMut(&Path, Option<&HashKey>, &Node) -> Result<(), TrieError>,
    {
        ctx.check_cancelled()?;
        let node = self.db.get_node(key)?;
        match &node {
            Node::Leaf(leaf) => {
                if mask & NODE_TYPE_LEAF != 0 {
                    visitor(path, Some(key), &node)?;
                }
                if mask & NODE_TYPE_VALUE != 0 {
                    let value = Node::Value(ValueNode::new(leaf.value.clone(), leaf.origin));
                    visitor(&path.concat(&leaf.path), None, &value)?;
                }
            }
            Node::Extension(ext) => {
                if mask & NODE_TYPE_EXTENSION != 0 {
                    visitor(path, Some(key), &node)?;
                }
                self.iterate_at(ctx, &ext.child, &path.concat(&ext.path), visitor, mask)?;
            }
            Node::Full(full) => {
                if mask & NODE_TYPE_FULL != 0 {
                    visitor(path, Some(key), &node)?;
                }
                if mask & NODE_TYPE_VALUE != 0 {
                    if let Some(vkey) = &full.value {
                        let value = self.db.get_node(vkey)?;
                        visitor(path, None, &value)?;
                    }
                }
                for (i, child) in full.children.iter().enumerate() {
                    if let Some(child_key) = child {
                        self.iterate_at(ctx, child_key, &path.child(i as u8), visitor, mask)?;
                    }
                }
            }
            Node::Value(_) => {
                if mask & NODE_TYPE_VALUE != 0 {
                    visitor(path, None, &node)?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // persistence

    /// Flushes the collector's new nodes to `target` in one atomic batch;
    /// with `include_deletes`, the queued deletions follow.
    pub fn save_changes(
        &self,
        ctx: &OpContext,
        target: &dyn NodeDB,
        include_deletes: bool,
    ) -> Result<(), TrieError> {
        ctx.check_cancelled()?;
        let (entries, deletes) = {
            let st = self.state.read();
            let entries: Vec<(HashKey, Node)> = st
                .collector
                .changes()
                .map(|(key, change)| (*key, change.new.clone()))
                .collect();
            let deletes: Vec<HashKey> = st.collector.deletes().map(|(key, _)| *key).collect();
            (entries, deletes)
        };
        target.multi_put(&entries)?;
        if include_deletes {
            target.multi_delete(&deletes)?;
        }
        tracing::debug!(
            saved = entries.len(),
            deletes = if include_deletes { deletes.len() } else { 0 },
            "flushed change collector"
        );
        Ok(())
    }

    /// Absorbs `src`'s collected changes and adopts its root. Fails with
    /// `NodeNotFound` when the root resolves in neither this trie's DB nor
    /// `src`'s.
    pub fn merge_changes(&self, src: &MerklePatriciaTrie) -> Result<(), TrieError> {
        let (src_root, changes, deletes) = {
            let st = src.state.read();
            let changes: Vec<_> = st.collector.changes().map(|(_, c)| c.clone()).collect();
            let deletes: Vec<_> = st.collector.deletes().map(|(_, n)| n.clone()).collect();
            (st.root, changes, deletes)
        };
        if src_root != EMPTY_ROOT
            && self.db.get_node(&src_root).is_err()
            && src.db.get_node(&src_root).is_err()
        {
            return Err(TrieError::NodeNotFound(hex::encode(src_root)));
        }
        let mut st = self.state.write();
        for change in changes {
            let key = change.new.hash_key();
            self.db.put_node(&key, &change.new)?;
            st.collector.add_change(change.old, change.new);
        }
        for node in deletes {
            self.db.delete_node(&node.hash_key())?;
            st.collector.delete_change(node);
        }
        st.root = src_root;
        Ok(())
    }

    // ------------------------------------------------------------------
    // versioning (GC mark phase)

    /// Lifts the latest-touch version of every node reachable from the
    /// current root to `new_version`, re-saving in batches of
    /// [`BATCH_SIZE`]. Keys do not change: the version stamp is outside the
    /// hashed encoding. Missing children go through `missing_handler`;
    /// only a handler error aborts the walk.
    ///
    /// This is the mark phase of the garbage collector. Run it before
    /// [`NodeDB::prune_below_version`] with the same watermark.
    pub fn update_version<F>(
        &self,
        ctx: &OpContext,
        new_version: Version,
        missing_handler: &mut F,
    ) -> Result<(), TrieError>
    where
        F: FnMut(&Path, &HashKey) -> Result<(), TrieError>,
    {
        if let Some(stats) = ctx.prune_stats() {
            stats.set_stage(PruneStage::Update);
        }
        let root = self.root();
        if root == EMPTY_ROOT {
            return Ok(());
        }
        let mut batch: Vec<(HashKey, Node)> = Vec::with_capacity(BATCH_SIZE);
        let mut marked = 0u64;
        self.mark_at(
            ctx,
            &root,
            &Path::new(),
            new_version,
            &mut batch,
            &mut marked,
            missing_handler,
        )?;
        if !batch.is_empty() {
            self.db.multi_put(&batch)?;
        }
        counter!("state_trie.marked_nodes").increment(marked);
        tracing::debug!(marked, watermark = new_version, "lifted node versions");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn mark_at<F>(
        &self,
        ctx: &OpContext,
        key: &HashKey,
        path: &Path,
        new_version: Version,
        batch: &mut Vec<(HashKey, Node)>,
        marked: &mut u64,
        missing_handler: &mut F,
    ) -> Result<(), TrieError>
    where
        F: FnMut(&Path, &HashKey) -> Result<(), TrieError>,
    {
        ctx.check_cancelled()?;
        let mut node = match self.db.get_node(key) {
            Ok(node) => node,
            Err(TrieError::NodeNotFound(_)) => {
                if let Some(stats) = ctx.prune_stats() {
                    stats.inc_missing();
                }
                return missing_handler(path, key);
            }
            Err(err) => return Err(err),
        };
        if let Some(stats) = ctx.prune_stats() {
            stats.inc_total();
        }
        if node.version() < new_version {
            if let Some(stats) = ctx.prune_stats() {
                stats.inc_below_version();
                stats.inc_updated();
            }
            node.set_version(new_version);
            batch.push((*key, node.clone()));
            *marked += 1;
            if batch.len() >= BATCH_SIZE {
                self.db.multi_put(batch.as_slice())?;
                batch.clear();
            }
        }
        match &node {
            Node::Extension(ext) => self.mark_at(
                ctx,
                &ext.child,
                &path.concat(&ext.path),
                new_version,
                batch,
                marked,
                missing_handler,
            ),
            Node::Full(full) => {
                if let Some(vkey) = &full.value {
                    self.mark_at(
                        ctx,
                        vkey,
                        path,
                        new_version,
                        batch,
                        marked,
                        missing_handler,
                    )?;
                }
                for (i, child) in full.children.iter().enumerate() {
                    if let Some(child_key) = child {
                        self.mark_at(
                            ctx,
                            child_key,
                            &path.child(i as u8),
                            new_version,
                            batch,
                            marked,
                            missing_handler,
                        )?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // debugging

    /// Writes an indented dump of the trie, one node per line.
    pub fn pretty_print(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let root = self.root();
        if root == EMPTY_ROOT {
            return writeln!(w, "(empty trie)");
        }
        self.print_at(w, &root, 0)
    }

    fn print_at(&self, w: &mut dyn io::Write, key: &HashKey, depth: usize) -> io::Result<()> {
        let pad = "  ".repeat(depth);
        let short = hex::encode(&key[..4]);
        match self.db.get_node(key) {
            Err(_) => writeln!(w, "{pad}?? {short} (missing)"),
            Ok(Node::Value(value)) => {
                writeln!(w, "{pad}V {short} [{} bytes]", value.value.len())
            }
            Ok(Node::Leaf(leaf)) => writeln!(
                w,
                "{pad}L {short} path={} [{} bytes]",
                leaf.path,
                leaf.value.len()
            ),
            Ok(Node::Extension(ext)) => {
                writeln!(w, "{pad}E {short} path={}", ext.path)?;
                self.print_at(w, &ext.child, depth + 1)
            }
            Ok(Node::Full(full)) => {
                writeln!(w, "{pad}F {short} ({} children)", full.child_count())?;
                if let Some(vkey) = &full.value {
                    self.print_at(w, vkey, depth + 1)?;
                }
                for child in full.children.iter().flatten() {
                    self.print_at(w, child, depth + 1)?;
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // internals

    /// Stores a freshly created node and records it against the node it
    /// supersedes (if any). Returns the new node's key.
    fn put_new(
        &self,
        st: &mut TrieState,
        node: Node,
        old: Option<Node>,
    ) -> Result<HashKey, TrieError> {
        let key = node.hash_key();
        self.db.put_node(&key, &node)?;
        st.collector.add_change(old, node);
        Ok(key)
    }

    /// Deletes a node from the working layer and queues the deletion.
    fn remove_node(&self, st: &mut TrieState, node: Node) -> Result<(), TrieError> {
        let key = node.hash_key();
        self.db.delete_node(&key)?;
        st.collector.delete_change(node);
        Ok(())
    }
}
