//! RocksDB-backed persistent node database.
//!
//! Enable with the `rocksdb` feature. Multi-writes go through a single
//! `WriteBatch`, so they are atomic at the storage boundary; reads decode
//! and re-hash the stored bytes, surfacing corruption as `Structural`.

use std::path::{Path as FsPath, PathBuf};

use rocksdb::{DBCompressionType, IteratorMode, Options, WriteBatch, DB};

use crate::context::OpContext;
use crate::db::{DBIterVisitor, NodeDB};
use crate::error::TrieError;
use crate::node::Node;
use crate::HashKey;

const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_OPEN_FILES: i32 = 1024;

/// Configuration for the persistent node store.
#[derive(Debug, Clone)]
pub struct RocksNodeDBConfig {
    pub path: PathBuf,
    pub write_buffer_size: usize,
    pub max_open_files: i32,
    pub create_if_missing: bool,
}

impl RocksNodeDBConfig {
    pub fn with_path<P: AsRef<FsPath>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            create_if_missing: true,
        }
    }

    fn build_options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(self.create_if_missing);
        opts.set_max_open_files(self.max_open_files);
        opts.set_write_buffer_size(self.write_buffer_size);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }
}

/// A persistent node database.
pub struct RocksNodeDB {
    db: DB,
    path: PathBuf,
}

impl RocksNodeDB {
    /// Opens (or creates) the store at the configured path.
    pub fn open(config: RocksNodeDBConfig) -> Result<Self, TrieError> {
        let opts = config.build_options();
        let db = DB::open(&opts, &config.path)
            .map_err(|e| TrieError::Io(format!("open rocksdb: {e}")))?;
        Ok(Self {
            db,
            path: config.path,
        })
    }

    /// Opens the store at `path` with default settings.
    pub fn open_default<P: AsRef<FsPath>>(path: P) -> Result<Self, TrieError> {
        Self::open(RocksNodeDBConfig::with_path(path))
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    fn decode_checked(key: &HashKey, bytes: &[u8]) -> Result<Node, TrieError> {
        let node = Node::decode(bytes)?;
        let computed = node.hash_key();
        if computed != *key {
            return Err(TrieError::Structural(format!(
                "stored node hash mismatch: key {} encodes to {}",
                hex::encode(key),
                hex::encode(computed)
            )));
        }
        Ok(node)
    }
}

impl NodeDB for RocksNodeDB {
    fn get_node(&self, key: &HashKey) -> Result<Node, TrieError> {
        let bytes = self
            .db
            .get(key)
            .map_err(|e| TrieError::Io(e.to_string()))?
            .ok_or_else(|| TrieError::NodeNotFound(hex::encode(key)))?;
        Self::decode_checked(key, &bytes)
    }

    fn put_node(&self, key: &HashKey, node: &Node) -> Result<(), TrieError> {
        self.db
            .put(key, node.encode())
            .map_err(|e| TrieError::Io(e.to_string()))
    }

    fn delete_node(&self, key: &HashKey) -> Result<(), TrieError> {
        self.db
            .delete(key)
            .map_err(|e| TrieError::Io(e.to_string()))
    }

    fn multi_put(&self, entries: &[(HashKey, Node)]) -> Result<(), TrieError> {
        let mut batch = WriteBatch::default();
        for (key, node) in entries {
            batch.put(key, node.encode());
        }
        self.db
            .write(batch)
            .map_err(|e| TrieError::Io(e.to_string()))
    }

    fn multi_delete(&self, keys: &[HashKey]) -> Result<(), TrieError> {
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete(key);
        }
        self.db
            .write(batch)
            .map_err(|e| TrieError::Io(e.to_string()))
    }

    fn iterate(&self, ctx: &OpContext, visitor: &mut DBIterVisitor<'_>) -> Result<(), TrieError> {
        for item in self.db.iterator(IteratorMode::Start) {
            ctx.check_cancelled()?;
            let (key_bytes, value_bytes) = item.map_err(|e| TrieError::Io(e.to_string()))?;
            if key_bytes.len() != 32 {
                return Err(TrieError::Structural(format!(
                    "non-hash key of length {} in node column",
                    key_bytes.len()
                )));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&key_bytes);
            let node = Self::decode_checked(&key, &value_bytes)?;
            visitor(&key, &node)?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.db
            .iterator(IteratorMode::Start)
            .filter(|item| item.is_ok())
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{LeafNode, ValueNode};
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
    fn roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = RocksNodeDB::open_default(dir.path().join("nodes")).unwrap();
        let (key, node) = leaf("0102", "persisted", 3);
        db.put_node(&key, &node).unwrap();
        assert_eq!(db.get_node(&key).unwrap(), node);
        let vn = Node::Value(ValueNode::new(b"payload".to_vec(), 3));
        db.put_node(&vn.hash_key(), &vn).unwrap();
        assert_eq!(db.get_node(&vn.hash_key()).unwrap(), vn);
        assert_eq!(db.size(), 2);
        db.delete_node(&key).unwrap();
        assert!(matches!(
            db.get_node(&key),
            Err(TrieError::NodeNotFound(_))
        ));
    }

    #[test]
    fn corrupted_entry_is_structural() {
        let dir = tempfile::tempdir().unwrap();
        let db = RocksNodeDB::open_default(dir.path().join("nodes")).unwrap();
        let (key, node) = leaf("0102", "v", 0);
        // store under the wrong key
        db.db.put([0xab; 32], node.encode()).unwrap();
        db.put_node(&key, &node).unwrap();
        assert!(matches!(
            db.get_node(&[0xab; 32]),
            Err(TrieError::Structural(_))
        ));
    }

    #[test]
    fn batched_writes_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let db = RocksNodeDB::open_default(dir.path().join("nodes")).unwrap();
        let entries: Vec<_> = (0..10u64)
            .map(|i| leaf(&format!("0{}", i % 10), &format!("v{i}"), i))
            .collect();
        db.multi_put(&entries).unwrap();
        db.prune_below_version(&OpContext::background(), 5).unwrap();
        let mut remaining = 0;
        db.iterate(&OpContext::background(), &mut |_, node| {
            assert!(node.version() >= 5);
            remaining += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(remaining, 5);
    }
}
