//! Versioned, content-addressed Merkle Patricia Trie.
//!
//! This crate implements the state core of a blockchain node:
//! - A Merkle Patricia Trie whose nodes are identified by the SHA3-256 hash
//!   of their canonical encoding.
//! - A pluggable [`NodeDB`] storage layer with in-memory, persistent
//!   (RocksDB, behind the `rocksdb` feature) and layered-overlay backends.
//! - Change collection so a block's mutations can be merged from
//!   transaction-local tries and flushed atomically.
//! - Two-phase mark/sweep pruning keyed off per-node version stamps.
//!
//! Block producers open a [`MerklePatriciaTrie`] over a [`LevelNodeDB`]
//! stacked on the persistent state DB, nest one more layer per transaction,
//! merge transaction changes into the block trie, and save the block's
//! changes at finalization. A background job periodically lifts the version
//! of everything reachable from the live root ([`MerklePatriciaTrie::update_version`])
//! and then reclaims all nodes left below the watermark
//! ([`NodeDB::prune_below_version`]).

mod collector;
mod context;
pub mod db;
mod error;
mod node;
mod path;
mod trie;

pub use collector::{ChangeCollector, NodeChange};
pub use context::{OpContext, PruneStage, PruneStats};
pub use db::{merge_state, LevelNodeDB, MemoryNodeDB, NodeDB};
#[cfg(feature = "rocksdb")]
pub use db::{RocksNodeDB, RocksNodeDBConfig};
pub use error::TrieError;
pub use node::{
    ExtensionNode, FullNode, LeafNode, Node, ValueNode, NODE_TYPES_ALL, NODE_TYPE_EXTENSION,
    NODE_TYPE_FULL, NODE_TYPE_LEAF, NODE_TYPE_VALUE,
};
pub use path::Path;
pub use trie::MerklePatriciaTrie;

use sha3::{Digest, Sha3_256};

/// Monotonic epoch stamp carried by every node; the basis for pruning.
pub type Version = u64;

/// A node identity: SHA3-256 over the node's canonical encoding.
pub type HashKey = [u8; 32];

/// Size of a [`HashKey`] in bytes.
pub const HASH_SIZE: usize = 32;

/// Number of re-stamped nodes buffered before the mark phase flushes a
/// batch to the database, and the sweep phase's delete batch size.
pub const BATCH_SIZE: usize = 64;

/// Root hash of an empty trie: SHA3-256 of the empty value encoding.
pub const EMPTY_ROOT: HashKey = [
    0xa7, 0xff, 0xc6, 0xf8, 0xbf, 0x1e, 0xd7, 0x66, 0x51, 0xc1, 0x47, 0x56, 0xa0, 0x61, 0xd6,
    0x62, 0xf5, 0x80, 0xff, 0x4d, 0xe4, 0x3b, 0x49, 0xfa, 0x82, 0xd8, 0x0a, 0x4b, 0x80, 0xf8,
    0x43, 0x4a,
];

/// Hashes a byte slice with SHA3-256.
pub fn sha3_256(data: &[u8]) -> HashKey {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// An opaque serializable payload stored in the trie.
///
/// Encoding must be deterministic: identical logical values must encode
/// byte-for-byte identically, because the bytes participate in hashing.
/// The trie never interprets value contents.
pub trait Value: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, TrieError>;
}

/// Pass-through impl for callers that manage their own serialization.
impl Value for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(bytes: &[u8]) -> Result<Self, TrieError> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_is_sha3_of_empty() {
        assert_eq!(sha3_256(b""), EMPTY_ROOT);
        assert_eq!(
            hex::encode(EMPTY_ROOT),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn sha3_is_deterministic() {
        assert_eq!(sha3_256(b"hello"), sha3_256(b"hello"));
        assert_ne!(sha3_256(b"hello"), sha3_256(b"world"));
    }
}
