//! Node storage abstraction.
//!
//! A [`NodeDB`] stores trie nodes keyed by their content hash. Three
//! implementations are provided:
//! - [`MemoryNodeDB`]: ordered in-memory store
//! - [`LevelNodeDB`]: writable in-memory overlay atop an arbitrary parent
//! - `RocksNodeDB` (feature `rocksdb`): persistent on-disk store
//!
//! Misses report `NodeNotFound`; a `put` of an already-present hash is a
//! no-op by content addressing; deleting an absent key is a no-op.

mod level;
mod memory;
#[cfg(feature = "rocksdb")]
mod rocks;

pub use level::LevelNodeDB;
pub use memory::MemoryNodeDB;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksNodeDB, RocksNodeDBConfig};

use metrics::counter;

use crate::context::{OpContext, PruneStage};
use crate::error::TrieError;
use crate::node::Node;
use crate::{HashKey, Version, BATCH_SIZE};

/// Visitor invoked for each `(key, node)` entry during DB iteration.
/// Returning an error aborts the walk.
pub type DBIterVisitor<'a> = dyn FnMut(&HashKey, &Node) -> Result<(), TrieError> + 'a;

/// Hash-keyed node storage.
pub trait NodeDB: Send + Sync {
    /// Fetches the node stored under `key`, or `NodeNotFound`.
    fn get_node(&self, key: &HashKey) -> Result<Node, TrieError>;

    /// Stores `node` under `key`.
    fn put_node(&self, key: &HashKey, node: &Node) -> Result<(), TrieError>;

    /// Removes the entry under `key`, if present.
    fn delete_node(&self, key: &HashKey) -> Result<(), TrieError>;

    /// Atomically stores a batch of nodes.
    fn multi_put(&self, entries: &[(HashKey, Node)]) -> Result<(), TrieError>;

    /// Atomically removes a batch of keys.
    fn multi_delete(&self, keys: &[HashKey]) -> Result<(), TrieError>;

    /// Visits every entry once. Order is implementation-defined but stable
    /// for a given contents.
    fn iterate(&self, ctx: &OpContext, visitor: &mut DBIterVisitor<'_>) -> Result<(), TrieError>;

    /// Number of stored entries.
    fn size(&self) -> u64;

    /// Sweep phase of the garbage collector: deletes every node whose
    /// latest-touch version is below `version`. Must only run after the
    /// mark phase lifted everything reachable from live roots.
    fn prune_below_version(&self, ctx: &OpContext, version: Version) -> Result<(), TrieError> {
        if let Some(stats) = ctx.prune_stats() {
            stats.set_stage(PruneStage::Delete);
        }
        let mut doomed = Vec::new();
        self.iterate(ctx, &mut |key, node| {
            if let Some(stats) = ctx.prune_stats() {
                stats.inc_total();
            }
            if node.version() < version {
                if let Some(stats) = ctx.prune_stats() {
                    stats.inc_below_version();
                }
                doomed.push(*key);
            }
            Ok(())
        })?;
        for chunk in doomed.chunks(BATCH_SIZE) {
            ctx.check_cancelled()?;
            self.multi_delete(chunk)?;
        }
        if let Some(stats) = ctx.prune_stats() {
            stats.add_deleted(doomed.len() as u64);
            stats.set_stage(PruneStage::Complete);
        }
        counter!("state_trie.pruned_nodes").increment(doomed.len() as u64);
        tracing::debug!(
            pruned = doomed.len(),
            watermark = version,
            "pruned nodes below version"
        );
        Ok(())
    }
}

/// Copies every node of `from` into `to`. Used to squash a layer chain into
/// a single DB (tests and operational tooling).
pub fn merge_state(
    ctx: &OpContext,
    from: &dyn NodeDB,
    to: &dyn NodeDB,
) -> Result<(), TrieError> {
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    from.iterate(ctx, &mut |key, node| {
        batch.push((*key, node.clone()));
        Ok(())
    })?;
    for chunk in batch.chunks(BATCH_SIZE) {
        to.multi_put(chunk)?;
    }
    Ok(())
}
