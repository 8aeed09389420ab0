//! Ambient operation context: cancellation and prune observability.
//!
//! Long-running operations (iterate, mark, sweep) take an [`OpContext`] and
//! consult it between node visits. An absent stats sink is a no-op.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::TrieError;

/// Stage the prune cycle is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneStage {
    Start,
    Update,
    Delete,
    Complete,
}

impl PruneStage {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Update,
            2 => Self::Delete,
            3 => Self::Complete,
            _ => Self::Start,
        }
    }
}

/// Counters carried through the mark and sweep phases.
#[derive(Debug, Default)]
pub struct PruneStats {
    stage: AtomicU8,
    total: AtomicU64,
    below_version: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    missing: AtomicU64,
}

impl PruneStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> PruneStage {
        PruneStage::from_u8(self.stage.load(Ordering::Relaxed))
    }

    pub fn set_stage(&self, stage: PruneStage) {
        self.stage.store(stage as u8, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn below_version(&self) -> u64 {
        self.below_version.load(Ordering::Relaxed)
    }

    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::Relaxed)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    pub fn missing(&self) -> u64 {
        self.missing.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_below_version(&self) {
        self.below_version.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_updated(&self) {
        self.updated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_deleted(&self, n: u64) {
        self.deleted.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_missing(&self) {
        self.missing.fetch_add(1, Ordering::Relaxed);
    }
}

/// Context accompanying trie and DB operations.
#[derive(Clone, Default)]
pub struct OpContext {
    cancel: Option<Arc<AtomicBool>>,
    prune_stats: Option<Arc<PruneStats>>,
}

impl OpContext {
    /// A context with no cancellation signal and no stats sink.
    pub fn background() -> Self {
        Self::default()
    }

    /// Attaches a cancellation flag. Operations return
    /// [`TrieError::Cancelled`] at the next node boundary once it is set.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Attaches a prune-stats sink.
    pub fn with_prune_stats(mut self, stats: Arc<PruneStats>) -> Self {
        self.prune_stats = Some(stats);
        self
    }

    pub fn prune_stats(&self) -> Option<&PruneStats> {
        self.prune_stats.as_deref()
    }

    pub fn check_cancelled(&self) -> Result<(), TrieError> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(TrieError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_never_cancels() {
        let ctx = OpContext::background();
        assert!(ctx.check_cancelled().is_ok());
        assert!(ctx.prune_stats().is_none());
    }

    #[test]
    fn cancel_flag_observed() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = OpContext::background().with_cancel(flag.clone());
        assert!(ctx.check_cancelled().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert!(matches!(ctx.check_cancelled(), Err(TrieError::Cancelled)));
    }

    #[test]
    fn stats_counters() {
        let stats = Arc::new(PruneStats::new());
        let ctx = OpContext::background().with_prune_stats(stats.clone());
        let ps = ctx.prune_stats().unwrap();
        ps.inc_total();
        ps.inc_total();
        ps.inc_below_version();
        ps.add_deleted(5);
        ps.set_stage(PruneStage::Delete);
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.below_version(), 1);
        assert_eq!(stats.deleted(), 5);
        assert_eq!(stats.stage(), PruneStage::Delete);
    }
}
