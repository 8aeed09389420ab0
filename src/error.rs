//! Error types for trie and node-database operations.

use thiserror::Error;

/// Errors raised by the trie core.
#[derive(Debug, Error)]
pub enum TrieError {
    /// A referenced node hash is absent from every layer of the DB, or a
    /// delete targeted a path that holds no value.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A lookup reached the end of its path without finding a value. This
    /// is a routine condition, not a failure of the trie.
    #[error("value not present")]
    ValueNotPresent,

    /// The caller supplied input the operation cannot act on.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// Node or value bytes could not be parsed.
    #[error("decode error: {0}")]
    Decode(String),

    /// Backend read/write failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The DB returned a node whose recomputed hash does not match the
    /// requested key, or an integrity check failed.
    #[error("structural error: {0}")]
    Structural(String),

    /// Cancellation was observed between node visits.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for TrieError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
