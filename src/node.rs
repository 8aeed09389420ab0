//! Trie node variants and their canonical encoding.
//!
//! Four variants make up the trie:
//! - `Value`: terminal payload, referenced by Leaf (embedded) or Full (by hash)
//! - `Leaf`: compresses a single-path terminal
//! - `Extension`: compresses a single-child internal chain
//! - `Full`: 16-way branch, optionally carrying a value at its own path
//!
//! Wire layout:
//!
//! ```text
//! stored := varint(version) || varint(origin) || tag(1) || body
//! tag    ∈ { Value = 1, Leaf = 2, Extension = 3, Full = 4 }
//!
//! Value     body := varint(len) || bytes
//! Leaf      body := path(prefix) || path(suffix) || varint(len) || bytes
//! Extension body := path || child hash (32)
//! Full      body := 17 slots (children 0..15, value), slot = 0x00 | 0x01 || hash
//! path           := varint(len) || nibble bytes
//! ```
//!
//! A node's hash covers everything except the leading `version` varint, so
//! lifting the version during the GC mark phase never moves a key. Value
//! nodes hash their raw payload bytes alone; the root of an empty trie is
//! therefore the SHA3-256 of empty input.

use integer_encoding::VarInt;

use crate::error::TrieError;
use crate::path::Path;
use crate::{sha3_256, HashKey, Version, HASH_SIZE};

/// Node-type mask bits for iteration filters.
pub const NODE_TYPE_VALUE: u8 = 1;
pub const NODE_TYPE_LEAF: u8 = 2;
pub const NODE_TYPE_FULL: u8 = 4;
pub const NODE_TYPE_EXTENSION: u8 = 8;
pub const NODE_TYPES_ALL: u8 =
    NODE_TYPE_VALUE | NODE_TYPE_LEAF | NODE_TYPE_FULL | NODE_TYPE_EXTENSION;

// Wire tags. Distinct from the mask bits above.
const TAG_VALUE: u8 = 1;
const TAG_LEAF: u8 = 2;
const TAG_EXTENSION: u8 = 3;
const TAG_FULL: u8 = 4;

/// Terminal payload node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueNode {
    pub origin: Version,
    pub version: Version,
    pub value: Vec<u8>,
}

impl ValueNode {
    pub fn new(value: Vec<u8>, origin: Version) -> Self {
        Self {
            origin,
            version: origin,
            value,
        }
    }
}

/// Single-path terminal. The full key of the stored value is
/// `prefix ++ path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub origin: Version,
    pub version: Version,
    /// Nibbles consumed from the root down to this leaf.
    pub prefix: Path,
    /// Remaining path suffix owned by the leaf.
    pub path: Path,
    /// Embedded value bytes.
    pub value: Vec<u8>,
}

impl LeafNode {
    pub fn new(prefix: Path, path: Path, value: Vec<u8>, origin: Version) -> Self {
        Self {
            origin,
            version: origin,
            prefix,
            path,
            value,
        }
    }
}

/// Single-child internal chain. The shared prefix is never empty and the
/// child never resolves to another Extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionNode {
    pub origin: Version,
    pub version: Version,
    pub path: Path,
    pub child: HashKey,
}

impl ExtensionNode {
    pub fn new(path: Path, child: HashKey, origin: Version) -> Self {
        Self {
            origin,
            version: origin,
            path,
            child,
        }
    }
}

/// 16-way branch node. `value` references a standalone [`ValueNode`] holding
/// the value stored exactly at this node's path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullNode {
    pub origin: Version,
    pub version: Version,
    pub children: [Option<HashKey>; 16],
    pub value: Option<HashKey>,
}

impl FullNode {
    pub fn new(origin: Version) -> Self {
        Self {
            origin,
            version: origin,
            children: [None; 16],
            value: None,
        }
    }

    /// Number of occupied child slots.
    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_some()).count()
    }

    /// Outgoing references: children plus the value slot.
    pub fn outgoing(&self) -> usize {
        self.child_count() + usize::from(self.value.is_some())
    }

    /// Index of the only occupied child slot, if exactly one is occupied.
    pub fn single_child_index(&self) -> Option<u8> {
        let mut found = None;
        for (i, child) in self.children.iter().enumerate() {
            if child.is_some() {
                if found.is_some() {
                    return None;
                }
                found = Some(i as u8);
            }
        }
        found
    }
}

/// A trie node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Value(ValueNode),
    Leaf(LeafNode),
    Extension(ExtensionNode),
    Full(FullNode),
}

impl Node {
    /// The node's mask bit, used with iteration filters.
    pub fn node_type(&self) -> u8 {
        match self {
            Node::Value(_) => NODE_TYPE_VALUE,
            Node::Leaf(_) => NODE_TYPE_LEAF,
            Node::Extension(_) => NODE_TYPE_EXTENSION,
            Node::Full(_) => NODE_TYPE_FULL,
        }
    }

    pub fn origin(&self) -> Version {
        match self {
            Node::Value(n) => n.origin,
            Node::Leaf(n) => n.origin,
            Node::Extension(n) => n.origin,
            Node::Full(n) => n.origin,
        }
    }

    /// Latest-touch stamp; compared against the prune watermark.
    pub fn version(&self) -> Version {
        match self {
            Node::Value(n) => n.version,
            Node::Leaf(n) => n.version,
            Node::Extension(n) => n.version,
            Node::Full(n) => n.version,
        }
    }

    pub fn set_version(&mut self, version: Version) {
        match self {
            Node::Value(n) => n.version = version,
            Node::Leaf(n) => n.version = version,
            Node::Extension(n) => n.version = version,
            Node::Full(n) => n.version = version,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Node::Value(_) => TAG_VALUE,
            Node::Leaf(_) => TAG_LEAF,
            Node::Extension(_) => TAG_EXTENSION,
            Node::Full(_) => TAG_FULL,
        }
    }

    fn body(&self, out: &mut Vec<u8>) {
        match self {
            Node::Value(n) => {
                write_bytes(out, &n.value);
            }
            Node::Leaf(n) => {
                write_path(out, &n.prefix);
                write_path(out, &n.path);
                write_bytes(out, &n.value);
            }
            Node::Extension(n) => {
                write_path(out, &n.path);
                out.extend_from_slice(&n.child);
            }
            Node::Full(n) => {
                for slot in n.children.iter().chain(std::iter::once(&n.value)) {
                    match slot {
                        None => out.push(0x00),
                        Some(key) => {
                            out.push(0x01);
                            out.extend_from_slice(key);
                        }
                    }
                }
            }
        }
    }

    /// The hashed portion of the encoding: origin, tag and body.
    fn hashed_encoding(&self) -> Vec<u8> {
        let mut out = self.origin().encode_var_vec();
        out.push(self.tag());
        self.body(&mut out);
        out
    }

    /// Full stored encoding, version stamp first.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.version().encode_var_vec();
        out.extend_from_slice(&self.hashed_encoding());
        out
    }

    /// Content hash identifying this node across all DB layers.
    ///
    /// Value nodes hash their payload bytes alone so that logically equal
    /// values share an identity regardless of when they were written.
    pub fn hash_key(&self) -> HashKey {
        match self {
            Node::Value(n) => sha3_256(&n.value),
            _ => sha3_256(&self.hashed_encoding()),
        }
    }

    /// Parses a stored encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, TrieError> {
        let mut r = Reader::new(bytes);
        let version = r.varint()?;
        let origin = r.varint()?;
        let tag = r.byte()?;
        let mut node = match tag {
            TAG_VALUE => Node::Value(ValueNode::new(r.bytes_field()?, origin)),
            TAG_LEAF => {
                let prefix = r.path_field()?;
                let path = r.path_field()?;
                let value = r.bytes_field()?;
                Node::Leaf(LeafNode::new(prefix, path, value, origin))
            }
            TAG_EXTENSION => {
                let path = r.path_field()?;
                let child = r.hash()?;
                Node::Extension(ExtensionNode::new(path, child, origin))
            }
            TAG_FULL => {
                let mut full = FullNode::new(origin);
                for i in 0..17 {
                    let slot = match r.byte()? {
                        0x00 => None,
                        0x01 => Some(r.hash()?),
                        other => {
                            return Err(TrieError::Decode(format!(
                                "invalid full-node slot marker {other:#04x}"
                            )))
                        }
                    };
                    if i < 16 {
                        full.children[i] = slot;
                    } else {
                        full.value = slot;
                    }
                }
                Node::Full(full)
            }
            other => return Err(TrieError::Decode(format!("unknown node tag {other}"))),
        };
        if !r.at_end() {
            return Err(TrieError::Decode("trailing bytes after node".into()));
        }
        node.set_version(version);
        Ok(node)
    }
}

fn write_path(out: &mut Vec<u8>, path: &Path) {
    out.extend_from_slice(&(path.len() as u64).encode_var_vec());
    out.extend_from_slice(path.as_slice());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).encode_var_vec());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn varint(&mut self) -> Result<u64, TrieError> {
        let (value, read) = u64::decode_var(&self.buf[self.pos..])
            .ok_or_else(|| TrieError::Decode("truncated varint".into()))?;
        self.pos += read;
        Ok(value)
    }

    fn byte(&mut self) -> Result<u8, TrieError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| TrieError::Decode("unexpected end of node bytes".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], TrieError> {
        if self.pos + len > self.buf.len() {
            return Err(TrieError::Decode("unexpected end of node bytes".into()));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn bytes_field(&mut self) -> Result<Vec<u8>, TrieError> {
        let len = self.varint()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn path_field(&mut self) -> Result<Path, TrieError> {
        let len = self.varint()? as usize;
        Path::from_nibbles(self.take(len)?)
            .map_err(|_| TrieError::Decode("nibble out of range in path".into()))
    }

    fn hash(&mut self) -> Result<HashKey, TrieError> {
        let mut key = [0u8; HASH_SIZE];
        key.copy_from_slice(self.take(HASH_SIZE)?);
        Ok(key)
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EMPTY_ROOT;

    fn roundtrip(node: &Node) -> Node {
        let decoded = Node::decode(&node.encode()).unwrap();
        assert_eq!(&decoded, node);
        decoded
    }

    #[test]
    fn value_roundtrip_and_hash() {
        let node = Node::Value(ValueNode::new(b"hello".to_vec(), 7));
        roundtrip(&node);
        assert_eq!(node.hash_key(), sha3_256(b"hello"));

        let empty = Node::Value(ValueNode::new(Vec::new(), 0));
        assert_eq!(empty.hash_key(), EMPTY_ROOT);
    }

    #[test]
    fn leaf_roundtrip() {
        let node = Node::Leaf(LeafNode::new(
            Path::from_hex("12").unwrap(),
            Path::from_hex("3456").unwrap(),
            b"payload".to_vec(),
            2016,
        ));
        roundtrip(&node);
    }

    #[test]
    fn extension_roundtrip() {
        let node = Node::Extension(ExtensionNode::new(
            Path::from_hex("abc").unwrap(),
            [0xaa; 32],
            3,
        ));
        roundtrip(&node);
    }

    #[test]
    fn full_roundtrip() {
        let mut full = FullNode::new(9);
        full.children[0] = Some([0x11; 32]);
        full.children[15] = Some([0x22; 32]);
        full.value = Some([0x33; 32]);
        let node = Node::Full(full);
        roundtrip(&node);
    }

    #[test]
    fn version_is_not_hashed() {
        let mut a = Node::Leaf(LeafNode::new(
            Path::new(),
            Path::from_hex("01").unwrap(),
            b"v".to_vec(),
            5,
        ));
        let key = a.hash_key();
        a.set_version(999);
        assert_eq!(a.hash_key(), key);
        // but the stored encoding round-trips the lifted version
        let decoded = Node::decode(&a.encode()).unwrap();
        assert_eq!(decoded.version(), 999);
        assert_eq!(decoded.origin(), 5);
    }

    #[test]
    fn origin_is_hashed() {
        let a = Node::Leaf(LeafNode::new(
            Path::new(),
            Path::from_hex("01").unwrap(),
            b"v".to_vec(),
            5,
        ));
        let b = Node::Leaf(LeafNode::new(
            Path::new(),
            Path::from_hex("01").unwrap(),
            b"v".to_vec(),
            6,
        ));
        assert_ne!(a.hash_key(), b.hash_key());
    }

    #[test]
    fn full_node_accounting() {
        let mut full = FullNode::new(0);
        assert_eq!(full.outgoing(), 0);
        full.children[3] = Some([1; 32]);
        assert_eq!(full.single_child_index(), Some(3));
        full.children[7] = Some([2; 32]);
        assert_eq!(full.single_child_index(), None);
        full.value = Some([3; 32]);
        assert_eq!(full.outgoing(), 3);
        assert_eq!(full.child_count(), 2);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Node::decode(&[]).is_err());
        assert!(Node::decode(&[0x00, 0x00, 0x09]).is_err()); // unknown tag
        // leaf with truncated value field
        let node = Node::Leaf(LeafNode::new(
            Path::new(),
            Path::from_hex("01").unwrap(),
            b"value".to_vec(),
            0,
        ));
        let mut bytes = node.encode();
        bytes.truncate(bytes.len() - 2);
        assert!(Node::decode(&bytes).is_err());
        // trailing junk
        let mut bytes = node.encode();
        bytes.push(0xff);
        assert!(Node::decode(&bytes).is_err());
    }
}
