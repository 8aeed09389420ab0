//! Nibble paths.
//!
//! Trie keys are ordered sequences of hex nibbles (values 0..=15). Byte keys
//! supplied by callers are expanded to two nibbles per byte on entry.

use smallvec::SmallVec;

use crate::error::TrieError;

/// A sequence of nibbles. Small keys stay on the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path {
    data: SmallVec<[u8; 64]>,
}

impl Path {
    /// Creates an empty path.
    pub fn new() -> Self {
        Self {
            data: SmallVec::new(),
        }
    }

    /// Expands a byte key into nibbles, two per byte, high nibble first.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = SmallVec::with_capacity(bytes.len() * 2);
        for byte in bytes {
            data.push(byte >> 4);
            data.push(byte & 0x0f);
        }
        Self { data }
    }

    /// Builds a path from raw nibble values.
    ///
    /// Returns `InvalidInput` if any value exceeds 15.
    pub fn from_nibbles(nibbles: &[u8]) -> Result<Self, TrieError> {
        if nibbles.iter().any(|&n| n > 0x0f) {
            return Err(TrieError::InvalidInput("nibble value out of range"));
        }
        Ok(Self {
            data: SmallVec::from_slice(nibbles),
        })
    }

    /// Parses an ASCII hex string, one nibble per character.
    pub fn from_hex(s: &str) -> Result<Self, TrieError> {
        let mut data = SmallVec::with_capacity(s.len());
        for c in s.chars() {
            let nib = c
                .to_digit(16)
                .ok_or(TrieError::InvalidInput("non-hex character in path"))?;
            data.push(nib as u8);
        }
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.data.get(index).copied()
    }

    pub fn first(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Returns the tail starting at `offset`.
    pub fn slice_from(&self, offset: usize) -> Self {
        if offset >= self.data.len() {
            return Self::new();
        }
        Self {
            data: SmallVec::from_slice(&self.data[offset..]),
        }
    }

    /// Returns the head of at most `len` nibbles.
    pub fn slice_to(&self, len: usize) -> Self {
        let end = len.min(self.data.len());
        Self {
            data: SmallVec::from_slice(&self.data[..end]),
        }
    }

    /// Length of the shared prefix with `other`.
    pub fn common_prefix_len(&self, other: &Path) -> usize {
        self.data
            .iter()
            .zip(other.data.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.data.len() >= prefix.data.len() && self.data[..prefix.data.len()] == prefix.data[..]
    }

    pub fn push(&mut self, nibble: u8) {
        debug_assert!(nibble < 16);
        self.data.push(nibble);
    }

    pub fn extend(&mut self, other: &Path) {
        self.data.extend_from_slice(&other.data);
    }

    /// Returns `self ++ other` without mutating either.
    pub fn concat(&self, other: &Path) -> Self {
        let mut result = self.clone();
        result.extend(other);
        result
    }

    /// Returns `self ++ [nibble]`.
    pub fn child(&self, nibble: u8) -> Self {
        let mut result = self.clone();
        result.push(nibble);
        result
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for nibble in &self.data {
            write!(f, "{nibble:x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_expands_nibbles() {
        let path = Path::from_bytes(&[0x12, 0x34, 0xab]);
        assert_eq!(path.len(), 6);
        assert_eq!(path.as_slice(), &[1, 2, 3, 4, 10, 11]);
    }

    #[test]
    fn from_hex_matches_from_bytes() {
        assert_eq!(
            Path::from_hex("1234ab").unwrap(),
            Path::from_bytes(&[0x12, 0x34, 0xab])
        );
        assert_eq!(Path::from_hex("cafe0").unwrap().len(), 5);
        assert!(Path::from_hex("xyz").is_err());
    }

    #[test]
    fn from_nibbles_rejects_out_of_range() {
        assert!(Path::from_nibbles(&[1, 2, 16]).is_err());
        assert_eq!(Path::from_nibbles(&[0, 15]).unwrap().len(), 2);
    }

    #[test]
    fn slicing() {
        let path = Path::from_bytes(&[0x12, 0x34]);
        assert_eq!(path.slice_from(1).as_slice(), &[2, 3, 4]);
        assert_eq!(path.slice_to(2).as_slice(), &[1, 2]);
        assert!(path.slice_from(10).is_empty());
    }

    #[test]
    fn common_prefix() {
        let a = Path::from_bytes(&[0x12, 0x34]);
        let b = Path::from_bytes(&[0x12, 0x56]);
        assert_eq!(a.common_prefix_len(&b), 2);
        assert!(a.starts_with(&a.slice_to(3)));
        assert!(!a.starts_with(&b));
    }

    #[test]
    fn concat_and_child() {
        let a = Path::from_nibbles(&[1, 2]).unwrap();
        let b = Path::from_nibbles(&[3, 4]).unwrap();
        assert_eq!(a.concat(&b).as_slice(), &[1, 2, 3, 4]);
        assert_eq!(a.child(7).as_slice(), &[1, 2, 7]);
    }

    #[test]
    fn display_is_hex() {
        let path = Path::from_bytes(&[0xca, 0xfe]);
        assert_eq!(path.to_string(), "cafe");
    }
}
