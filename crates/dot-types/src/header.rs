//! Block headers.

use crate::hash::{blake2b_256, Hash};

/// An opaque digest item (consensus engine logs, seals, pre-runtime data).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DigestItem(pub Vec<u8>);

impl DigestItem {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// The ordered list of digest items carried by a header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Digest(pub Vec<DigestItem>);

impl Digest {
    /// Number of items in the digest.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the digest carries no items.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Hash of the parent block.
    pub parent_hash: Hash,
    /// Block number.
    pub number: u64,
    /// Root of the post-execution state trie.
    pub state_root: Hash,
    /// Root of the extrinsics trie.
    pub extrinsics_root: Hash,
    /// Consensus digest items.
    pub digest: Digest,
}

impl Header {
    /// Create a new header.
    pub fn new(
        parent_hash: Hash,
        number: u64,
        state_root: Hash,
        extrinsics_root: Hash,
        digest: Digest,
    ) -> Self {
        Self {
            parent_hash,
            number,
            state_root,
            extrinsics_root,
            digest,
        }
    }

    /// Compute the header hash.
    ///
    /// The hash commits to every header field through a deterministic
    /// field encoding.
    pub fn hash(&self) -> Hash {
        blake2b_256(&self.encode())
    }

    /// Deterministic field encoding used for hashing.
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 8 + 32 + 32 + 16);
        out.extend_from_slice(self.parent_hash.as_bytes());
        out.extend_from_slice(&self.number.to_le_bytes());
        out.extend_from_slice(self.state_root.as_bytes());
        out.extend_from_slice(self.extrinsics_root.as_bytes());
        out.extend_from_slice(&(self.digest.0.len() as u32).to_le_bytes());
        for item in &self.digest.0 {
            out.extend_from_slice(&(item.0.len() as u32).to_le_bytes());
            out.extend_from_slice(&item.0);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: u64, parent_hash: Hash) -> Header {
        Header::new(
            parent_hash,
            number,
            Hash::zero(),
            Hash::zero(),
            Digest::default(),
        )
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = header(1, Hash::zero());
        let b = header(1, Hash::zero());
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_commits_to_every_field() {
        let base = header(1, Hash::zero());

        let mut other = base.clone();
        other.number = 2;
        assert_ne!(base.hash(), other.hash());

        let mut other = base.clone();
        other.state_root = Hash::from_bytes([1; 32]);
        assert_ne!(base.hash(), other.hash());

        let mut other = base.clone();
        other.digest = Digest(vec![DigestItem::from_bytes(vec![1, 2, 3])]);
        assert_ne!(base.hash(), other.hash());
    }

    #[test]
    fn test_parent_linkage() {
        let parent = header(1, Hash::zero());
        let child = header(2, parent.hash());
        assert_eq!(child.parent_hash, parent.hash());
    }
}
