//! Blocks, bodies and sync block data.

use crate::hash::Hash;
use crate::header::Header;

/// An opaque extrinsic (transaction or inherent).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Extrinsic(pub Vec<u8>);

impl Extrinsic {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Byte length of the extrinsic.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the extrinsic is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The body of a block: its ordered extrinsics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Body(pub Vec<Extrinsic>);

impl Body {
    /// Total byte size of all extrinsics.
    pub fn byte_size(&self) -> usize {
        self.0.iter().map(Extrinsic::len).sum()
    }
}

/// A complete block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block header.
    pub header: Header,
    /// Block body.
    pub body: Body,
}

impl Block {
    /// Create a new block.
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }
}

/// Block data exchanged during synchronization.
///
/// Fields other than the hash may be absent depending on what was requested
/// from, or known by, the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    /// Block hash.
    pub hash: Hash,
    /// Block header, if known.
    pub header: Option<Header>,
    /// Block body, if known.
    pub body: Option<Body>,
    /// Finality justification, if any.
    pub justification: Option<Vec<u8>>,
}

impl BlockData {
    /// Block data carrying only a hash.
    pub fn from_hash(hash: Hash) -> Self {
        Self {
            hash,
            header: None,
            body: None,
            justification: None,
        }
    }

    /// The block number, when the header is known.
    pub fn number(&self) -> Option<u64> {
        self.header.as_ref().map(|header| header.number)
    }
}

/// Payload of a block finalisation notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalityInfo {
    /// The newly finalised header.
    pub header: Header,
}

impl FinalityInfo {
    /// Create a notification for `header`.
    pub fn new(header: Header) -> Self {
        Self { header }
    }
}
