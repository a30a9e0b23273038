//! # dot-types
//!
//! Chain data model for the dot-host node.
//!
//! This crate provides:
//! - 32-byte block hashes with blake2b-256 hashing
//! - Block headers with parent linkage and state commitments
//! - Blocks, bodies and extrinsics
//! - Partially-populated block data as exchanged during sync

mod block;
mod hash;
mod header;

pub use block::{Block, BlockData, Body, Extrinsic, FinalityInfo};
pub use hash::{blake2b_256, Hash};
pub use header::{Digest, DigestItem, Header};

/// Parent hash carried by the genesis header.
pub const GENESIS_PARENT_HASH: Hash = Hash::zero();
