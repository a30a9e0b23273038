//! # dot-network
//!
//! Network-facing vocabulary consumed by the sync engine.
//!
//! This crate provides:
//! - Peer identifiers
//! - Block request and response messages with wire-exact constants
//! - Typed request failures
//! - Reputation deltas reported against misbehaving peers

mod error;
mod messages;
mod peer;
mod reputation;

pub use error::RequestError;
pub use messages::{
    ascending_block_requests, BlockRequest, BlockResponse, Direction, FromBlock,
    BOOTSTRAP_REQUEST_DATA, REQUEST_BODY, REQUEST_HEADER, REQUEST_JUSTIFICATION,
};
pub use peer::PeerId;
pub use reputation::ReputationChange;

/// Maximum number of blocks a single response may carry.
///
/// Protocol-level constant; request constructors clamp to it.
pub const MAX_BLOCKS_IN_RESPONSE: u32 = 128;
