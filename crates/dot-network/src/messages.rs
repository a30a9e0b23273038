//! Block request and response messages.

use crate::MAX_BLOCKS_IN_RESPONSE;
use dot_types::{BlockData, Hash};

/// Request the block header.
pub const REQUEST_HEADER: u8 = 0b0000_0001;
/// Request the block body.
pub const REQUEST_BODY: u8 = 0b0000_0010;
/// Request the finality justification.
pub const REQUEST_JUSTIFICATION: u8 = 0b0000_0100;
/// The bundle requested while bootstrapping: header, body and justification.
pub const BOOTSTRAP_REQUEST_DATA: u8 = REQUEST_HEADER | REQUEST_BODY | REQUEST_JUSTIFICATION;

/// Direction in which the response blocks are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// From the starting block towards higher numbers.
    Ascending = 0,
    /// From the starting block towards lower numbers.
    Descending = 1,
}

impl Direction {
    /// Wire encoding of the direction.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The block a request starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromBlock {
    /// Anchor at a block hash.
    Hash(Hash),
    /// Anchor at a block number.
    Number(u64),
}

/// A request for a run of blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    /// Bitmask of the fields the response must carry.
    pub requested_data: u8,
    /// Starting block of the run.
    pub from: FromBlock,
    /// Orientation of the run.
    pub direction: Direction,
    /// Maximum number of blocks to return, at most [`MAX_BLOCKS_IN_RESPONSE`].
    pub max: u32,
}

impl BlockRequest {
    /// Create a request, clamping `max` into `1..=MAX_BLOCKS_IN_RESPONSE`.
    pub fn new(requested_data: u8, from: FromBlock, direction: Direction, max: u32) -> Self {
        Self {
            requested_data,
            from,
            direction,
            max: max.clamp(1, MAX_BLOCKS_IN_RESPONSE),
        }
    }
}

impl std::fmt::Display for BlockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let anchor = match &self.from {
            FromBlock::Hash(hash) => hash.short(),
            FromBlock::Number(number) => format!("#{number}"),
        };
        let direction = match self.direction {
            Direction::Ascending => "ascending",
            Direction::Descending => "descending",
        };
        write!(f, "{} blocks {} from {}", self.max, direction, anchor)
    }
}

/// An ordered run of blocks answering a [`BlockRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockResponse {
    /// The blocks, oriented per the request direction.
    pub blocks: Vec<BlockData>,
}

/// Split `[start, target]` into ascending number-anchored batches of at most
/// [`MAX_BLOCKS_IN_RESPONSE`] blocks each. The final batch may be smaller.
///
/// Returns an empty plan when `start > target`.
pub fn ascending_block_requests(start: u64, target: u64, requested_data: u8) -> Vec<BlockRequest> {
    if start > target {
        return Vec::new();
    }

    let total = target - start + 1;
    let batches = total.div_ceil(u64::from(MAX_BLOCKS_IN_RESPONSE));
    let mut requests = Vec::with_capacity(batches as usize);

    let mut remaining = total;
    let mut from = start;
    while remaining > 0 {
        let max = remaining.min(u64::from(MAX_BLOCKS_IN_RESPONSE)) as u32;
        requests.push(BlockRequest::new(
            requested_data,
            FromBlock::Number(from),
            Direction::Ascending,
            max,
        ));
        from += u64::from(max);
        remaining -= u64::from(max);
    }

    requests
}
