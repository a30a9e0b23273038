//! Request planning for bootstrap batches and descending gap fills.

use dot_network::{
    ascending_block_requests, BlockRequest, Direction, FromBlock, BOOTSTRAP_REQUEST_DATA,
    MAX_BLOCKS_IN_RESPONSE,
};
use dot_types::Hash;

/// Upper bound on the number of batches planned per bootstrap cycle.
pub const MAX_REQUESTS_ALLOWED: u32 = 40;

/// Plan the ascending batches of one bootstrap cycle.
///
/// The cycle covers from the block after `best_number` up to a virtual target
/// of [`MAX_REQUESTS_ALLOWED`] full batches, clamped to the real `target`
/// observed from peers.
pub fn max_blocks_request_plan(best_number: u64, target: u64) -> Vec<BlockRequest> {
    let start = best_number + 1;
    let virtual_target =
        start + u64::from(MAX_REQUESTS_ALLOWED) * u64::from(MAX_BLOCKS_IN_RESPONSE);
    let bounded_target = virtual_target.min(target);

    ascending_block_requests(start, bounded_target, BOOTSTRAP_REQUEST_DATA)
}

/// A single descending request anchored at `start`, covering at most
/// `gap_length` blocks (clamped to [`MAX_BLOCKS_IN_RESPONSE`]).
pub fn descending_request(start: Hash, gap_length: u32) -> BlockRequest {
    BlockRequest::new(
        BOOTSTRAP_REQUEST_DATA,
        FromBlock::Hash(start),
        Direction::Descending,
        gap_length.min(MAX_BLOCKS_IN_RESPONSE),
    )
}

/// Total number of blocks a plan will deliver when fully served.
pub fn planned_block_count(requests: &[BlockRequest]) -> u32 {
    requests.iter().map(|request| request.max).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_is_bounded_by_real_target() {
        let requests = max_blocks_request_plan(0, 500);
        assert_eq!(requests.len(), 4);
        assert_eq!(planned_block_count(&requests), 500);
        assert_eq!(requests[0].from, FromBlock::Number(1));
    }

    #[test]
    fn test_plan_is_bounded_by_virtual_target() {
        let requests = max_blocks_request_plan(0, 1_000_000);
        assert_eq!(requests.len(), MAX_REQUESTS_ALLOWED as usize);
        assert_eq!(
            planned_block_count(&requests),
            MAX_REQUESTS_ALLOWED * MAX_BLOCKS_IN_RESPONSE
        );
    }

    #[test]
    fn test_plan_then_fulfill_law() {
        // the plan always covers target - start + 1 blocks, unless capped
        for (best, target) in [(0u64, 1u64), (0, 128), (0, 129), (99, 500), (10, 11)] {
            let requests = max_blocks_request_plan(best, target);
            assert_eq!(u64::from(planned_block_count(&requests)), target - best);
        }
    }

    #[test]
    fn test_plan_is_empty_at_target() {
        assert!(max_blocks_request_plan(500, 500).is_empty());
        assert!(max_blocks_request_plan(501, 500).is_empty());
    }

    #[test]
    fn test_descending_request_is_clamped() {
        let request = descending_request(Hash::zero(), 500);
        assert_eq!(request.max, MAX_BLOCKS_IN_RESPONSE);
        assert_eq!(request.direction, Direction::Descending);

        let request = descending_request(Hash::zero(), 5);
        assert_eq!(request.max, 5);
    }
}
