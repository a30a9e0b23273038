//! Reassembly of a contiguous chain slice from out-of-order worker results.
//!
//! One assembler runs per batch cycle. It owns a slice covering
//! `[start_at, start_at + expected)` and keeps consuming worker results —
//! validating, penalizing and re-requesting as needed — until every slot is
//! filled or the engine stops.

use crate::error::{ResponseValidationError, SyncError};
use crate::traits::{BlockState, Network};
use crate::worker_pool::{SyncTaskResult, SyncWorkerPool};
use dot_network::{
    BlockRequest, Direction, FromBlock, ReputationChange, RequestError, BOOTSTRAP_REQUEST_DATA,
    REQUEST_BODY, REQUEST_HEADER, REQUEST_JUSTIFICATION,
};
use dot_types::{BlockData, Hash, Header};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How long the assembler waits without results before re-seeding the pool.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Assembles one contiguous run of blocks across arbitrarily many responses.
pub struct ChainAssembler {
    pool: Arc<SyncWorkerPool>,
    network: Arc<dyn Network>,
    block_state: Arc<dyn BlockState>,
    bad_blocks: Vec<Hash>,
    cancel: CancellationToken,
}

impl ChainAssembler {
    /// Create an assembler over the engine's collaborators.
    pub fn new(
        pool: Arc<SyncWorkerPool>,
        network: Arc<dyn Network>,
        block_state: Arc<dyn BlockState>,
        bad_blocks: Vec<Hash>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            network,
            block_state,
            bad_blocks,
            cancel,
        }
    }

    /// Fill the slice `[start_at, start_at + expected)` from worker results.
    ///
    /// Returns `None` when the stop signal fired mid-cycle, otherwise the
    /// complete ascending run of blocks.
    pub async fn handle_workers_results(
        &self,
        results_tx: mpsc::UnboundedSender<SyncTaskResult>,
        mut results_rx: mpsc::UnboundedReceiver<SyncTaskResult>,
        start_at: u64,
        expected: u32,
    ) -> Result<Option<Vec<BlockData>>, SyncError> {
        let mut slice: Vec<Option<BlockData>> = vec![None; expected as usize];

        while slice.iter().any(Option::is_none) {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                    warn!("no results for a while, re-seeding the worker pool");
                    self.pool.use_connected_peers();
                    continue;
                }
                maybe = results_rx.recv() => match maybe {
                    Some(result) => result,
                    None => return Ok(None),
                },
            };

            let SyncTaskResult {
                who,
                request,
                response,
                error,
            } = result;
            debug!(peer = %who, failed = error.is_some(), "worker task result");

            if let Some(request_error) = error {
                if !matches!(request_error, RequestError::EmptyMessage) {
                    error!(peer = %who, error = %request_error, "block request failed");
                    if matches!(request_error, RequestError::ProtocolNotSupported) {
                        self.network
                            .report_peer(ReputationChange::bad_protocol(), &who);
                        self.pool.punish_peer(&who);
                    }
                }
                self.resubmit(request, &results_tx)?;
                continue;
            }

            let mut blocks = response.map(|response| response.blocks).unwrap_or_default();

            if request.direction == Direction::Descending {
                blocks.reverse();
            }

            if blocks.is_empty() {
                // an empty response is short by definition: ask again in full
                self.resubmit(request, &results_tx)?;
                continue;
            }

            if let Err(validation_error) = validate_response_fields(request.requested_data, &blocks)
            {
                error!(peer = %who, error = %validation_error, "validating response fields");
                if matches!(validation_error, ResponseValidationError::NilHeader(_)) {
                    self.network
                        .report_peer(ReputationChange::incomplete_header(), &who);
                }
                self.resubmit(request, &results_tx)?;
                continue;
            }

            if !is_response_a_chain(&blocks) {
                error!(peer = %who, "response is not a chain");
                self.resubmit(request, &results_tx)?;
                continue;
            }

            if !response_grows_chain(&blocks, &slice, start_at) {
                error!(peer = %who, "response does not grow the ongoing chain");
                self.resubmit(request, &results_tx)?;
                continue;
            }

            if let Some(bad) = blocks
                .iter()
                .find(|block| self.bad_blocks.contains(&block.hash))
            {
                error!(peer = %who, block = %bad.hash, "peer sent a known bad block");
                self.network
                    .report_peer(ReputationChange::bad_block_announcement(), &who);
                self.pool.ignore_peer_as_worker(&who);
                self.resubmit(request, &results_tx)?;
                continue;
            }

            let received = blocks.len() as u32;
            let last_number = blocks.last().and_then(BlockData::number);
            for block in blocks {
                if let Some(number) = block.number() {
                    let index = (number - start_at) as usize;
                    slice[index] = Some(block);
                }
            }

            // a short response leaves an ascending suffix uncovered
            if received < request.max {
                if let Some(last_number) = last_number {
                    let follow_up = BlockRequest::new(
                        BOOTSTRAP_REQUEST_DATA,
                        FromBlock::Number(last_number + 1),
                        Direction::Ascending,
                        request.max - received,
                    );
                    self.resubmit(follow_up, &results_tx)?;
                }
            }
        }

        Ok(Some(slice.into_iter().flatten().collect()))
    }

    fn resubmit(
        &self,
        request: BlockRequest,
        results_tx: &mpsc::UnboundedSender<SyncTaskResult>,
    ) -> Result<(), SyncError> {
        if self.block_state.is_paused() {
            return Err(SyncError::BlockStatePaused);
        }
        self.pool.submit_request(request, None, results_tx.clone());
        Ok(())
    }
}

/// Check that every requested field is present in every block of a response.
pub(crate) fn validate_response_fields(
    requested_data: u8,
    blocks: &[BlockData],
) -> Result<(), ResponseValidationError> {
    for block in blocks {
        if requested_data & REQUEST_HEADER != 0 && block.header.is_none() {
            return Err(ResponseValidationError::NilHeader(block.hash));
        }
        if requested_data & REQUEST_BODY != 0 && block.body.is_none() {
            return Err(ResponseValidationError::NilBody(block.hash));
        }
        // only enforced when strictly justifications were requested
        if requested_data == REQUEST_JUSTIFICATION && block.justification.is_none() {
            return Err(ResponseValidationError::NilJustification(block.hash));
        }
    }
    Ok(())
}

/// Check that adjacent response blocks are parent and child.
pub(crate) fn is_response_a_chain(blocks: &[BlockData]) -> bool {
    if blocks.len() < 2 {
        return true;
    }

    for pair in blocks.windows(2) {
        let (Some(parent), Some(child)) = (header_of(&pair[0]), header_of(&pair[1])) else {
            return false;
        };
        if parent.hash() != child.parent_hash {
            return false;
        }
    }
    true
}

/// Check that a response joins cleanly onto the partially-filled slice: every
/// block must land inside the slice, the block left of the response's first
/// must be its parent, and the block right of its last must be its child.
pub(crate) fn response_grows_chain(
    response: &[BlockData],
    slice: &[Option<BlockData>],
    start_at: u64,
) -> bool {
    if slice.is_empty() || response.is_empty() {
        return true;
    }

    // out-of-range numbers cannot be placed anywhere
    for block in response {
        let Some(number) = block.number() else {
            return false;
        };
        let Some(index) = number.checked_sub(start_at) else {
            return false;
        };
        if index as usize >= slice.len() {
            return false;
        }
    }

    let links_to = |parent: &BlockData, child: &BlockData| -> bool {
        match (header_of(parent), header_of(child)) {
            (Some(parent), Some(child)) => parent.hash() == child.parent_hash,
            _ => false,
        }
    };

    let first = &response[0];
    let first_index = (first.number().unwrap_or_default() - start_at) as usize;
    if first_index > 0 {
        if let Some(left) = &slice[first_index - 1] {
            if !links_to(left, first) {
                return false;
            }
        }
    }

    let last = response.last().unwrap_or(first);
    let last_index = (last.number().unwrap_or_default() - start_at) as usize;
    if last_index + 1 < slice.len() {
        if let Some(right) = &slice[last_index + 1] {
            if !links_to(last, right) {
                return false;
            }
        }
    }

    true
}

fn header_of(block: &BlockData) -> Option<&Header> {
    block.header.as_ref()
}
