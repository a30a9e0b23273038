//! # dot-sync
//!
//! Block synchronization engine for the dot-host node.
//!
//! This crate provides:
//! - The bootstrap/tip sync state machine driving a node to the chain head
//! - A per-peer worker pool multiplexing block requests
//! - Reassembly of contiguous chain slices from out-of-order responses
//! - The disjoint set of announced-but-unready blocks
//! - Peer view tracking from which the sync target is derived
//!
//! The engine consumes the rest of the node exclusively through the
//! collaborator traits in [`traits`]: chain database, storage, transaction
//! pool, transport, runtime and the consensus verifiers are all injected at
//! construction.

mod assembler;
mod chain_sync;
mod disjoint;
mod error;
mod metrics;
#[cfg(test)]
mod mocks;
mod peer_view;
mod requests;
mod traits;
mod worker_pool;

pub use assembler::ChainAssembler;
pub use chain_sync::{
    BlockOrigin, ChainSync, ChainSyncConfig, SyncMode, DEFAULT_MIN_PEERS,
    DEFAULT_WAIT_PEERS_INTERVAL,
};
pub use disjoint::{
    DisjointBlockSet, DisjointBlockSetConfig, PendingBlock, PENDING_BLOCKS_LIMIT,
};
pub use error::{
    ExecutionError, ImportError, ResponseValidationError, StateError, SyncError, SyncResult,
    VerificationError,
};
pub use metrics::{SyncMetrics, SYNC_METRICS};
pub use peer_view::{PeerView, PeerViewSet};
pub use requests::{
    descending_request, max_blocks_request_plan, planned_block_count, MAX_REQUESTS_ALLOWED,
};
pub use traits::{
    BabeVerifier, BlockImportHandler, BlockState, FinalityGadget, Network, RequestMaker,
    RuntimeInstance, StorageState, Telemetry, TransactionState, TrieState,
};
pub use worker_pool::{SyncTaskResult, SyncWorkerPool, WorkerStatus};
