//! Collaborator interfaces taken by the sync engine at construction.
//!
//! The engine owns no global state: everything it needs from the rest of the
//! node — chain database, storage trie, transaction pool, transport, runtime,
//! consensus verifiers — is reached through the capability traits below.

use crate::error::{ExecutionError, ImportError, StateError, VerificationError};
use async_trait::async_trait;
use dot_network::{BlockRequest, BlockResponse, PeerId, ReputationChange, RequestError};
use dot_types::{Block, BlockData, Extrinsic, FinalityInfo, Hash, Header};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Read and write access to the canonical block database.
pub trait BlockState: Send + Sync {
    /// The header of the current best block.
    fn best_block_header(&self) -> Result<Header, StateError>;

    /// The header of the highest finalised block.
    fn highest_finalised_header(&self) -> Result<Header, StateError>;

    /// Whether a header with the given hash is known.
    fn has_header(&self, hash: &Hash) -> Result<bool, StateError>;

    /// Fetch a header by hash.
    fn header(&self, hash: &Hash) -> Result<Header, StateError>;

    /// The runtime instance associated with the given block hash.
    fn runtime(&self, hash: &Hash) -> Result<Arc<dyn RuntimeInstance>, StateError>;

    /// Store block data, merging with whatever is already recorded.
    fn compare_and_set_block_data(&self, data: &BlockData) -> Result<(), StateError>;

    /// Persist a verified justification for a block.
    fn set_justification(&self, hash: &Hash, justification: Vec<u8>) -> Result<(), StateError>;

    /// Subscribe to finalisation notifications.
    fn finalised_notifier_channel(&self) -> mpsc::UnboundedReceiver<FinalityInfo>;

    /// Whether block processing is paused (e.g. during a state takeover).
    fn is_paused(&self) -> bool;
}

/// A storage snapshot rooted at a specific state root.
pub trait TrieState: Send + Sync {
    /// The root this snapshot commits to.
    fn root(&self) -> Result<Hash, StateError>;
}

/// Exclusive access to the storage layer.
///
/// `lock`/`unlock` guard the execute-then-commit sequence of a single block;
/// the lock must be released on every path out of that sequence.
pub trait StorageState: Send + Sync {
    /// Obtain a trie snapshot rooted at `root`.
    fn trie_state(&self, root: &Hash) -> Result<Arc<dyn TrieState>, StateError>;

    /// Take the exclusive storage lock.
    fn lock(&self);

    /// Release the exclusive storage lock.
    fn unlock(&self);
}

/// Transaction pool maintenance driven by imported bodies.
pub trait TransactionState: Send + Sync {
    /// Drop an extrinsic that has been included in a block.
    fn remove_extrinsic(&self, extrinsic: &Extrinsic);
}

/// The transport layer, as seen by the sync engine.
pub trait Network: Send + Sync {
    /// Broadcast a block-announce handshake advertising our best header.
    fn block_announce_handshake(&self, best: &Header) -> Result<(), RequestError>;

    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerId>;

    /// Forward a reputation adjustment to the peer-set.
    fn report_peer(&self, change: ReputationChange, peer: &PeerId);
}

/// Performs the wire-level block-request RPC against a single peer.
#[async_trait]
pub trait RequestMaker: Send + Sync {
    /// Send `request` to `peer` and await its response.
    async fn block_request(
        &self,
        peer: &PeerId,
        request: &BlockRequest,
    ) -> Result<BlockResponse, RequestError>;
}

/// Block production verifier (BABE), treated as a black box.
pub trait BabeVerifier: Send + Sync {
    /// Verify the production of `header`.
    fn verify_block(&self, header: &Header) -> Result<(), VerificationError>;
}

/// Finality gadget (GRANDPA), treated as a black box.
pub trait FinalityGadget: Send + Sync {
    /// Verify `justification` finalises the block with the given hash.
    fn verify_block_justification(
        &self,
        hash: &Hash,
        justification: &[u8],
    ) -> Result<(), VerificationError>;
}

/// Commits an executed block plus its post-state to the node.
pub trait BlockImportHandler: Send + Sync {
    /// Hand over `block` and the trie snapshot it was executed against.
    ///
    /// `announce` requests the block be re-announced to the network.
    fn handle_block_import(
        &self,
        block: &Block,
        state: Arc<dyn TrieState>,
        announce: bool,
    ) -> Result<(), ImportError>;
}

/// An isolated WebAssembly execution environment.
///
/// Instances are not concurrency-safe; callers serialize use per instance.
pub trait RuntimeInstance: Send + Sync {
    /// Bind the storage snapshot subsequent calls execute against.
    fn set_context_storage(&self, state: Arc<dyn TrieState>);

    /// Execute `block`, producing its post-state in the bound snapshot.
    fn execute_block(&self, block: &Block) -> Result<Vec<u8>, ExecutionError>;
}

/// Telemetry sink for sync events.
pub trait Telemetry: Send + Sync {
    /// Record a successful block import.
    fn send_block_import(&self, hash: &Hash, number: u64, origin: &'static str);
}
