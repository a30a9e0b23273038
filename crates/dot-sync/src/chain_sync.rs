//! The synchronization state machine.
//!
//! The controller runs in one of two modes. In `bootstrap` mode the local
//! head is far behind the observed network target and a dedicated loop pulls
//! ascending batches of blocks until it catches up. In `tip` mode the node is
//! near the head and individual block announces drive descending chain, fork
//! and gap-fill requests.

use crate::assembler::ChainAssembler;
use crate::disjoint::DisjointBlockSet;
use crate::error::{SyncError, SyncResult};
use crate::metrics::SYNC_METRICS;
use crate::peer_view::PeerViewSet;
use crate::requests;
use crate::traits::{
    BabeVerifier, BlockImportHandler, BlockState, FinalityGadget, Network, RequestMaker,
    StorageState, TransactionState, Telemetry,
};
use crate::worker_pool::{SyncTaskResult, SyncWorkerPool};
use dot_network::{BlockRequest, PeerId, RequestError, MAX_BLOCKS_IN_RESPONSE};
use dot_types::{Block, BlockData, Body, FinalityInfo, Hash, Header};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Hard deadline for draining all sync tasks on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default minimum number of workers before sync starts.
pub const DEFAULT_MIN_PEERS: usize = 5;

/// Default interval between handshake broadcasts while waiting for peers.
pub const DEFAULT_WAIT_PEERS_INTERVAL: Duration = Duration::from_secs(10);

/// The two operating modes of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncMode {
    /// More than [`MAX_BLOCKS_IN_RESPONSE`] blocks behind the target.
    Bootstrap = 0,
    /// Within [`MAX_BLOCKS_IN_RESPONSE`] blocks of the target.
    Tip = 1,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Bootstrap => write!(f, "bootstrap"),
            SyncMode::Tip => write!(f, "tip"),
        }
    }
}

/// Lock-free cell holding the current [`SyncMode`].
struct SyncModeCell(AtomicU8);

impl SyncModeCell {
    fn new(mode: SyncMode) -> Self {
        Self(AtomicU8::new(mode as u8))
    }

    fn load(&self) -> SyncMode {
        match self.0.load(Ordering::SeqCst) {
            0 => SyncMode::Bootstrap,
            _ => SyncMode::Tip,
        }
    }

    fn store(&self, mode: SyncMode) {
        self.0.store(mode as u8, Ordering::SeqCst);
    }
}

/// Where a processed block came from, which decides how much verification it
/// gets and whether importing it is re-announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    /// Pulled while catching up with the chain; production checks are skipped.
    NetworkInitialSync,
    /// Received via a block announce at the tip.
    NetworkBroadcast,
}

impl BlockOrigin {
    fn as_str(self) -> &'static str {
        match self {
            BlockOrigin::NetworkInitialSync => "NetworkInitialSync",
            BlockOrigin::NetworkBroadcast => "NetworkBroadcast",
        }
    }
}

/// Construction-time wiring of the sync engine.
pub struct ChainSyncConfig {
    /// Canonical block database.
    pub block_state: Arc<dyn BlockState>,
    /// Storage layer for trie snapshots.
    pub storage_state: Arc<dyn StorageState>,
    /// Transaction pool maintenance.
    pub transaction_state: Arc<dyn TransactionState>,
    /// Block production verifier.
    pub babe_verifier: Arc<dyn BabeVerifier>,
    /// Finality gadget for justifications.
    pub finality_gadget: Arc<dyn FinalityGadget>,
    /// Commits executed blocks.
    pub block_import_handler: Arc<dyn BlockImportHandler>,
    /// Telemetry sink.
    pub telemetry: Arc<dyn Telemetry>,
    /// Transport layer.
    pub network: Arc<dyn Network>,
    /// Wire-level block request RPC.
    pub request_maker: Arc<dyn RequestMaker>,
    /// Disjoint set holding announced-but-unready blocks.
    pub pending_blocks: Arc<DisjointBlockSet>,
    /// Minimum workers required before sync starts.
    pub min_peers: usize,
    /// Interval between handshake broadcasts while waiting for peers.
    pub wait_peers_interval: Duration,
    /// Hashes the engine refuses to import.
    pub bad_blocks: Vec<Hash>,
}

/// The sync controller.
pub struct ChainSync {
    block_state: Arc<dyn BlockState>,
    storage_state: Arc<dyn StorageState>,
    transaction_state: Arc<dyn TransactionState>,
    babe_verifier: Arc<dyn BabeVerifier>,
    finality_gadget: Arc<dyn FinalityGadget>,
    block_import_handler: Arc<dyn BlockImportHandler>,
    telemetry: Arc<dyn Telemetry>,
    network: Arc<dyn Network>,

    worker_pool: Arc<SyncWorkerPool>,
    peer_view_set: Arc<PeerViewSet>,
    pending_blocks: Arc<DisjointBlockSet>,

    sync_mode: SyncModeCell,
    finalised_rx: Mutex<Option<mpsc::UnboundedReceiver<FinalityInfo>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,

    min_peers: usize,
    wait_peers_interval: Duration,
    bad_blocks: Vec<Hash>,
}

impl ChainSync {
    /// Wire up a new sync engine. The initial mode is `tip`.
    pub fn new(config: ChainSyncConfig) -> Arc<Self> {
        let finalised_rx = config.block_state.finalised_notifier_channel();
        let worker_pool = Arc::new(SyncWorkerPool::new(
            config.network.clone(),
            config.request_maker,
        ));

        Arc::new(Self {
            block_state: config.block_state,
            storage_state: config.storage_state,
            transaction_state: config.transaction_state,
            babe_verifier: config.babe_verifier,
            finality_gadget: config.finality_gadget,
            block_import_handler: config.block_import_handler,
            telemetry: config.telemetry,
            network: config.network,
            worker_pool,
            peer_view_set: Arc::new(PeerViewSet::new()),
            pending_blocks: config.pending_blocks,
            sync_mode: SyncModeCell::new(SyncMode::Tip),
            finalised_rx: Mutex::new(Some(finalised_rx)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            min_peers: config.min_peers,
            wait_peers_interval: config.wait_peers_interval,
            bad_blocks: config.bad_blocks,
        })
    }

    /// The current sync mode.
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode.load()
    }

    /// The worker pool, for observability.
    pub fn worker_pool(&self) -> &Arc<SyncWorkerPool> {
        &self.worker_pool
    }

    /// The highest block number any connected peer has shown us.
    pub fn highest_block(&self) -> SyncResult<u64> {
        if self.peer_view_set.size() == 0 {
            return Err(SyncError::NoPeers);
        }
        Ok(self.peer_view_set.target())
    }

    /// Start the engine: spawn the disjoint-set housekeeper and block until
    /// enough workers and a sync target are available (or stop fires).
    pub async fn start(self: Arc<Self>) {
        // the engine optimistically starts in tip mode
        SYNC_METRICS.is_synced.set(1);

        if let Some(finalised_rx) = self.finalised_rx.lock().take() {
            let pending_blocks = self.pending_blocks.clone();
            let cancel = self.cancel.clone();
            self.tracker
                .spawn(async move { pending_blocks.run(finalised_rx, cancel).await });
        }

        self.wait_workers_and_target().await;
    }

    /// Stop the engine, draining every task within the shutdown deadline.
    pub async fn stop(&self) -> SyncResult<()> {
        self.worker_pool.stop().await?;

        self.cancel.cancel();
        self.tracker.close();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(SyncError::StopTimeout),
        }
    }

    /// Record a peer's best block from its handshake and, when the revealed
    /// target is far ahead, flip to bootstrap mode.
    pub async fn on_block_announce_handshake(
        self: Arc<Self>,
        who: PeerId,
        best_hash: Hash,
        best_number: u64,
    ) -> SyncResult<()> {
        self.worker_pool.from_block_announce(who.clone());
        self.peer_view_set.update(who, best_hash, best_number);

        if self.sync_mode() == SyncMode::Bootstrap {
            return Ok(());
        }

        let best_block_header = self.block_state.best_block_header()?;
        if !self.is_bootstrap_distance(best_block_header.number) {
            return Ok(());
        }

        // more than 128 blocks behind the head, switch to bootstrap
        self.sync_mode.store(SyncMode::Bootstrap);
        SYNC_METRICS.is_synced.set(0);
        info!(mode = %SyncMode::Bootstrap, "🔁 switched sync mode");

        let chain_sync = self.clone();
        self.tracker
            .spawn(async move { chain_sync.bootstrap_sync().await });
        Ok(())
    }

    /// Handle a block announce: remember the header and, at the tip, request
    /// whatever is needed to connect it to the local chain.
    pub async fn on_block_announce(&self, who: PeerId, header: Header) -> SyncResult<()> {
        let hash = header.hash();
        if self.pending_blocks.has_block(&hash) {
            return Err(SyncError::AlreadyInDisjointSet {
                number: header.number,
                hash,
            });
        }

        self.worker_pool.from_block_announce(who.clone());
        self.peer_view_set.update(who.clone(), hash, header.number);
        self.pending_blocks.add_header(header.clone())?;

        if self.sync_mode() == SyncMode::Bootstrap {
            // the bootstrap loop will catch up with this block
            return Ok(());
        }

        let best_block_header = self.block_state.best_block_header()?;
        if self.is_bootstrap_distance(best_block_header.number) {
            return Ok(());
        }

        self.request_announced_block(best_block_header, who, header)
            .await
    }

    fn is_bootstrap_distance(&self, current_number: u64) -> bool {
        current_number + u64::from(MAX_BLOCKS_IN_RESPONSE) < self.peer_view_set.target()
    }

    /// Broadcast handshakes until the pool has `min_peers` workers and a
    /// non-zero target is known.
    async fn wait_workers_and_target(&self) {
        let highest_finalised_header = match self.block_state.highest_finalised_header() {
            Ok(header) => header,
            // without a finalised anchor the node cannot sync at all
            Err(err) => panic!("failed to get highest finalised header: {err}"),
        };

        loop {
            self.worker_pool.use_connected_peers();
            if self.worker_pool.total_workers() >= self.min_peers
                && self.peer_view_set.target() > 0
            {
                return;
            }

            if let Err(err) = self.network.block_announce_handshake(&highest_finalised_header) {
                if !matches!(err, RequestError::NoPeersConnected) {
                    error!(error = %err, "retrieving target info from peers");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.wait_peers_interval) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// The bootstrap loop: pull ascending batches until within tip distance.
    async fn bootstrap_sync(self: Arc<Self>) {
        let mut current_block_header = match self.block_state.highest_finalised_header() {
            Ok(header) => header,
            Err(err) => panic!("cannot find highest finalised header: {err}"),
        };

        loop {
            if self.cancel.is_cancelled() {
                warn!("ending bootstrap sync, stop signal triggered");
                return;
            }

            if !self.is_bootstrap_distance(current_block_header.number) {
                self.sync_mode.store(SyncMode::Tip);
                SYNC_METRICS.is_synced.set(1);
                info!(mode = %SyncMode::Tip, "🔁 switched sync mode");
                return;
            }

            self.worker_pool.use_connected_peers();
            if let Err(err) = self
                .request_max_blocks_from(&current_block_header, BlockOrigin::NetworkInitialSync)
                .await
            {
                if matches!(err, SyncError::BlockStatePaused) {
                    debug!("exiting bootstrap sync: block state paused");
                    return;
                }
                error!(error = %err, "requesting max blocks from best block header");
            }

            match self.block_state.best_block_header() {
                Ok(header) => current_block_header = header,
                Err(err) => error!(error = %err, "getting best block header"),
            }
        }
    }

    /// One bootstrap cycle: plan ascending batches up to the bounded target,
    /// drive them through the assembler and import the result in order.
    async fn request_max_blocks_from(
        &self,
        best_block_header: &Header,
        origin: BlockOrigin,
    ) -> SyncResult<()> {
        let start_at = best_block_header.number + 1;
        let requests =
            requests::max_blocks_request_plan(best_block_header.number, self.peer_view_set.target());
        if requests.is_empty() {
            return Ok(());
        }

        let expected = requests::planned_block_count(&requests);
        let (results_tx, results_rx) = self.submit_requests(requests)?;
        if let Some(blocks) = self
            .assembler()
            .handle_workers_results(results_tx, results_rx, start_at, expected)
            .await?
        {
            self.import_assembled(blocks, origin)?;
        }
        Ok(())
    }

    async fn request_announced_block(
        &self,
        best_block_header: Header,
        who: PeerId,
        announced: Header,
    ) -> SyncResult<()> {
        let announced_hash = announced.hash();
        if self.has_header(&announced_hash)? {
            return Ok(());
        }

        let finalised = self.block_state.highest_finalised_header()?;

        // an announce below our best block either belongs to a fork chain or
        // is stale altogether
        if announced.number < best_block_header.number {
            if announced.number <= finalised.number {
                return Ok(());
            }
            return self
                .request_fork_blocks(&finalised, &announced, who)
                .await;
        }

        self.request_chain_blocks(&announced, &best_block_header, who)
            .await?;
        self.request_pending_blocks(&finalised).await?;
        Ok(())
    }

    /// Request the gap between our best block and an announced descendant,
    /// descending from the announced hash.
    async fn request_chain_blocks(
        &self,
        announced: &Header,
        best_block_header: &Header,
        who: PeerId,
    ) -> SyncResult<()> {
        let announced_hash = announced.hash();
        let gap = announced.number.saturating_sub(best_block_header.number) as u32;

        let (request, start_at) = if gap > 1 {
            let request = requests::descending_request(announced_hash, gap);
            let start_at = announced.number - u64::from(request.max) + 1;
            info!(peer = %who, gap, from = %announced_hash.short(), number = announced.number,
                "requesting chain blocks, descending");
            (request, start_at)
        } else {
            let request = requests::descending_request(announced_hash, 1);
            info!(peer = %who, number = announced.number, hash = %announced_hash.short(),
                "requesting a single block");
            (request, announced.number)
        };

        let expected = request.max;
        let (results_tx, results_rx) = self.submit_request(request, Some(&who))?;
        if let Some(blocks) = self
            .assembler()
            .handle_workers_results(results_tx, results_rx, start_at, expected)
            .await?
        {
            self.import_assembled(blocks, BlockOrigin::NetworkBroadcast)?;
        }
        Ok(())
    }

    /// Request a fork chain descending from an announced block whose number
    /// is below our best but above the finalised head.
    async fn request_fork_blocks(
        &self,
        finalised: &Header,
        announced: &Header,
        who: PeerId,
    ) -> SyncResult<()> {
        let announced_hash = announced.hash();
        let parent_exists = self.has_header(&announced.parent_hash)?;

        let (gap, start_at) = if parent_exists {
            (1u32, announced.number)
        } else {
            let gap = ((announced.number - finalised.number) as u32).min(MAX_BLOCKS_IN_RESPONSE);
            (gap, announced.number - u64::from(gap) + 1)
        };

        info!(peer = %who, gap, number = announced.number, hash = %announced_hash.short(),
            "requesting fork blocks");

        let request = requests::descending_request(announced_hash, gap);
        let expected = request.max;
        let (results_tx, results_rx) = self.submit_request(request, Some(&who))?;
        if let Some(blocks) = self
            .assembler()
            .handle_workers_results(results_tx, results_rx, start_at, expected)
            .await?
        {
            self.import_assembled(blocks, BlockOrigin::NetworkBroadcast)?;
        }
        Ok(())
    }

    /// Walk the disjoint set: import entries whose parent arrived, purge
    /// finalised ones and issue gap fills for the rest.
    async fn request_pending_blocks(&self, finalised: &Header) -> SyncResult<()> {
        let total = self.pending_blocks.size();
        if total == 0 {
            return Ok(());
        }
        debug!(total, "checking pending blocks");

        for pending in self.pending_blocks.get_blocks() {
            let Some(number) = pending.number else {
                // only a hash is known; the TTL sweep will reclaim it
                continue;
            };

            if number <= finalised.number {
                self.pending_blocks.remove_block(&pending.hash);
                continue;
            }

            let parent_known = match &pending.header {
                Some(header) => self.has_header(&header.parent_hash)?,
                None => false,
            };

            if parent_known {
                self.handle_ready_block(pending.to_block_data(), BlockOrigin::NetworkBroadcast)?;
                continue;
            }

            let mut gap = (number - finalised.number) as u32;
            if gap > MAX_BLOCKS_IN_RESPONSE {
                warn!(gap, max = MAX_BLOCKS_IN_RESPONSE, "pending block gap larger than expected");
                gap = MAX_BLOCKS_IN_RESPONSE;
            }

            let request = requests::descending_request(pending.hash, gap);
            let start_at = number - u64::from(request.max) + 1;
            let expected = request.max;

            let (results_tx, results_rx) = self.submit_request(request, None)?;
            if let Some(blocks) = self
                .assembler()
                .handle_workers_results(results_tx, results_rx, start_at, expected)
                .await?
            {
                self.import_assembled(blocks, BlockOrigin::NetworkBroadcast)?;
            }
        }

        Ok(())
    }

    fn assembler(&self) -> ChainAssembler {
        ChainAssembler::new(
            self.worker_pool.clone(),
            self.network.clone(),
            self.block_state.clone(),
            self.bad_blocks.clone(),
            self.cancel.clone(),
        )
    }

    fn submit_request(
        &self,
        request: BlockRequest,
        who: Option<&PeerId>,
    ) -> SyncResult<(
        mpsc::UnboundedSender<SyncTaskResult>,
        mpsc::UnboundedReceiver<SyncTaskResult>,
    )> {
        if self.block_state.is_paused() {
            return Err(SyncError::BlockStatePaused);
        }
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        self.worker_pool
            .submit_request(request, who, results_tx.clone());
        Ok((results_tx, results_rx))
    }

    fn submit_requests(
        &self,
        requests: Vec<BlockRequest>,
    ) -> SyncResult<(
        mpsc::UnboundedSender<SyncTaskResult>,
        mpsc::UnboundedReceiver<SyncTaskResult>,
    )> {
        if self.block_state.is_paused() {
            return Err(SyncError::BlockStatePaused);
        }
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        for request in requests {
            self.worker_pool
                .submit_request(request, None, results_tx.clone());
        }
        Ok((results_tx, results_rx))
    }

    fn has_header(&self, hash: &Hash) -> SyncResult<bool> {
        match self.block_state.has_header(hash) {
            Ok(has) => Ok(has),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn import_assembled(&self, blocks: Vec<BlockData>, origin: BlockOrigin) -> SyncResult<()> {
        let started = Instant::now();
        let synced = blocks.len();
        for block_data in blocks {
            self.handle_ready_block(block_data, origin)?;
        }
        self.log_sync_stats(started, synced);
        Ok(())
    }

    /// Process a block whose data is complete enough to import.
    fn handle_ready_block(&self, mut block_data: BlockData, origin: BlockOrigin) -> SyncResult<()> {
        // if the header was not requested, recover it from the pending set
        if block_data.header.is_none() {
            match self.pending_blocks.get_block(&block_data.hash) {
                Some(pending) => match pending.header {
                    Some(header) => block_data.header = Some(header),
                    None => {
                        error!(block = %block_data.hash, "ready block with unknown number and header");
                        return Ok(());
                    }
                },
                None => {
                    // not pending either: maybe we already processed it
                    if self.has_header(&block_data.hash)? {
                        trace!(block = %block_data.hash, "ignoring block we've already processed");
                        return Ok(());
                    }
                    error!(block = %block_data.hash, "block with unknown header is ready");
                    return Err(SyncError::UnknownHeaderForReadyBlock(block_data.hash));
                }
            }
        }

        if let Err(err) = self.process_block_data(&block_data, origin) {
            error!(block = %block_data.hash, error = %err, "block data processing failed");
            return Err(err);
        }

        self.pending_blocks.remove_block(&block_data.hash);
        Ok(())
    }

    fn process_block_data(&self, block_data: &BlockData, origin: BlockOrigin) -> SyncResult<()> {
        // while bootstrapping there is no point announcing imported blocks
        let announce_imported = self.sync_mode() == SyncMode::Tip;

        if let Some(header) = &block_data.header {
            if let Some(body) = &block_data.body {
                // any justification rides along and is verified between
                // execution and commit
                self.process_block_with_header_and_body(
                    header,
                    body,
                    block_data.justification.as_deref(),
                    origin,
                    announce_imported,
                )?;
            } else if let Some(justification) = &block_data.justification {
                if !justification.is_empty() {
                    self.handle_justification(header, justification)?;
                }
            }
        }

        self.block_state.compare_and_set_block_data(block_data)?;
        SYNC_METRICS.blocks_synced.inc();
        Ok(())
    }

    fn process_block_with_header_and_body(
        &self,
        header: &Header,
        body: &Body,
        justification: Option<&[u8]>,
        origin: BlockOrigin,
        announce_imported: bool,
    ) -> SyncResult<()> {
        if origin != BlockOrigin::NetworkInitialSync {
            self.babe_verifier
                .verify_block(header)
                .map_err(SyncError::BabeVerification)?;
        }

        self.handle_body(body);

        let block = Block::new(header.clone(), body.clone());
        self.handle_block(&block, justification, announce_imported, origin)
    }

    /// Account for the extrinsics of an incoming body.
    fn handle_body(&self, body: &Body) {
        let mut accumulated = 0;
        for extrinsic in &body.0 {
            accumulated += extrinsic.len();
            self.transaction_state.remove_extrinsic(extrinsic);
        }
        SYNC_METRICS.block_size.set(accumulated as i64);
    }

    fn handle_justification(&self, header: &Header, justification: &[u8]) -> SyncResult<()> {
        let hash = header.hash();
        self.finality_gadget
            .verify_block_justification(&hash, justification)
            .map_err(|source| SyncError::JustificationVerification {
                number: header.number,
                source,
            })?;

        self.block_state
            .set_justification(&hash, justification.to_vec())?;
        Ok(())
    }

    /// Execute a block against its parent state and commit it. A
    /// justification, when present, must verify before the commit.
    fn handle_block(
        &self,
        block: &Block,
        justification: Option<&[u8]>,
        announce: bool,
        origin: BlockOrigin,
    ) -> SyncResult<()> {
        let parent = self
            .block_state
            .header(&block.header.parent_hash)
            .map_err(SyncError::FailedToGetParent)?;

        self.storage_state.lock();
        let _unlock = StorageUnlockGuard(self.storage_state.as_ref());

        let trie_state = self.storage_state.trie_state(&parent.state_root)?;
        let root = trie_state.root()?;
        if root != parent.state_root {
            // the snapshot no longer matches what the parent committed to:
            // the local database is corrupted and must not keep running
            panic!("parent state root does not match snapshot state root");
        }

        let runtime = self.block_state.runtime(&parent.hash())?;
        runtime.set_context_storage(trie_state.clone());
        runtime
            .execute_block(block)
            .map_err(|source| SyncError::Execution {
                number: block.header.number,
                source,
            })?;

        if let Some(justification) = justification {
            if !justification.is_empty() {
                self.handle_justification(&block.header, justification)?;
            }
        }

        self.block_import_handler
            .handle_block_import(block, trie_state, announce)?;

        let block_hash = block.header.hash();
        self.telemetry
            .send_block_import(&block_hash, block.header.number, origin.as_str());
        Ok(())
    }

    fn log_sync_stats(&self, started: Instant, synced: usize) {
        let finalised = match self.block_state.highest_finalised_header() {
            Ok(header) => header,
            Err(err) => {
                error!(error = %err, "getting highest finalised header");
                return;
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        let bps = synced as f64 / elapsed.max(f64::EPSILON);
        info!(synced, seconds = elapsed, bps, "⛓️ synced blocks");
        info!(
            peers = self.network.peers().len(),
            workers = self.worker_pool.total_workers(),
            target = self.peer_view_set.target(),
            finalised = finalised.number,
            finalised_hash = %finalised.hash().short(),
            mode = %self.sync_mode(),
            "🚣 currently syncing",
        );
    }
}

/// Releases the storage lock on every path out of the execute/commit scope.
struct StorageUnlockGuard<'a>(&'a dyn StorageState);

impl Drop for StorageUnlockGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disjoint::DisjointBlockSetConfig;
    use crate::mocks::{MockEnvironment, TestChain};

    fn engine(env: &MockEnvironment) -> Arc<ChainSync> {
        ChainSync::new(ChainSyncConfig {
            block_state: env.block_state.clone(),
            storage_state: env.storage_state.clone(),
            transaction_state: env.transaction_state.clone(),
            babe_verifier: env.babe_verifier.clone(),
            finality_gadget: env.finality_gadget.clone(),
            block_import_handler: env.import_handler.clone(),
            telemetry: env.telemetry.clone(),
            network: env.network.clone(),
            request_maker: env.request_maker.clone(),
            pending_blocks: Arc::new(DisjointBlockSet::new(DisjointBlockSetConfig::default())),
            min_peers: 1,
            wait_peers_interval: Duration::from_millis(20),
            bad_blocks: Vec::new(),
        })
    }

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes(vec![byte])
    }

    #[tokio::test]
    async fn test_handshake_within_distance_stays_in_tip() {
        let chain = TestChain::generate(200);
        let env = MockEnvironment::with_chain(&chain, 0);
        let sync = engine(&env);

        // target exactly 128 ahead: 0 + 128 < 128 is false
        sync.clone()
            .on_block_announce_handshake(peer(1), chain.hash_at(128), 128)
            .await
            .unwrap();
        assert_eq!(sync.sync_mode(), SyncMode::Tip);

        sync.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_past_distance_flips_to_bootstrap() {
        let chain = TestChain::generate(200);
        let env = MockEnvironment::with_chain(&chain, 0);
        env.request_maker.serve_nothing();
        let sync = engine(&env);

        sync.clone()
            .on_block_announce_handshake(peer(1), chain.hash_at(129), 129)
            .await
            .unwrap();
        assert_eq!(sync.sync_mode(), SyncMode::Bootstrap);

        sync.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_announce_already_pending_is_rejected() {
        let chain = TestChain::generate(600);
        let env = MockEnvironment::with_chain(&chain, 5);
        let sync = engine(&env);

        // a far-ahead target keeps announce handling to the pending set only
        sync.peer_view_set.update(peer(9), chain.hash_at(500), 500);

        let header = chain.header_at(6);
        sync.on_block_announce(peer(1), header.clone()).await.unwrap();
        let err = sync.on_block_announce(peer(1), header).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyInDisjointSet { number: 6, .. }));

        sync.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_announce_issues_no_request() {
        let chain = TestChain::generate(110);
        // best #100, finalised #90
        let env = MockEnvironment::with_chain_and_finalised(&chain, 100, 90);
        let sync = engine(&env);
        env.network.connect(peer(1));
        sync.peer_view_set
            .update(peer(1), chain.hash_at(100), 100);

        // a side-chain block below the finalised head
        sync.on_block_announce(peer(1), chain.fork_header_at(85))
            .await
            .unwrap();

        assert_eq!(env.request_maker.request_count(), 0);
        sync.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_announced_descendant_is_fetched_and_imported() {
        let chain = TestChain::generate(120);
        let env = MockEnvironment::with_chain(&chain, 100);
        let sync = engine(&env);
        env.network.connect(peer(1));
        sync.worker_pool.from_block_announce(peer(1));
        sync.peer_view_set.update(peer(1), chain.hash_at(105), 105);

        sync.on_block_announce(peer(1), chain.header_at(105))
            .await
            .unwrap();

        // the 5-block gap was fetched descending and imported ascending
        assert_eq!(
            env.import_handler.imported_numbers(),
            vec![101, 102, 103, 104, 105]
        );
        assert_eq!(env.block_state.best_number(), 105);
        assert_eq!(
            *env.block_state.runtime_mock().executed.lock(),
            vec![101, 102, 103, 104, 105]
        );

        // at the tip, announce handling verifies block production
        assert_eq!(env.babe_verifier.verified.load(Ordering::SeqCst), 5);
        assert_eq!(env.finality_gadget.verified.load(Ordering::SeqCst), 0);

        // bodies flowed through the transaction pool and telemetry
        assert_eq!(env.transaction_state.removed.lock().len(), 5);
        assert_eq!(env.telemetry.records.lock().len(), 5);
        assert_eq!(env.block_state.stored_block_data_count(), 5);

        // the storage lock is balanced and nothing was reported
        assert_eq!(env.storage_state.lock_balance.load(Ordering::SeqCst), 0);
        assert!(env.network.reported.lock().is_empty());

        sync.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_highest_block_requires_peers() {
        let chain = TestChain::generate(10);
        let env = MockEnvironment::with_chain(&chain, 0);
        let sync = engine(&env);

        assert!(matches!(sync.highest_block(), Err(SyncError::NoPeers)));
        sync.peer_view_set.update(peer(1), chain.hash_at(9), 9);
        assert_eq!(sync.highest_block().unwrap(), 9);

        sync.stop().await.unwrap();
    }
}
