//! Test harness wiring a sync engine over in-memory collaborators.

use crate::generators::Chain;
use async_trait::async_trait;
use dot_network::{
    BlockRequest, BlockResponse, Direction, FromBlock, PeerId, ReputationChange, RequestError,
};
use dot_sync::{
    BabeVerifier, BlockImportHandler, BlockState, ChainSync, ChainSyncConfig, DisjointBlockSet,
    DisjointBlockSetConfig, ExecutionError, FinalityGadget, ImportError, Network, RequestMaker,
    RuntimeInstance, StateError, StorageState, Telemetry, TransactionState, TrieState,
    VerificationError,
};
use dot_types::{Block, BlockData, Extrinsic, FinalityInfo, Hash, Header};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// In-memory block database.
pub struct InMemoryBlockState {
    inner: Mutex<BlockStateInner>,
    paused: AtomicBool,
    runtime: Arc<RecordingRuntime>,
    finalised_txs: Mutex<Vec<mpsc::UnboundedSender<FinalityInfo>>>,
}

struct BlockStateInner {
    headers: HashMap<Hash, Header>,
    best: Header,
    finalised: Header,
    stored_block_data: Vec<BlockData>,
    justifications: HashMap<Hash, Vec<u8>>,
}

impl InMemoryBlockState {
    /// A database holding only `genesis`.
    pub fn new(genesis: Header) -> Self {
        let mut headers = HashMap::new();
        headers.insert(genesis.hash(), genesis.clone());
        Self {
            inner: Mutex::new(BlockStateInner {
                headers,
                best: genesis.clone(),
                finalised: genesis,
                stored_block_data: Vec::new(),
                justifications: HashMap::new(),
            }),
            paused: AtomicBool::new(false),
            runtime: Arc::new(RecordingRuntime::default()),
            finalised_txs: Mutex::new(Vec::new()),
        }
    }

    /// Insert a header, advancing the best pointer when it extends the chain.
    pub fn insert_header(&self, header: Header) {
        let mut inner = self.inner.lock();
        if header.number > inner.best.number {
            inner.best = header.clone();
        }
        inner.headers.insert(header.hash(), header);
    }

    /// Pin the finalised pointer.
    pub fn set_finalised(&self, header: Header) {
        self.inner.lock().finalised = header;
    }

    /// Pause or resume block processing.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Number of the current best block.
    pub fn best_number(&self) -> u64 {
        self.inner.lock().best.number
    }

    /// Stored justification for a block, if any.
    pub fn justification_for(&self, hash: &Hash) -> Option<Vec<u8>> {
        self.inner.lock().justifications.get(hash).cloned()
    }

    /// The shared runtime recorder.
    pub fn runtime_recorder(&self) -> Arc<RecordingRuntime> {
        self.runtime.clone()
    }

    /// Finalise `header` and notify every subscriber.
    pub fn notify_finalised(&self, header: Header) {
        self.set_finalised(header.clone());
        for tx in self.finalised_txs.lock().iter() {
            let _ = tx.send(FinalityInfo::new(header.clone()));
        }
    }
}

impl BlockState for InMemoryBlockState {
    fn best_block_header(&self) -> Result<Header, StateError> {
        Ok(self.inner.lock().best.clone())
    }

    fn highest_finalised_header(&self) -> Result<Header, StateError> {
        Ok(self.inner.lock().finalised.clone())
    }

    fn has_header(&self, hash: &Hash) -> Result<bool, StateError> {
        Ok(self.inner.lock().headers.contains_key(hash))
    }

    fn header(&self, hash: &Hash) -> Result<Header, StateError> {
        self.inner
            .lock()
            .headers
            .get(hash)
            .cloned()
            .ok_or(StateError::NotFound)
    }

    fn runtime(&self, _hash: &Hash) -> Result<Arc<dyn RuntimeInstance>, StateError> {
        Ok(self.runtime.clone())
    }

    fn compare_and_set_block_data(&self, data: &BlockData) -> Result<(), StateError> {
        self.inner.lock().stored_block_data.push(data.clone());
        Ok(())
    }

    fn set_justification(&self, hash: &Hash, justification: Vec<u8>) -> Result<(), StateError> {
        self.inner
            .lock()
            .justifications
            .insert(*hash, justification);
        Ok(())
    }

    fn finalised_notifier_channel(&self) -> mpsc::UnboundedReceiver<FinalityInfo> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.finalised_txs.lock().push(tx);
        rx
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

struct SnapshotTrieState {
    root: Hash,
}

impl TrieState for SnapshotTrieState {
    fn root(&self) -> Result<Hash, StateError> {
        Ok(self.root)
    }
}

/// Storage layer handing out snapshots rooted wherever they are requested.
#[derive(Default)]
pub struct InMemoryStorageState {
    lock_balance: AtomicUsize,
}

impl StorageState for InMemoryStorageState {
    fn trie_state(&self, root: &Hash) -> Result<Arc<dyn TrieState>, StateError> {
        Ok(Arc::new(SnapshotTrieState { root: *root }))
    }

    fn lock(&self) {
        self.lock_balance.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.lock_balance.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryStorageState {
    /// Outstanding lock acquisitions; zero when the engine is quiescent.
    pub fn lock_balance(&self) -> usize {
        self.lock_balance.load(Ordering::SeqCst)
    }
}

/// Transaction pool recording removed extrinsics.
#[derive(Default)]
pub struct RecordingTransactionState {
    removed: Mutex<Vec<Extrinsic>>,
}

impl RecordingTransactionState {
    /// Number of extrinsics removed from the pool so far.
    pub fn removed_count(&self) -> usize {
        self.removed.lock().len()
    }
}

impl TransactionState for RecordingTransactionState {
    fn remove_extrinsic(&self, extrinsic: &Extrinsic) {
        self.removed.lock().push(extrinsic.clone());
    }
}

/// Block production verifier accepting everything, counting calls.
#[derive(Default)]
pub struct RecordingBabeVerifier {
    verified: AtomicUsize,
}

impl RecordingBabeVerifier {
    /// Number of headers verified so far.
    pub fn verified_count(&self) -> usize {
        self.verified.load(Ordering::SeqCst)
    }
}

impl BabeVerifier for RecordingBabeVerifier {
    fn verify_block(&self, _header: &Header) -> Result<(), VerificationError> {
        self.verified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Finality gadget accepting every justification, counting calls.
#[derive(Default)]
pub struct RecordingFinalityGadget {
    verified: AtomicUsize,
}

impl RecordingFinalityGadget {
    /// Number of justifications verified so far.
    pub fn verified_count(&self) -> usize {
        self.verified.load(Ordering::SeqCst)
    }
}

impl FinalityGadget for RecordingFinalityGadget {
    fn verify_block_justification(
        &self,
        _hash: &Hash,
        _justification: &[u8],
    ) -> Result<(), VerificationError> {
        self.verified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Import handler writing imported headers back into the block state, so the
/// engine observes its own progress.
pub struct RecordingImportHandler {
    block_state: Arc<InMemoryBlockState>,
    imported: Mutex<Vec<(u64, bool)>>,
}

impl RecordingImportHandler {
    /// Create a handler committing into `block_state`.
    pub fn new(block_state: Arc<InMemoryBlockState>) -> Self {
        Self {
            block_state,
            imported: Mutex::new(Vec::new()),
        }
    }

    /// Numbers of imported blocks, in import order.
    pub fn imported_numbers(&self) -> Vec<u64> {
        self.imported
            .lock()
            .iter()
            .map(|(number, _)| *number)
            .collect()
    }

    /// Announce flags of imported blocks, in import order.
    pub fn announce_flags(&self) -> Vec<bool> {
        self.imported
            .lock()
            .iter()
            .map(|(_, announce)| *announce)
            .collect()
    }
}

impl BlockImportHandler for RecordingImportHandler {
    fn handle_block_import(
        &self,
        block: &Block,
        _state: Arc<dyn TrieState>,
        announce: bool,
    ) -> Result<(), ImportError> {
        self.block_state.insert_header(block.header.clone());
        self.imported.lock().push((block.header.number, announce));
        Ok(())
    }
}

/// Runtime recording executed block numbers.
#[derive(Default)]
pub struct RecordingRuntime {
    executed: Mutex<Vec<u64>>,
}

impl RecordingRuntime {
    /// Numbers of executed blocks, in execution order.
    pub fn executed_numbers(&self) -> Vec<u64> {
        self.executed.lock().clone()
    }
}

impl RuntimeInstance for RecordingRuntime {
    fn set_context_storage(&self, _state: Arc<dyn TrieState>) {}

    fn execute_block(&self, block: &Block) -> Result<Vec<u8>, ExecutionError> {
        self.executed.lock().push(block.header.number);
        Ok(Vec::new())
    }
}

/// Telemetry sink recording block-import events.
#[derive(Default)]
pub struct RecordingTelemetry {
    records: Mutex<Vec<(Hash, u64, &'static str)>>,
}

impl RecordingTelemetry {
    /// Recorded block-import events.
    pub fn block_imports(&self) -> Vec<(Hash, u64, &'static str)> {
        self.records.lock().clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn send_block_import(&self, hash: &Hash, number: u64, origin: &'static str) {
        self.records.lock().push((*hash, number, origin));
    }
}

/// Transport mock with a mutable peer list.
#[derive(Default)]
pub struct ScriptedNetwork {
    peers: Mutex<Vec<PeerId>>,
    handshakes: AtomicUsize,
    reported: Mutex<Vec<(ReputationChange, PeerId)>>,
}

impl ScriptedNetwork {
    /// Mark a peer as connected.
    pub fn connect(&self, who: PeerId) {
        let mut peers = self.peers.lock();
        if !peers.contains(&who) {
            peers.push(who);
        }
    }

    /// Number of handshakes broadcast so far.
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Reputation changes reported so far.
    pub fn reported(&self) -> Vec<(ReputationChange, PeerId)> {
        self.reported.lock().clone()
    }
}

impl Network for ScriptedNetwork {
    fn block_announce_handshake(&self, _best: &Header) -> Result<(), RequestError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        if self.peers.lock().is_empty() {
            return Err(RequestError::NoPeersConnected);
        }
        Ok(())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().clone()
    }

    fn report_peer(&self, change: ReputationChange, peer: &PeerId) {
        self.reported.lock().push((change, peer.clone()));
    }
}

/// Per-peer response behavior, consumed on first use.
#[derive(Debug, Clone)]
pub enum PeerScript {
    /// Serve the next response truncated to `len` blocks.
    ShortOnce(usize),
    /// Corrupt the next response with a known-bad block hash.
    BadBlockOnce(Hash),
    /// Fail the next request with the given error.
    FailOnce(RequestError),
}

/// Request maker serving one or more registered chains, with optional
/// per-peer misbehavior scripts.
pub struct ScriptedRequestMaker {
    index: HashMap<Hash, (usize, usize)>,
    chains: Vec<Vec<BlockData>>,
    scripts: Mutex<HashMap<PeerId, PeerScript>>,
    requests: Mutex<Vec<(PeerId, BlockRequest)>>,
}

impl ScriptedRequestMaker {
    /// Serve the given main chain; number-anchored requests resolve here.
    pub fn serving(main: &Chain) -> Self {
        let mut maker = Self {
            index: HashMap::new(),
            chains: Vec::new(),
            scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        };
        maker.register_chain(main.blocks.clone());
        maker
    }

    /// Register an extra (fork) chain; hash-anchored requests resolve into
    /// whichever chain the hash belongs to.
    pub fn register_chain(&mut self, blocks: Vec<BlockData>) {
        let chain_id = self.chains.len();
        for (position, block) in blocks.iter().enumerate() {
            self.index.insert(block.hash, (chain_id, position));
        }
        self.chains.push(blocks);
    }

    /// Install a one-shot behavior for `who`.
    pub fn script(&self, who: PeerId, script: PeerScript) {
        self.scripts.lock().insert(who, script);
    }

    /// Number of requests served so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Whether any request observed so far matches `predicate`.
    pub fn saw_request(&self, predicate: impl Fn(&BlockRequest) -> bool) -> bool {
        self.requests
            .lock()
            .iter()
            .any(|(_, request)| predicate(request))
    }

    fn slice_for(&self, request: &BlockRequest) -> Vec<BlockData> {
        let max = request.max as usize;
        match (&request.from, request.direction) {
            (FromBlock::Number(number), Direction::Ascending) => self.chains[0]
                .iter()
                .skip(*number as usize)
                .take(max)
                .cloned()
                .collect(),
            (FromBlock::Number(number), Direction::Descending) => {
                let main = &self.chains[0];
                let index = (*number as usize).min(main.len().saturating_sub(1));
                let start = (index + 1).saturating_sub(max);
                main[start..=index].iter().rev().cloned().collect()
            }
            (FromBlock::Hash(hash), direction) => {
                let Some(&(chain_id, position)) = self.index.get(hash) else {
                    return Vec::new();
                };
                let chain = &self.chains[chain_id];
                match direction {
                    Direction::Ascending => {
                        chain.iter().skip(position).take(max).cloned().collect()
                    }
                    Direction::Descending => {
                        let start = (position + 1).saturating_sub(max);
                        let mut run: Vec<BlockData> =
                            chain[start..=position].iter().rev().cloned().collect();
                        // a fork request may walk past the branch point into
                        // the main chain
                        if run.len() < max && chain_id != 0 {
                            if let Some(first) = run.last().and_then(|block| block.header.clone()) {
                                if let Some(&(0, main_position)) =
                                    self.index.get(&first.parent_hash)
                                {
                                    let missing = max - run.len();
                                    let main = &self.chains[0];
                                    let main_start = (main_position + 1).saturating_sub(missing);
                                    run.extend(
                                        main[main_start..=main_position]
                                            .iter()
                                            .rev()
                                            .cloned(),
                                    );
                                }
                            }
                        }
                        run
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RequestMaker for ScriptedRequestMaker {
    async fn block_request(
        &self,
        peer: &PeerId,
        request: &BlockRequest,
    ) -> Result<BlockResponse, RequestError> {
        self.requests.lock().push((peer.clone(), request.clone()));

        let script = self.scripts.lock().remove(peer);
        if let Some(PeerScript::FailOnce(error)) = &script {
            return Err(error.clone());
        }

        let mut blocks = self.slice_for(request);
        if blocks.is_empty() {
            return Err(RequestError::EmptyMessage);
        }

        match script {
            Some(PeerScript::ShortOnce(len)) => blocks.truncate(len),
            Some(PeerScript::BadBlockOnce(bad_hash)) => blocks[0].hash = bad_hash,
            _ => {}
        }

        Ok(BlockResponse { blocks })
    }
}

/// The full collaborator set plus the engine under test.
pub struct Harness {
    /// Engine under test.
    pub sync: Arc<ChainSync>,
    /// In-memory block database.
    pub block_state: Arc<InMemoryBlockState>,
    /// Storage layer.
    pub storage_state: Arc<InMemoryStorageState>,
    /// Transaction pool recorder.
    pub transaction_state: Arc<RecordingTransactionState>,
    /// Production verifier recorder.
    pub babe_verifier: Arc<RecordingBabeVerifier>,
    /// Finality gadget recorder.
    pub finality_gadget: Arc<RecordingFinalityGadget>,
    /// Import recorder.
    pub import_handler: Arc<RecordingImportHandler>,
    /// Telemetry recorder.
    pub telemetry: Arc<RecordingTelemetry>,
    /// Transport mock.
    pub network: Arc<ScriptedNetwork>,
    /// Scripted request maker.
    pub request_maker: Arc<ScriptedRequestMaker>,
    /// The disjoint block set handed to the engine.
    pub pending_blocks: Arc<DisjointBlockSet>,
}

/// Tunable knobs for [`Harness::build`].
pub struct HarnessOptions {
    /// Local chain height preloaded into the block state.
    pub best: u64,
    /// Finalised height preloaded into the block state.
    pub finalised: u64,
    /// Minimum workers before `start` returns.
    pub min_peers: usize,
    /// Hashes the engine refuses to import.
    pub bad_blocks: Vec<Hash>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            best: 0,
            finalised: 0,
            min_peers: 1,
            bad_blocks: Vec::new(),
        }
    }
}

impl Harness {
    /// Build an engine over `chain` with the given options. The request
    /// maker serves `chain` in full; peers still have to be connected and
    /// handshaken by the test.
    pub fn build(chain: &Chain, options: HarnessOptions) -> Self {
        Self::build_with_request_maker(
            chain,
            options,
            ScriptedRequestMaker::serving(chain),
        )
    }

    /// Like [`Harness::build`], with a caller-prepared request maker (e.g.
    /// with extra fork chains registered).
    pub fn build_with_request_maker(
        chain: &Chain,
        options: HarnessOptions,
        request_maker: ScriptedRequestMaker,
    ) -> Self {
        let block_state = Arc::new(InMemoryBlockState::new(chain.header_at(0)));
        for number in 1..=options.best {
            block_state.insert_header(chain.header_at(number));
        }
        block_state.set_finalised(chain.header_at(options.finalised));

        let storage_state = Arc::new(InMemoryStorageState::default());
        let transaction_state = Arc::new(RecordingTransactionState::default());
        let babe_verifier = Arc::new(RecordingBabeVerifier::default());
        let finality_gadget = Arc::new(RecordingFinalityGadget::default());
        let import_handler = Arc::new(RecordingImportHandler::new(block_state.clone()));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let network = Arc::new(ScriptedNetwork::default());
        let request_maker = Arc::new(request_maker);
        let pending_blocks = Arc::new(DisjointBlockSet::new(DisjointBlockSetConfig::default()));

        let sync = ChainSync::new(ChainSyncConfig {
            block_state: block_state.clone(),
            storage_state: storage_state.clone(),
            transaction_state: transaction_state.clone(),
            babe_verifier: babe_verifier.clone(),
            finality_gadget: finality_gadget.clone(),
            block_import_handler: import_handler.clone(),
            telemetry: telemetry.clone(),
            network: network.clone(),
            request_maker: request_maker.clone(),
            pending_blocks: pending_blocks.clone(),
            min_peers: options.min_peers,
            wait_peers_interval: Duration::from_millis(20),
            bad_blocks: options.bad_blocks,
        });

        Self {
            sync,
            block_state,
            storage_state,
            transaction_state,
            babe_verifier,
            finality_gadget,
            import_handler,
            telemetry,
            network,
            request_maker,
            pending_blocks,
        }
    }

    /// Connect a peer and run its block-announce handshake.
    pub async fn handshake(&self, who: PeerId, best_hash: Hash, best_number: u64) {
        self.network.connect(who.clone());
        self.sync
            .clone()
            .on_block_announce_handshake(who, best_hash, best_number)
            .await
            .expect("handshake must succeed");
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
