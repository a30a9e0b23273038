//! Hand-rolled in-memory collaborators for unit tests.

use crate::error::{ExecutionError, ImportError, StateError, VerificationError};
use crate::traits::{
    BabeVerifier, BlockImportHandler, BlockState, FinalityGadget, Network, RequestMaker,
    RuntimeInstance, StorageState, Telemetry, TransactionState, TrieState,
};
use async_trait::async_trait;
use dot_network::{
    BlockRequest, BlockResponse, Direction, FromBlock, PeerId, ReputationChange, RequestError,
};
use dot_types::{
    blake2b_256, Block, BlockData, Body, Digest, Extrinsic, FinalityInfo, Hash, Header,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A deterministic chain of complete blocks, index = block number.
#[derive(Clone)]
pub(crate) struct TestChain {
    pub blocks: Vec<BlockData>,
}

impl TestChain {
    /// Generate blocks `#0..=#top`, each with a one-extrinsic body.
    pub fn generate(top: u64) -> Self {
        let mut blocks = Vec::with_capacity(top as usize + 1);
        let mut parent_hash = Hash::zero();
        for number in 0..=top {
            let header = Header::new(
                parent_hash,
                number,
                blake2b_256(&number.to_le_bytes()),
                Hash::zero(),
                Digest::default(),
            );
            parent_hash = header.hash();
            blocks.push(BlockData {
                hash: header.hash(),
                header: Some(header),
                body: Some(Body(vec![Extrinsic::from_bytes(number.to_le_bytes().to_vec())])),
                justification: None,
            });
        }
        Self { blocks }
    }

    pub fn header_at(&self, number: u64) -> Header {
        self.blocks[number as usize].header.clone().unwrap()
    }

    pub fn hash_at(&self, number: u64) -> Hash {
        self.blocks[number as usize].hash
    }

    /// A side-chain header at `number` branching off `number - 1`.
    pub fn fork_header_at(&self, number: u64) -> Header {
        let mut header = self.header_at(number);
        header.extrinsics_root = Hash::from_bytes([0xff; 32]);
        header
    }
}

#[derive(Clone)]
struct BlockStateInner {
    headers: HashMap<Hash, Header>,
    best: Header,
    finalised: Header,
    stored_block_data: Vec<BlockData>,
    justifications: HashMap<Hash, Vec<u8>>,
}

pub(crate) struct MockBlockState {
    inner: Mutex<BlockStateInner>,
    paused: AtomicBool,
    runtime: Arc<MockRuntime>,
    finalised_txs: Mutex<Vec<mpsc::UnboundedSender<FinalityInfo>>>,
}

impl MockBlockState {
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
            runtime: Arc::new(MockRuntime::default()),
            finalised_txs: Mutex::new(Vec::new()),
        }
    }

    pub fn insert_header(&self, header: Header) {
        let mut inner = self.inner.lock();
        if header.number > inner.best.number {
            inner.best = header.clone();
        }
        inner.headers.insert(header.hash(), header);
    }

    pub fn set_finalised(&self, header: Header) {
        self.inner.lock().finalised = header;
    }

    pub fn best_number(&self) -> u64 {
        self.inner.lock().best.number
    }

    pub fn stored_block_data_count(&self) -> usize {
        self.inner.lock().stored_block_data.len()
    }

    pub fn runtime_mock(&self) -> Arc<MockRuntime> {
        self.runtime.clone()
    }
}

impl BlockState for MockBlockState {
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
        self.inner.lock().justifications.insert(*hash, justification);
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

pub(crate) struct MockTrieState {
    root: Hash,
}

impl TrieState for MockTrieState {
    fn root(&self) -> Result<Hash, StateError> {
        Ok(self.root)
    }
}

#[derive(Default)]
pub(crate) struct MockStorageState {
    pub lock_balance: AtomicUsize,
}

impl StorageState for MockStorageState {
    fn trie_state(&self, root: &Hash) -> Result<Arc<dyn TrieState>, StateError> {
        Ok(Arc::new(MockTrieState { root: *root }))
    }

    fn lock(&self) {
        self.lock_balance.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.lock_balance.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MockTransactionState {
    pub removed: Mutex<Vec<Extrinsic>>,
}

impl TransactionState for MockTransactionState {
    fn remove_extrinsic(&self, extrinsic: &Extrinsic) {
        self.removed.lock().push(extrinsic.clone());
    }
}

#[derive(Default)]
pub(crate) struct MockBabeVerifier {
    pub verified: AtomicUsize,
}

impl BabeVerifier for MockBabeVerifier {
    fn verify_block(&self, _header: &Header) -> Result<(), VerificationError> {
        self.verified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockFinalityGadget {
    pub verified: AtomicUsize,
}

impl FinalityGadget for MockFinalityGadget {
    fn verify_block_justification(
        &self,
        _hash: &Hash,
        _justification: &[u8],
    ) -> Result<(), VerificationError> {
        self.verified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Import handler that writes imported headers back into the block state, so
/// the engine observes its own progress.
pub(crate) struct MockImportHandler {
    block_state: Arc<MockBlockState>,
    pub imported: Mutex<Vec<(u64, bool)>>,
}

impl MockImportHandler {
    pub fn new(block_state: Arc<MockBlockState>) -> Self {
        Self {
            block_state,
            imported: Mutex::new(Vec::new()),
        }
    }

    pub fn imported_numbers(&self) -> Vec<u64> {
        self.imported.lock().iter().map(|(number, _)| *number).collect()
    }
}

impl BlockImportHandler for MockImportHandler {
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

#[derive(Default)]
pub(crate) struct MockRuntime {
    pub executed: Mutex<Vec<u64>>,
}

impl RuntimeInstance for MockRuntime {
    fn set_context_storage(&self, _state: Arc<dyn TrieState>) {}

    fn execute_block(&self, block: &Block) -> Result<Vec<u8>, ExecutionError> {
        self.executed.lock().push(block.header.number);
        Ok(Vec::new())
    }
}

#[derive(Default)]
pub(crate) struct MockTelemetry {
    pub records: Mutex<Vec<(Hash, u64, &'static str)>>,
}

impl Telemetry for MockTelemetry {
    fn send_block_import(&self, hash: &Hash, number: u64, origin: &'static str) {
        self.records.lock().push((*hash, number, origin));
    }
}

#[derive(Default)]
pub(crate) struct MockNetwork {
    peers: Mutex<Vec<PeerId>>,
    pub handshakes: AtomicUsize,
    pub reported: Mutex<Vec<(ReputationChange, PeerId)>>,
}

impl MockNetwork {
    pub fn connect(&self, who: PeerId) {
        let mut peers = self.peers.lock();
        if !peers.contains(&who) {
            peers.push(who);
        }
    }
}

impl Network for MockNetwork {
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

/// Request maker serving responses out of a [`TestChain`].
pub(crate) struct MockRequestMaker {
    by_hash: HashMap<Hash, usize>,
    blocks: Vec<BlockData>,
    requests: Mutex<Vec<(PeerId, BlockRequest)>>,
    fail_all: AtomicBool,
}

impl MockRequestMaker {
    pub fn serving(chain: &TestChain) -> Self {
        let by_hash = chain
            .blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (block.hash, index))
            .collect();
        Self {
            by_hash,
            blocks: chain.blocks.clone(),
            requests: Mutex::new(Vec::new()),
            fail_all: AtomicBool::new(false),
        }
    }

    pub fn serve_nothing(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn slice_for(&self, request: &BlockRequest) -> Vec<BlockData> {
        let max = request.max as usize;
        match (&request.from, request.direction) {
            (FromBlock::Number(number), Direction::Ascending) => {
                let start = *number as usize;
                self.blocks
                    .iter()
                    .skip(start)
                    .take(max)
                    .cloned()
                    .collect()
            }
            (FromBlock::Hash(hash), Direction::Descending) => {
                let Some(&index) = self.by_hash.get(hash) else {
                    return Vec::new();
                };
                let start = (index + 1).saturating_sub(max);
                self.blocks[start..=index].iter().rev().cloned().collect()
            }
            (FromBlock::Number(number), Direction::Descending) => {
                let index = (*number as usize).min(self.blocks.len().saturating_sub(1));
                let start = (index + 1).saturating_sub(max);
                self.blocks[start..=index].iter().rev().cloned().collect()
            }
            (FromBlock::Hash(hash), Direction::Ascending) => {
                let Some(&index) = self.by_hash.get(hash) else {
                    return Vec::new();
                };
                self.blocks
                    .iter()
                    .skip(index)
                    .take(max)
                    .cloned()
                    .collect()
            }
        }
    }
}

#[async_trait]
impl RequestMaker for MockRequestMaker {
    async fn block_request(
        &self,
        peer: &PeerId,
        request: &BlockRequest,
    ) -> Result<BlockResponse, RequestError> {
        self.requests.lock().push((peer.clone(), request.clone()));
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(RequestError::Timeout);
        }
        let blocks = self.slice_for(request);
        if blocks.is_empty() {
            return Err(RequestError::EmptyMessage);
        }
        Ok(BlockResponse { blocks })
    }
}

/// Full collaborator set wired over one [`TestChain`].
pub(crate) struct MockEnvironment {
    pub block_state: Arc<MockBlockState>,
    pub storage_state: Arc<MockStorageState>,
    pub transaction_state: Arc<MockTransactionState>,
    pub babe_verifier: Arc<MockBabeVerifier>,
    pub finality_gadget: Arc<MockFinalityGadget>,
    pub import_handler: Arc<MockImportHandler>,
    pub telemetry: Arc<MockTelemetry>,
    pub network: Arc<MockNetwork>,
    pub request_maker: Arc<MockRequestMaker>,
}

impl MockEnvironment {
    /// Local chain loaded to `best` (also finalised at `best`), remote chain
    /// fully served by the request maker.
    pub fn with_chain(chain: &TestChain, best: u64) -> Self {
        Self::with_chain_and_finalised(chain, best, best)
    }

    pub fn with_chain_and_finalised(chain: &TestChain, best: u64, finalised: u64) -> Self {
        let block_state = Arc::new(MockBlockState::new(chain.header_at(0)));
        for number in 1..=best {
            block_state.insert_header(chain.header_at(number));
        }
        block_state.set_finalised(chain.header_at(finalised));

        let import_handler = Arc::new(MockImportHandler::new(block_state.clone()));
        Self {
            block_state,
            storage_state: Arc::new(MockStorageState::default()),
            transaction_state: Arc::new(MockTransactionState::default()),
            babe_verifier: Arc::new(MockBabeVerifier::default()),
            finality_gadget: Arc::new(MockFinalityGadget::default()),
            import_handler,
            telemetry: Arc::new(MockTelemetry::default()),
            network: Arc::new(MockNetwork::default()),
            request_maker: Arc::new(MockRequestMaker::serving(chain)),
        }
    }
}
