//! Per-peer request workers.
//!
//! Each known peer owns one worker slot backed by a tokio task. A worker
//! processes one block request at a time against its peer and pushes the
//! outcome — response or error, always with the original request — onto the
//! caller's result sink. The pool never retries; retry policy belongs to the
//! chain assembler.

use crate::error::SyncError;
use crate::traits::{Network, RequestMaker};
use dot_network::{BlockRequest, BlockResponse, PeerId, RequestError};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

/// How long an ignored peer stays out of the worker rotation.
const IGNORE_COOLDOWN: Duration = Duration::from_secs(2 * 60);

/// How long a punished peer stays out of the worker rotation.
const PUNISH_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// Deadline for draining workers on shutdown.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// The outcome of one dispatched block request.
#[derive(Debug)]
pub struct SyncTaskResult {
    /// The peer that served (or failed) the request.
    pub who: PeerId,
    /// The original request, so the caller can retry elsewhere.
    pub request: BlockRequest,
    /// The response, when the request succeeded.
    pub response: Option<BlockResponse>,
    /// The failure, when it did not.
    pub error: Option<RequestError>,
}

/// A request bound for a worker, with the sink its result goes to.
struct SyncTask {
    request: BlockRequest,
    result_tx: mpsc::UnboundedSender<SyncTaskResult>,
}

/// Availability of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Idle and eligible for dispatch.
    Available,
    /// Processing a request.
    Busy,
    /// Temporarily out of rotation (e.g. served a bad block).
    Ignored,
    /// Out of rotation for protocol-level misbehavior.
    Punished,
}

struct WorkerSlot {
    status: WorkerStatus,
    since: Instant,
    task_tx: mpsc::UnboundedSender<SyncTask>,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<PeerId, WorkerSlot>,
    queued: VecDeque<SyncTask>,
}

/// Pool of per-peer workers multiplexing block requests across the network.
pub struct SyncWorkerPool {
    network: Arc<dyn Network>,
    request_maker: Arc<dyn RequestMaker>,
    state: Arc<Mutex<PoolState>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SyncWorkerPool {
    /// Create a pool over the given transport collaborators.
    pub fn new(network: Arc<dyn Network>, request_maker: Arc<dyn RequestMaker>) -> Self {
        Self {
            network,
            request_maker,
            state: Arc::new(Mutex::new(PoolState::default())),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Schedule one request.
    ///
    /// A `preferred` peer is used when its slot is idle; otherwise any idle
    /// non-ignored slot is picked at random, and with no idle slot the task
    /// waits in a FIFO for the next worker to free up.
    pub fn submit_request(
        &self,
        request: BlockRequest,
        preferred: Option<&PeerId>,
        result_tx: mpsc::UnboundedSender<SyncTaskResult>,
    ) {
        let task = SyncTask { request, result_tx };
        let mut state = self.state.lock();

        let chosen = match preferred {
            Some(who) if slot_is_available(&state, who) => Some(who.clone()),
            _ => {
                let idle: Vec<PeerId> = state
                    .slots
                    .iter()
                    .filter(|(_, slot)| slot.status == WorkerStatus::Available)
                    .map(|(who, _)| who.clone())
                    .collect();
                idle.choose(&mut rand::thread_rng()).cloned()
            }
        };

        match chosen {
            Some(who) => dispatch(&mut state, &who, task),
            None => {
                trace!("no idle worker, queueing request");
                state.queued.push_back(task);
            }
        }
    }

    /// Schedule a batch of requests, returning the sink their results land on
    /// in completion order.
    pub fn submit_requests(
        &self,
        requests: Vec<BlockRequest>,
    ) -> mpsc::UnboundedReceiver<SyncTaskResult> {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        for request in requests {
            self.submit_request(request, None, result_tx.clone());
        }
        result_rx
    }

    /// Re-seed the pool from the transport's current peer list and lift the
    /// ignore/punish status of peers whose cool-down elapsed.
    pub fn use_connected_peers(&self) {
        let connected = self.network.peers();
        {
            let mut state = self.state.lock();
            for (who, slot) in state.slots.iter_mut() {
                let cooldown = match slot.status {
                    WorkerStatus::Ignored => IGNORE_COOLDOWN,
                    WorkerStatus::Punished => PUNISH_COOLDOWN,
                    _ => continue,
                };
                if slot.since.elapsed() >= cooldown {
                    debug!(peer = %who, "peer re-admitted to the worker pool");
                    slot.status = WorkerStatus::Available;
                    slot.since = Instant::now();
                }
            }
        }
        for who in connected {
            self.new_peer(who);
        }
    }

    /// Record a peer as alive and eligible as a worker.
    pub fn from_block_announce(&self, who: PeerId) {
        self.new_peer(who);
    }

    /// Ensure a worker slot exists for `who`, spawning its task if needed.
    pub fn new_peer(&self, who: PeerId) {
        if self.cancel.is_cancelled() {
            return;
        }

        let mut state = self.state.lock();
        if state.slots.contains_key(&who) {
            return;
        }

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        state.slots.insert(
            who.clone(),
            WorkerSlot {
                status: WorkerStatus::Available,
                since: Instant::now(),
                task_tx,
            },
        );
        drop(state);

        debug!(peer = %who, "new worker in the sync pool");
        let request_maker = self.request_maker.clone();
        let pool_state = self.state.clone();
        let cancel = self.cancel.clone();
        self.tracker
            .spawn(worker_loop(who, request_maker, pool_state, task_rx, cancel));

        // a queued task may have been waiting for this slot
        let mut state = self.state.lock();
        if let Some(task) = state.queued.pop_front() {
            let idle: Vec<PeerId> = state
                .slots
                .iter()
                .filter(|(_, slot)| slot.status == WorkerStatus::Available)
                .map(|(who, _)| who.clone())
                .collect();
            match idle.choose(&mut rand::thread_rng()).cloned() {
                Some(who) => dispatch(&mut state, &who, task),
                None => state.queued.push_front(task),
            }
        }
    }

    /// Temporarily take a peer out of the worker rotation.
    pub fn ignore_peer_as_worker(&self, who: &PeerId) {
        self.set_status(who, WorkerStatus::Ignored);
    }

    /// Take a peer out of the rotation for protocol-level misbehavior.
    pub fn punish_peer(&self, who: &PeerId) {
        self.set_status(who, WorkerStatus::Punished);
    }

    fn set_status(&self, who: &PeerId, status: WorkerStatus) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(who) {
            warn!(peer = %who, ?status, "worker removed from rotation");
            slot.status = status;
            slot.since = Instant::now();
        }
    }

    /// Current status of a peer's slot, if one exists.
    pub fn worker_status(&self, who: &PeerId) -> Option<WorkerStatus> {
        self.state.lock().slots.get(who).map(|slot| slot.status)
    }

    /// Number of workers eligible for dispatch (idle or busy).
    pub fn total_workers(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| {
                matches!(slot.status, WorkerStatus::Available | WorkerStatus::Busy)
            })
            .count()
    }

    /// Stop all workers, waiting up to the shutdown deadline for in-flight
    /// requests to finish.
    pub async fn stop(&self) -> Result<(), SyncError> {
        self.cancel.cancel();
        self.state.lock().queued.clear();
        self.tracker.close();

        match tokio::time::timeout(STOP_TIMEOUT, self.tracker.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(SyncError::StopTimeout),
        }
    }
}

fn slot_is_available(state: &PoolState, who: &PeerId) -> bool {
    state
        .slots
        .get(who)
        .map(|slot| slot.status == WorkerStatus::Available)
        .unwrap_or(false)
}

fn dispatch(state: &mut PoolState, who: &PeerId, task: SyncTask) {
    if let Some(slot) = state.slots.get_mut(who) {
        slot.status = WorkerStatus::Busy;
        slot.since = Instant::now();
        if slot.task_tx.send(task).is_err() {
            // worker task is gone; drop the slot so it cannot be picked again
            state.slots.remove(who);
        }
    }
}

async fn worker_loop(
    who: PeerId,
    request_maker: Arc<dyn RequestMaker>,
    state: Arc<Mutex<PoolState>>,
    mut task_rx: mpsc::UnboundedReceiver<SyncTask>,
    cancel: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = task_rx.recv() => match maybe {
                Some(task) => task,
                None => return,
            },
        };

        let mut current = Some(task);
        while let Some(SyncTask { request, result_tx }) = current.take() {
            trace!(peer = %who, %request, "dispatching block request");
            let result = match request_maker.block_request(&who, &request).await {
                Ok(response) => SyncTaskResult {
                    who: who.clone(),
                    request,
                    response: Some(response),
                    error: None,
                },
                Err(error) => SyncTaskResult {
                    who: who.clone(),
                    request,
                    response: None,
                    error: Some(error),
                },
            };
            let _ = result_tx.send(result);

            // pick up queued work before going idle; status decisions happen
            // under the single pool lock to avoid losing tasks. A worker that
            // was ignored or punished mid-request must not take more work.
            let mut state = state.lock();
            let still_eligible = state
                .slots
                .get(&who)
                .map(|slot| slot.status == WorkerStatus::Busy)
                .unwrap_or(false);
            current = if still_eligible {
                state.queued.pop_front()
            } else {
                None
            };
            if current.is_none() {
                if let Some(slot) = state.slots.get_mut(&who) {
                    if slot.status == WorkerStatus::Busy {
                        slot.status = WorkerStatus::Available;
                        slot.since = Instant::now();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dot_network::{BlockResponse, Direction, FromBlock, BOOTSTRAP_REQUEST_DATA};
    use dot_types::{BlockData, Hash};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoRequestMaker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestMaker for EchoRequestMaker {
        async fn block_request(
            &self,
            _peer: &PeerId,
            _request: &BlockRequest,
        ) -> Result<BlockResponse, RequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BlockResponse {
                blocks: vec![BlockData::from_hash(Hash::zero())],
            })
        }
    }

    struct EmptyNetwork;

    impl Network for EmptyNetwork {
        fn block_announce_handshake(
            &self,
            _best: &dot_types::Header,
        ) -> Result<(), RequestError> {
            Ok(())
        }

        fn peers(&self) -> Vec<PeerId> {
            Vec::new()
        }

        fn report_peer(&self, _change: dot_network::ReputationChange, _peer: &PeerId) {}
    }

    fn request() -> BlockRequest {
        BlockRequest::new(
            BOOTSTRAP_REQUEST_DATA,
            FromBlock::Number(1),
            Direction::Ascending,
            1,
        )
    }

    fn pool_with_maker(maker: Arc<EchoRequestMaker>) -> SyncWorkerPool {
        SyncWorkerPool::new(Arc::new(EmptyNetwork), maker)
    }

    #[tokio::test]
    async fn test_preferred_peer_serves_request() {
        let maker = Arc::new(EchoRequestMaker {
            calls: AtomicUsize::new(0),
        });
        let pool = pool_with_maker(maker.clone());
        let who = PeerId::from_bytes(vec![1]);
        pool.new_peer(who.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.submit_request(request(), Some(&who), tx);

        let result = rx.recv().await.unwrap();
        assert_eq!(result.who, who);
        assert!(result.response.is_some());
        assert!(result.error.is_none());
        assert_eq!(maker.calls.load(Ordering::SeqCst), 1);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_request_runs_when_peer_arrives() {
        let maker = Arc::new(EchoRequestMaker {
            calls: AtomicUsize::new(0),
        });
        let pool = pool_with_maker(maker.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.submit_request(request(), None, tx);
        assert_eq!(pool.total_workers(), 0);

        pool.new_peer(PeerId::from_bytes(vec![7]));
        let result = rx.recv().await.unwrap();
        assert!(result.response.is_some());

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_batched_results_all_arrive() {
        let maker = Arc::new(EchoRequestMaker {
            calls: AtomicUsize::new(0),
        });
        let pool = pool_with_maker(maker.clone());
        pool.new_peer(PeerId::from_bytes(vec![1]));
        pool.new_peer(PeerId::from_bytes(vec![2]));

        let mut rx = pool.submit_requests(vec![request(), request(), request(), request()]);
        for _ in 0..4 {
            assert!(rx.recv().await.unwrap().response.is_some());
        }
        assert_eq!(maker.calls.load(Ordering::SeqCst), 4);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ignored_peer_not_counted_or_picked() {
        let maker = Arc::new(EchoRequestMaker {
            calls: AtomicUsize::new(0),
        });
        let pool = pool_with_maker(maker.clone());
        let bad = PeerId::from_bytes(vec![1]);
        pool.new_peer(bad.clone());
        pool.ignore_peer_as_worker(&bad);

        assert_eq!(pool.total_workers(), 0);
        assert_eq!(pool.worker_status(&bad), Some(WorkerStatus::Ignored));

        // request must wait in the queue, not go to the ignored peer
        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.submit_request(request(), Some(&bad), tx);
        assert!(rx.try_recv().is_err());

        pool.new_peer(PeerId::from_bytes(vec![2]));
        assert!(rx.recv().await.unwrap().response.is_some());

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_clean_with_idle_workers() {
        let maker = Arc::new(EchoRequestMaker {
            calls: AtomicUsize::new(0),
        });
        let pool = pool_with_maker(maker);
        pool.new_peer(PeerId::from_bytes(vec![1]));
        pool.stop().await.unwrap();
    }
}
