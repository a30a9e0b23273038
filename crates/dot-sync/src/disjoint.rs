//! The disjoint block set: announced blocks that are not ready to process.
//!
//! A block lands here when we only know its hash or number, its parent is
//! unknown, or its body is missing. Entries are purged when they fall below
//! the finalised number, when they outlive their TTL, or — at capacity —
//! oldest first.

use crate::error::SyncError;
use dot_network::MAX_BLOCKS_IN_RESPONSE;
use dot_types::{Body, BlockData, FinalityInfo, Hash, Header};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Upper bound on tracked pending blocks.
pub const PENDING_BLOCKS_LIMIT: usize = MAX_BLOCKS_IN_RESPONSE as usize * 32;

/// A block known to exist but not yet ready to be processed.
///
/// Fields other than the hash may be unknown.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    /// Block hash.
    pub hash: Hash,
    /// Block number, if known.
    pub number: Option<u64>,
    /// Block header, if known.
    pub header: Option<Header>,
    /// Block body, if known.
    pub body: Option<Body>,
    /// Justification, if known.
    pub justification: Option<Vec<u8>>,
    /// Arrival time, for TTL and capacity eviction.
    received_at: Instant,
    /// Arrival sequence, orders evictions within one instant.
    seq: u64,
}

impl PendingBlock {
    /// Convert into block data for the import path.
    pub fn to_block_data(&self) -> BlockData {
        BlockData {
            hash: self.hash,
            header: self.header.clone(),
            body: self.body.clone(),
            justification: self.justification.clone(),
        }
    }
}

/// Housekeeping configuration for the disjoint set.
#[derive(Debug, Clone)]
pub struct DisjointBlockSetConfig {
    /// Maximum number of tracked blocks.
    pub limit: usize,
    /// How long an entry may stay before the housekeeper drops it.
    pub ttl: Duration,
    /// Interval between TTL sweeps.
    pub housekeeping_interval: Duration,
}

impl Default for DisjointBlockSetConfig {
    fn default() -> Self {
        Self {
            limit: PENDING_BLOCKS_LIMIT,
            ttl: Duration::from_secs(10 * 60),
            housekeeping_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<Hash, PendingBlock>,
    next_seq: u64,
}

impl Inner {
    fn evict_oldest(&mut self) {
        let oldest = self
            .blocks
            .values()
            .min_by_key(|block| (block.received_at, block.seq))
            .map(|block| block.hash);
        if let Some(hash) = oldest {
            trace!(block = %hash, "pending set full, evicting oldest entry");
            self.blocks.remove(&hash);
        }
    }
}

/// Set of announced-but-unready blocks, bounded by [`PENDING_BLOCKS_LIMIT`].
pub struct DisjointBlockSet {
    config: DisjointBlockSetConfig,
    inner: Mutex<Inner>,
}

impl Default for DisjointBlockSet {
    fn default() -> Self {
        Self::new(DisjointBlockSetConfig::default())
    }
}

impl DisjointBlockSet {
    /// Create a set with the given housekeeping configuration.
    pub fn new(config: DisjointBlockSetConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Whether the set tracks a block with this hash.
    pub fn has_block(&self, hash: &Hash) -> bool {
        self.inner.lock().blocks.contains_key(hash)
    }

    /// Insert a header, merging with a partial record for the same hash.
    ///
    /// Fails with [`SyncError::AlreadyInDisjointSet`] when a record with this
    /// header is already tracked.
    pub fn add_header(&self, header: Header) -> Result<(), SyncError> {
        let hash = header.hash();
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.blocks.get_mut(&hash) {
            if existing.header.is_some() {
                return Err(SyncError::AlreadyInDisjointSet {
                    number: header.number,
                    hash,
                });
            }
            existing.number = Some(header.number);
            existing.header = Some(header);
            return Ok(());
        }

        if inner.blocks.len() >= self.config.limit {
            inner.evict_oldest();
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.blocks.insert(
            hash,
            PendingBlock {
                hash,
                number: Some(header.number),
                header: Some(header),
                body: None,
                justification: None,
                received_at: Instant::now(),
                seq,
            },
        );
        Ok(())
    }

    /// Insert a record carrying only a hash and number.
    pub fn add_hash_and_number(&self, hash: Hash, number: u64) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.blocks.get_mut(&hash) {
            existing.number.get_or_insert(number);
            return;
        }

        if inner.blocks.len() >= self.config.limit {
            inner.evict_oldest();
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.blocks.insert(
            hash,
            PendingBlock {
                hash,
                number: Some(number),
                header: None,
                body: None,
                justification: None,
                received_at: Instant::now(),
                seq,
            },
        );
    }

    /// Fetch a tracked block by hash.
    pub fn get_block(&self, hash: &Hash) -> Option<PendingBlock> {
        self.inner.lock().blocks.get(hash).cloned()
    }

    /// Snapshot of all tracked blocks.
    pub fn get_blocks(&self) -> Vec<PendingBlock> {
        self.inner.lock().blocks.values().cloned().collect()
    }

    /// Drop a tracked block.
    pub fn remove_block(&self, hash: &Hash) {
        self.inner.lock().blocks.remove(hash);
    }

    /// Number of tracked blocks.
    pub fn size(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Drop every entry at or below the finalised number. Entries with an
    /// unknown number are left to the TTL sweep.
    fn purge_finalised(&self, finalised_number: u64) {
        let mut inner = self.inner.lock();
        let before = inner.blocks.len();
        inner
            .blocks
            .retain(|_, block| block.number.map_or(true, |number| number > finalised_number));
        let purged = before - inner.blocks.len();
        if purged > 0 {
            debug!(purged, finalised_number, "purged finalised pending blocks");
        }
    }

    /// Drop entries older than the configured TTL.
    fn purge_stale(&self) {
        let ttl = self.config.ttl;
        let mut inner = self.inner.lock();
        let before = inner.blocks.len();
        inner
            .blocks
            .retain(|_, block| block.received_at.elapsed() <= ttl);
        let purged = before - inner.blocks.len();
        if purged > 0 {
            debug!(purged, "purged stale pending blocks");
        }
    }

    /// Housekeeper loop: purge on every finalisation notification and on each
    /// TTL tick, until cancelled.
    pub async fn run(
        &self,
        mut finalised_rx: mpsc::UnboundedReceiver<FinalityInfo>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.housekeeping_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("disjoint block set housekeeper stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.purge_stale();
                }
                info = finalised_rx.recv() => {
                    let Some(info) = info else {
                        warn!("finalisation notifier closed, stopping housekeeper");
                        return;
                    };
                    self.purge_finalised(info.header.number);
                }
            }
        }
    }
}
