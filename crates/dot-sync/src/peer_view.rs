//! Tracking of the best block each peer has shown us.

use dashmap::DashMap;
use dot_network::PeerId;
use dot_types::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// The latest state we know of a single peer: its best block hash and number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    /// The peer this view belongs to.
    pub who: PeerId,
    /// Hash of the peer's best block.
    pub best_hash: Hash,
    /// Number of the peer's best block.
    pub best_number: u64,
    /// Update sequence, used to break ties toward the freshest view.
    seq: u64,
}

/// The set of per-peer views, from which the sync target is derived.
#[derive(Debug, Default)]
pub struct PeerViewSet {
    views: DashMap<PeerId, PeerView>,
    next_seq: AtomicU64,
}

impl PeerViewSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the best block a peer announced.
    ///
    /// Peers occasionally announce a block below one they already showed us;
    /// the set keeps the highest number each peer has ever shown.
    pub fn update(&self, who: PeerId, best_hash: Hash, best_number: u64) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut entry = self.views.entry(who.clone()).or_insert_with(|| PeerView {
            who: who.clone(),
            best_hash,
            best_number,
            seq,
        });

        if best_number < entry.best_number {
            trace!(peer = %who, announced = best_number, kept = entry.best_number,
                "stale best block announced, keeping previous view");
            return;
        }

        entry.best_hash = best_hash;
        entry.best_number = best_number;
        entry.seq = seq;
    }

    /// The sync target: the maximum best number across all views, 0 if empty.
    ///
    /// Ties are broken toward the most recently updated view.
    pub fn target(&self) -> u64 {
        self.best_view().map_or(0, |view| view.best_number)
    }

    /// The view holding the sync target, if any.
    pub fn best_view(&self) -> Option<PeerView> {
        self.views
            .iter()
            .max_by_key(|entry| (entry.best_number, entry.seq))
            .map(|entry| entry.value().clone())
    }

    /// Number of tracked peers.
    pub fn size(&self) -> usize {
        self.views.len()
    }

    /// Snapshot of all views.
    pub fn views(&self) -> Vec<PeerView> {
        self.views.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Drop the view of a disconnected peer.
    pub fn remove(&self, who: &PeerId) {
        self.views.remove(who);
    }
}
