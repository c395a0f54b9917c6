//! Queued block request descriptors.

use std::cmp::Ordering;
use std::sync::Arc;

use blocksync_core::types::Hash256;

use crate::peer::{PeerHandle, PeerId, PeerNode};

/// An immutable request to download one block.
///
/// Descriptors order by `(priority, block_hash, suggested peer id)`, with a
/// missing peer sorting last. Lower priority values dequeue first.
#[derive(Debug, Clone)]
pub struct PendingBlockInventory {
    priority: i64,
    block_hash: Hash256,
    block_height: Option<u64>,
    suggested_peer: Option<PeerHandle>,
}

impl PendingBlockInventory {
    pub fn new(priority: i64, block_hash: Hash256, block_height: Option<u64>) -> Self {
        Self {
            priority,
            block_hash,
            block_height,
            suggested_peer: None,
        }
    }

    /// Descriptor for a block a specific peer announced.
    pub fn announced(priority: i64, block_hash: Hash256, peer: &Arc<dyn PeerNode>) -> Self {
        Self {
            priority,
            block_hash,
            block_height: None,
            suggested_peer: Some(PeerHandle::new(peer)),
        }
    }

    /// Descriptor produced by the main-chain planner: priority is the height.
    pub fn at_height(block_hash: Hash256, height: u64) -> Self {
        Self::new(i64::try_from(height).unwrap_or(i64::MAX), block_hash, Some(height))
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn block_hash(&self) -> &Hash256 {
        &self.block_hash
    }

    pub fn block_height(&self) -> Option<u64> {
        self.block_height
    }

    pub fn suggested_peer(&self) -> Option<&PeerHandle> {
        self.suggested_peer.as_ref()
    }

    /// The descriptor to queue after a failed attempt: same block and height,
    /// `step` lower in priority, and no peer suggestion.
    pub fn deprioritized(&self, step: i64) -> Self {
        Self {
            priority: self.priority.saturating_add(step),
            block_hash: self.block_hash,
            block_height: self.block_height,
            suggested_peer: None,
        }
    }

    fn peer_key(&self) -> u64 {
        self.suggested_peer
            .as_ref()
            .map(|handle| handle.id().0)
            .unwrap_or(u64::MAX)
    }

    /// Id of the suggested peer, if one was given.
    pub fn suggested_peer_id(&self) -> Option<PeerId> {
        self.suggested_peer.as_ref().map(PeerHandle::id)
    }
}

impl PartialEq for PendingBlockInventory {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingBlockInventory {}

impl PartialOrd for PendingBlockInventory {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingBlockInventory {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.block_hash.cmp(&other.block_hash))
            .then_with(|| self.peer_key().cmp(&other.peer_key()))
    }
}
