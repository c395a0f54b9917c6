//! Choosing the peer that serves a block.

use std::sync::Arc;

use blocksync_core::types::Hash256;
use tracing::trace;

use crate::counters::DownloadCounters;
use crate::peer::{InventoryTracker, PeerCollector, PeerNode};

pub struct PeerSelector {
    peers: Arc<dyn PeerCollector>,
    inventory: Arc<dyn InventoryTracker>,
}

impl PeerSelector {
    pub fn new(peers: Arc<dyn PeerCollector>, inventory: Arc<dyn InventoryTracker>) -> Self {
        Self { peers, inventory }
    }

    pub fn connected_peers(&self) -> Vec<Arc<dyn PeerNode>> {
        self.peers.connected_peers()
    }

    /// Pick a peer below `max_per_peer` in-flight requests to serve `hash`.
    ///
    /// Peers that announced the block win, least loaded first. Otherwise any
    /// connected peer is eligible; with a known `height`, peers reporting a
    /// shorter or unknown chain are dropped and the closest one at or above
    /// `height` is chosen.
    pub fn select_peer(
        &self,
        hash: &Hash256,
        height: Option<u64>,
        counters: &DownloadCounters,
        max_per_peer: usize,
    ) -> Option<Arc<dyn PeerNode>> {
        let mut announced: Vec<(usize, Arc<dyn PeerNode>)> = self
            .inventory
            .peers_with_inventory(hash)
            .into_iter()
            .filter(|peer| peer.is_connected())
            .map(|peer| (counters.load(peer.id()), peer))
            .filter(|(load, _)| *load < max_per_peer)
            .collect();
        announced.sort_by_key(|(load, _)| *load);
        if let Some((_, peer)) = announced.into_iter().next() {
            trace!(%hash, peer = %peer.id(), "download: selected announcing peer");
            return Some(peer);
        }

        let mut available = self
            .peers
            .connected_peers()
            .into_iter()
            .filter(|peer| counters.load(peer.id()) < max_per_peer);

        let Some(height) = height else {
            return available.next();
        };

        available
            .filter_map(|peer| {
                let distance = peer.advertised_height()?.checked_sub(height)?;
                Some((distance, peer))
            })
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, peer)| peer)
    }
}
