//! Peer capabilities consumed by the downloader.
//!
//! The wire protocol lives elsewhere; the scheduler only needs to know who a
//! peer is, how far its chain reaches, whether it is still connected, and how
//! to ask it for a block.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use blocksync_core::error::NetworkError;
use blocksync_core::types::{Block, Hash256};

/// Stable identity of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Identifier the scheduler assigns to each issued block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Hint passed to the peer alongside a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPriority {
    /// The peer is expected to have the block; serve promptly.
    Normal,
    /// Speculative request to a peer that may not have the block.
    None,
}

/// A remote node able to serve blocks.
#[async_trait]
pub trait PeerNode: Send + Sync {
    fn id(&self) -> PeerId;

    /// Height of the peer's best chain as it last reported it.
    fn advertised_height(&self) -> Option<u64>;

    fn is_connected(&self) -> bool;

    /// Fetch one block. Resolves when the peer answers or the request fails.
    async fn request_block(&self, hash: Hash256, priority: RequestPriority) -> Result<Block, NetworkError>;
}

/// Source of the currently connected peers.
pub trait PeerCollector: Send + Sync {
    fn connected_peers(&self) -> Vec<Arc<dyn PeerNode>>;
}

/// Tracks which peers have announced which blocks.
pub trait InventoryTracker: Send + Sync {
    fn peers_with_inventory(&self, hash: &Hash256) -> Vec<Arc<dyn PeerNode>>;
}

/// Non-owning reference to a peer.
///
/// Holding a handle never keeps a peer alive. [`upgrade`](Self::upgrade)
/// yields `None` once the peer is dropped or reports itself disconnected.
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    peer: Weak<dyn PeerNode>,
}

impl PeerHandle {
    pub fn new(peer: &Arc<dyn PeerNode>) -> Self {
        Self {
            id: peer.id(),
            peer: Arc::downgrade(peer),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Arc<dyn PeerNode>> {
        self.peer.upgrade().filter(|peer| peer.is_connected())
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("alive", &(self.peer.strong_count() > 0))
            .finish()
    }
}

/// Fixed peer list; handy for wiring and tests.
#[derive(Default, Clone)]
pub struct StaticPeers {
    peers: Vec<Arc<dyn PeerNode>>,
}

impl StaticPeers {
    pub fn new(peers: Vec<Arc<dyn PeerNode>>) -> Self {
        Self { peers }
    }
}

impl PeerCollector for StaticPeers {
    fn connected_peers(&self) -> Vec<Arc<dyn PeerNode>> {
        self.peers.iter().filter(|p| p.is_connected()).cloned().collect()
    }
}

/// Tracker that knows of no announcements; selection falls back to heights.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInventory;

impl InventoryTracker for NoInventory {
    fn peers_with_inventory(&self, _hash: &Hash256) -> Vec<Arc<dyn PeerNode>> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubPeer {
        id: u64,
        connected: bool,
    }

    #[async_trait]
    impl PeerNode for StubPeer {
        fn id(&self) -> PeerId {
            PeerId(self.id)
        }

        fn advertised_height(&self) -> Option<u64> {
            None
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn request_block(&self, _hash: Hash256, _priority: RequestPriority) -> Result<Block, NetworkError> {
            Err(NetworkError::Timeout)
        }
    }

    fn stub(id: u64, connected: bool) -> Arc<dyn PeerNode> {
        Arc::new(StubPeer { id, connected })
    }

    #[test]
    fn handle_does_not_keep_peer_alive() {
        let peer = stub(7, true);
        let handle = PeerHandle::new(&peer);
        assert_eq!(handle.upgrade().map(|p| p.id()), Some(PeerId(7)));
        drop(peer);
        assert!(handle.upgrade().is_none());
        assert_eq!(handle.id(), PeerId(7));
    }

    #[test]
    fn handle_to_disconnected_peer_upgrades_to_none() {
        let peer = stub(1, false);
        let handle = PeerHandle::new(&peer);
        assert!(handle.upgrade().is_none());
    }

    #[test]
    fn static_peers_skip_disconnected() {
        let peers = StaticPeers::new(vec![stub(1, true), stub(2, false), stub(3, true)]);
        let ids: Vec<PeerId> = peers.connected_peers().iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![PeerId(1), PeerId(3)]);
    }

    #[test]
    fn display_formats() {
        assert_eq!(PeerId(4).to_string(), "peer-4");
        assert_eq!(RequestId(12).to_string(), "req-12");
    }
}
