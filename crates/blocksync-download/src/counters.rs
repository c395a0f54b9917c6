//! Per-peer in-flight download accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::peer::PeerId;

/// Concurrent map of peer to number of requests in flight.
///
/// Entries are created lazily on first use; the map lock is only taken to
/// insert, every update after that is a single atomic operation.
#[derive(Debug, Default)]
pub struct DownloadCounters {
    counts: DashMap<PeerId, Arc<AtomicUsize>>,
}

impl DownloadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests currently in flight to `peer`.
    pub fn load(&self, peer: PeerId) -> usize {
        self.counts
            .get(&peer)
            .map(|count| count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Requests currently in flight across all peers.
    pub fn total(&self) -> usize {
        self.counts
            .iter()
            .map(|entry| entry.value().load(Ordering::Acquire))
            .sum()
    }

    /// Count one more request to `peer`. The count drops again when the
    /// returned guard is dropped.
    pub fn acquire(&self, peer: PeerId) -> InFlightGuard {
        let counter = Arc::clone(self.counts.entry(peer).or_default().value());
        counter.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { counter }
    }

    /// Drop idle entries for peers `keep` rejects. Returns how many went.
    pub fn prune(&self, keep: impl Fn(&PeerId) -> bool) -> usize {
        let before = self.counts.len();
        self.counts
            .retain(|peer, count| count.load(Ordering::Acquire) > 0 || keep(peer));
        before - self.counts.len()
    }

    pub fn tracked_peers(&self) -> usize {
        self.counts.len()
    }
}

/// Holds one unit of a peer's in-flight count.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let counters = DownloadCounters::new();
        let a = counters.acquire(PeerId(1));
        let b = counters.acquire(PeerId(1));
        let c = counters.acquire(PeerId(2));
        assert_eq!(counters.load(PeerId(1)), 2);
        assert_eq!(counters.total(), 3);
        drop(a);
        drop(c);
        assert_eq!(counters.load(PeerId(1)), 1);
        assert_eq!(counters.load(PeerId(2)), 0);
        drop(b);
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn unknown_peer_has_zero_load() {
        assert_eq!(DownloadCounters::new().load(PeerId(99)), 0);
    }

    #[test]
    fn prune_keeps_busy_entries() {
        let counters = DownloadCounters::new();
        drop(counters.acquire(PeerId(1)));
        let _busy = counters.acquire(PeerId(2));
        drop(counters.acquire(PeerId(3)));

        let pruned = counters.prune(|peer| *peer == PeerId(3));
        assert_eq!(pruned, 1);
        assert_eq!(counters.tracked_peers(), 2);
        assert_eq!(counters.load(PeerId(2)), 1);
    }

    #[test]
    fn guards_survive_pruning() {
        let counters = DownloadCounters::new();
        let guard = counters.acquire(PeerId(5));
        counters.prune(|_| false);
        assert_eq!(counters.load(PeerId(5)), 1);
        drop(guard);
        assert_eq!(counters.load(PeerId(5)), 0);
    }
}
