//! The block download scheduler.
//!
//! [`BlockDownloader`] owns a priority-ordered queue of
//! [`PendingBlockInventory`] descriptors and per-peer in-flight counters.
//! Each [`run_once`](BlockDownloader::run_once) pass drains the queue until it
//! runs dry, the global in-flight limit is reached, or no peer can take the
//! next block. Requests run as Tokio tasks; completions decrement the
//! counters, stage the block, hand it to the registered
//! [`BlockDownloadCallback`] on a blocking worker, and wake the scheduler.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use blocksync_core::constants::{MIN_DISTANCE_FOR_NORMAL_PRIORITY, MIN_RETRY_PRIORITY_STEP};
use blocksync_core::error::{NetworkError, StorageError};
use blocksync_core::traits::PendingBlockStore;
use blocksync_core::types::{Block, Hash256};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::config::DownloadConfig;
use crate::counters::{DownloadCounters, InFlightGuard};
use crate::inventory::PendingBlockInventory;
use crate::peer::{InventoryTracker, PeerCollector, PeerId, PeerNode, RequestId, RequestPriority};
use crate::planner::BlockDownloadPlanner;
use crate::selector::PeerSelector;

/// Receives every newly staged block.
///
/// Called on a blocking worker thread, never on the scheduler. `peer` is
/// `None` for blocks that arrived through
/// [`submit_block`](BlockDownloader::submit_block).
pub trait BlockDownloadCallback: Send + Sync {
    fn on_block_downloaded(&self, block: Block, peer: Option<PeerId>);
}

struct Inner {
    planner: Arc<dyn BlockDownloadPlanner>,
    pending: Arc<dyn PendingBlockStore>,
    selector: PeerSelector,
    callback: RwLock<Option<Arc<dyn BlockDownloadCallback>>>,
    queue: Mutex<BTreeSet<PendingBlockInventory>>,
    counters: DownloadCounters,
    /// Hashes with a request outstanding. Entries leave only after the block
    /// is staged or the descriptor is requeued.
    in_flight: DashMap<Hash256, RequestId>,
    max_concurrent_downloads: AtomicUsize,
    max_concurrent_downloads_per_peer: AtomicUsize,
    next_request_id: AtomicU64,
    /// Serializes passes so admission checks see every increment.
    pass: Mutex<()>,
    wake: Notify,
}

/// Cheaply cloneable handle to the scheduler.
#[derive(Clone)]
pub struct BlockDownloader {
    inner: Arc<Inner>,
}

impl BlockDownloader {
    pub fn new(
        planner: Arc<dyn BlockDownloadPlanner>,
        pending: Arc<dyn PendingBlockStore>,
        peers: Arc<dyn PeerCollector>,
        inventory: Arc<dyn InventoryTracker>,
        config: &DownloadConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                planner,
                pending,
                selector: PeerSelector::new(peers, inventory),
                callback: RwLock::new(None),
                queue: Mutex::new(BTreeSet::new()),
                counters: DownloadCounters::new(),
                in_flight: DashMap::new(),
                max_concurrent_downloads: AtomicUsize::new(config.max_concurrent_downloads),
                max_concurrent_downloads_per_peer: AtomicUsize::new(config.max_concurrent_downloads_per_peer),
                next_request_id: AtomicU64::new(1),
                pass: Mutex::new(()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn set_callback(&self, callback: Arc<dyn BlockDownloadCallback>) {
        *self.inner.callback.write() = Some(callback);
    }

    pub fn set_max_concurrent_downloads(&self, max: usize) {
        self.inner.max_concurrent_downloads.store(max, Ordering::Release);
    }

    pub fn set_max_concurrent_downloads_per_peer(&self, max: usize) {
        self.inner.max_concurrent_downloads_per_peer.store(max, Ordering::Release);
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.inner.max_concurrent_downloads.load(Ordering::Acquire)
    }

    pub fn max_concurrent_downloads_per_peer(&self) -> usize {
        self.inner.max_concurrent_downloads_per_peer.load(Ordering::Acquire)
    }

    pub fn planner(&self) -> &Arc<dyn BlockDownloadPlanner> {
        &self.inner.planner
    }

    /// Fill an empty queue with the planner's next batch. Returns how many
    /// descriptors were added.
    pub fn start(&self) -> usize {
        if !self.inner.queue.lock().is_empty() {
            return 0;
        }
        let batch = self.inner.planner.next_batch();
        let count = batch.len();
        if count > 0 {
            debug!(count, "download: queued planner batch");
            self.inner.queue.lock().extend(batch);
        }
        count
    }

    /// Queue a block a peer announced, then wake the scheduler.
    pub fn request_block(&self, hash: Hash256, priority: i64, peer: Option<&Arc<dyn PeerNode>>) {
        let inventory = match peer {
            Some(peer) => PendingBlockInventory::announced(priority, hash, peer),
            None => PendingBlockInventory::new(priority, hash, None),
        };
        trace!(%hash, priority, "download: block requested");
        self.inner.queue.lock().insert(inventory);
        self.wake();
    }

    /// Stage a block obtained outside the scheduler.
    ///
    /// Returns `false` without invoking the callback when the block is
    /// already staged. Queue entries for it are left in place and skipped
    /// when reached.
    pub fn submit_block(&self, block: Block) -> Result<bool, StorageError> {
        let hash = block.hash();
        if self.inner.pending.exists(&hash)? {
            trace!(%hash, "download: submitted block already staged");
            return Ok(false);
        }
        if !self.inner.pending.store(&block)? {
            return Ok(false);
        }
        debug!(%hash, "download: block submitted");
        self.notify(block, None);
        Ok(true)
    }

    /// One scheduling pass. Must run inside a Tokio runtime.
    ///
    /// Only storage failures are returned; an empty queue, a saturated
    /// global limit and a lack of peers all end the pass quietly.
    pub fn run_once(&self) -> Result<(), StorageError> {
        let Some(_pass) = self.inner.pass.try_lock() else {
            trace!("download: pass already running");
            return Ok(());
        };
        self.prune_counters();
        self.trace_queue();

        loop {
            let Some(inventory) = self.inner.queue.lock().pop_first() else {
                trace!("download: nothing to do");
                return Ok(());
            };
            let hash = *inventory.block_hash();

            let staged = match self.inner.pending.exists(&hash) {
                Ok(staged) => staged,
                Err(e) => {
                    self.inner.queue.lock().insert(inventory);
                    return Err(e);
                }
            };
            if staged {
                continue;
            }
            if self.inner.in_flight.contains_key(&hash) {
                trace!(%hash, "download: already in flight");
                continue;
            }

            if self.inner.counters.total() >= self.max_concurrent_downloads() {
                self.inner.queue.lock().insert(inventory);
                trace!("download: too busy");
                return Ok(());
            }

            let Some((peer, priority)) = self.resolve_peer(&inventory) else {
                debug!(%hash, "download: no peers available");
                self.inner.queue.lock().insert(inventory);
                return Ok(());
            };
            self.dispatch(inventory, peer, priority);
        }
    }

    /// Wake a task waiting in [`notified`](Self::notified).
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Resolves after the next [`wake`](Self::wake), or immediately if one is
    /// already pending.
    pub async fn notified(&self) {
        self.inner.wake.notified().await;
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn active_download_count(&self) -> usize {
        self.inner.counters.total()
    }

    pub fn peer_download_count(&self, peer: PeerId) -> usize {
        self.inner.counters.load(peer)
    }

    pub fn is_in_flight(&self, hash: &Hash256) -> bool {
        self.inner.in_flight.contains_key(hash)
    }

    /// Peer to serve `inventory`, and the request priority to use.
    fn resolve_peer(&self, inventory: &PendingBlockInventory) -> Option<(Arc<dyn PeerNode>, RequestPriority)> {
        let max_per_peer = self.max_concurrent_downloads_per_peer();
        let counters = &self.inner.counters;
        let hash = inventory.block_hash();

        let Some(suggested) = inventory.suggested_peer() else {
            let peer = self
                .inner
                .selector
                .select_peer(hash, inventory.block_height(), counters, max_per_peer)?;
            return Some((peer, RequestPriority::None));
        };

        if let Some(peer) = suggested
            .upgrade()
            .filter(|peer| counters.load(peer.id()) < max_per_peer)
        {
            return Some((peer, RequestPriority::Normal));
        }

        let peer = self.inner.selector.select_peer(hash, None, counters, max_per_peer)?;
        let priority = match (peer.advertised_height(), inventory.block_height()) {
            (Some(peer_height), Some(height))
                if peer_height.saturating_sub(height) >= MIN_DISTANCE_FOR_NORMAL_PRIORITY =>
            {
                RequestPriority::Normal
            }
            _ => RequestPriority::None,
        };
        Some((peer, priority))
    }

    fn dispatch(&self, inventory: PendingBlockInventory, peer: Arc<dyn PeerNode>, priority: RequestPriority) {
        let request_id = RequestId(self.inner.next_request_id.fetch_add(1, Ordering::Relaxed));
        let peer_id = peer.id();
        let hash = *inventory.block_hash();
        let guard = self.inner.counters.acquire(peer_id);
        self.inner.in_flight.insert(hash, request_id);
        trace!(%request_id, %hash, peer = %peer_id, ?priority, "download: requesting block");

        let downloader = self.clone();
        tokio::spawn(async move {
            let result = peer.request_block(hash, priority).await;
            match result {
                Ok(block) if block.hash() == hash => {
                    downloader.on_downloaded(request_id, guard, block, peer_id, inventory);
                }
                Ok(block) => {
                    let error = NetworkError::UnexpectedBlock {
                        requested: hash.to_string(),
                        received: block.hash().to_string(),
                    };
                    downloader.on_failed(request_id, guard, inventory, peer_id, &error);
                }
                Err(error) => downloader.on_failed(request_id, guard, inventory, peer_id, &error),
            }
        });
    }

    fn on_downloaded(
        &self,
        request_id: RequestId,
        guard: InFlightGuard,
        block: Block,
        peer: PeerId,
        inventory: PendingBlockInventory,
    ) {
        drop(guard);
        let hash = block.hash();
        let stored = self.inner.pending.store(&block);
        self.inner.in_flight.remove(&hash);
        match stored {
            Ok(true) => {}
            Ok(false) => {
                trace!(%request_id, %hash, %peer, "download: block staged while in flight");
                self.wake();
                return;
            }
            Err(e) => {
                warn!(%request_id, %hash, error = %e, "download: failed to stage block");
                self.requeue(&inventory);
                return;
            }
        }
        debug!(%request_id, %hash, %peer, "download: block downloaded");
        self.notify(block, Some(peer));
        self.wake();
    }

    fn on_failed(
        &self,
        request_id: RequestId,
        guard: InFlightGuard,
        inventory: PendingBlockInventory,
        peer: PeerId,
        error: &NetworkError,
    ) {
        drop(guard);
        self.inner.in_flight.remove(inventory.block_hash());
        debug!(%request_id, hash = %inventory.block_hash(), %peer, %error, "download: block request failed");
        self.requeue(&inventory);
    }

    /// Put a failed descriptor back, lower in priority and without a peer.
    fn requeue(&self, inventory: &PendingBlockInventory) {
        let step = MIN_RETRY_PRIORITY_STEP.max(i64::try_from(self.max_concurrent_downloads()).unwrap_or(i64::MAX));
        self.inner.queue.lock().insert(inventory.deprioritized(step));
    }

    fn notify(&self, block: Block, peer: Option<PeerId>) {
        let Some(callback) = self.inner.callback.read().clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || callback.on_block_downloaded(block, peer));
            }
            Err(_) => callback.on_block_downloaded(block, peer),
        }
    }

    fn prune_counters(&self) {
        let connected: Vec<PeerId> = self
            .inner
            .selector
            .connected_peers()
            .iter()
            .map(|peer| peer.id())
            .collect();
        let pruned = self.inner.counters.prune(|peer| connected.contains(peer));
        if pruned > 0 {
            trace!(pruned, "download: pruned idle peer counters");
        }
    }

    fn trace_queue(&self) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        let queue = self.inner.queue.lock();
        let entries: Vec<String> = queue
            .iter()
            .map(|inv| {
                let height = inv.block_height().map(|h| h.to_string()).unwrap_or_else(|| "-".into());
                let peer = inv.suggested_peer_id().map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                format!("{}:{}:{}:{}", inv.priority(), inv.block_hash(), height, peer)
            })
            .collect();
        trace!(count = queue.len(), queue = %entries.join(" "), "download: queue");
    }
}
