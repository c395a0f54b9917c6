//! Shared helpers for scenario tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use blocksync_core::error::NetworkError;
use blocksync_core::memory::MemoryChain;
use blocksync_core::testing::{child_block, coinbase, make_block};
use blocksync_core::types::{Block, Hash256};
use blocksync_download::{BlockDownloadCallback, PeerId, PeerNode, RequestPriority};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;

/// The genesis block every scenario builds on.
pub fn genesis() -> Block {
    make_block(Hash256::ZERO, 0, vec![coinbase(0, 0)])
}

/// `count` empty blocks on top of `parent`, starting at `first_height`.
pub fn empty_blocks(parent: &Block, first_height: u32, count: u32, tag: u8) -> Vec<Block> {
    let mut out = Vec::with_capacity(count as usize);
    let mut prev = parent.clone();
    for height in first_height..first_height + count {
        let block = child_block(&prev, height, tag, vec![]);
        out.push(block.clone());
        prev = block;
    }
    out
}

/// A chain index whose committed head is at `head_height`, and the blocks
/// from genesis to that head.
pub fn committed_chain(head_height: u32) -> (Arc<MemoryChain>, Vec<Block>) {
    let chain = Arc::new(MemoryChain::new());
    let genesis = genesis();
    chain.extend(genesis.clone()).unwrap();
    let mut blocks = vec![genesis.clone()];
    for block in empty_blocks(&genesis, 1, head_height, 0) {
        chain.extend(block.clone()).unwrap();
        blocks.push(block);
    }
    (chain, blocks)
}

/// Index headers only.
pub fn index_headers(chain: &MemoryChain, blocks: &[Block]) {
    for block in blocks {
        chain.insert_header(block.header.clone()).unwrap();
    }
}

/// Poll `cond` until it holds, panicking after `timeout`.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Scripted peer
// ---------------------------------------------------------------------------

/// A peer serving blocks from a map, with hooks for gating, failures and
/// disconnects. Every request is recorded.
pub struct TestPeer {
    id: PeerId,
    height: Option<u64>,
    connected: AtomicBool,
    blocks: RwLock<HashMap<Hash256, Block>>,
    fail_once: Mutex<HashSet<Hash256>>,
    gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    requests: Mutex<Vec<(Hash256, RequestPriority)>>,
}

impl TestPeer {
    pub fn new(id: u64, height: Option<u64>, blocks: &[Block]) -> Self {
        Self {
            id: PeerId(id),
            height,
            connected: AtomicBool::new(true),
            blocks: RwLock::new(blocks.iter().map(|b| (b.hash(), b.clone())).collect()),
            fail_once: Mutex::new(HashSet::new()),
            gate: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Hold every response until a permit is added to `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Time out the next request for `hash`.
    pub fn fail_next(&self, hash: Hash256) {
        self.fail_once.lock().insert(hash);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn requests(&self) -> Vec<(Hash256, RequestPriority)> {
        self.requests.lock().clone()
    }

    pub fn requested_hashes(&self) -> Vec<Hash256> {
        self.requests.lock().iter().map(|(h, _)| *h).collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PeerNode for TestPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn advertised_height(&self) -> Option<u64> {
        self.height
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn request_block(&self, hash: Hash256, priority: RequestPriority) -> Result<Block, NetworkError> {
        self.requests.lock().push((hash, priority));
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let result = if self.fail_once.lock().remove(&hash) {
            Err(NetworkError::Timeout)
        } else {
            self.blocks
                .read()
                .get(&hash)
                .cloned()
                .ok_or_else(|| NetworkError::Rejected(format!("unknown block {hash}")))
        };
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }
}

/// Upcast for collaborator constructors.
pub fn as_dyn(peers: &[Arc<TestPeer>]) -> Vec<Arc<dyn PeerNode>> {
    peers
        .iter()
        .map(|p| Arc::clone(p) as Arc<dyn PeerNode>)
        .collect()
}

// ---------------------------------------------------------------------------
// Recording callback
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingCallback {
    delivered: Mutex<Vec<(Hash256, Option<PeerId>)>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> Vec<(Hash256, Option<PeerId>)> {
        self.delivered.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().len()
    }
}

impl BlockDownloadCallback for RecordingCallback {
    fn on_block_downloaded(&self, block: Block, peer: Option<PeerId>) {
        self.delivered.lock().push((block.hash(), peer));
    }
}
