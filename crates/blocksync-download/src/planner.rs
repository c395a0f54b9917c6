//! Deciding which blocks to download next.
//!
//! [`ChainDownloadPlanner`] walks the most-work header chain forward from the
//! committed head (or from the best block already downloaded, when that is
//! still on the chain) and emits one descriptor per block whose body has not
//! been staged yet. When the main chain has nothing left and alternate-chain
//! download is enabled, it plans competing leaf segments that carry enough
//! work to matter.

use std::sync::Arc;

use blocksync_core::constants::{ALTERNATE_CHAIN_EVALUATION_DEPTH, MAINNET_GENESIS_HASH};
use blocksync_core::error::StorageError;
use blocksync_core::traits::{ChainIndex, PendingBlockStore};
use blocksync_core::types::{BlockId, Hash256, SegmentId};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::DownloadConfig;
use crate::inventory::PendingBlockInventory;

/// Source of download work for the scheduler.
pub trait BlockDownloadPlanner: Send + Sync {
    /// The next batch of blocks to fetch. Empty when there is nothing to do
    /// or the underlying storage failed.
    fn next_batch(&self) -> Vec<PendingBlockInventory>;

    /// Record that the block behind `inventory` has been downloaded.
    fn mark_inventory_complete(&self, _inventory: &PendingBlockInventory) {}

    /// Forget the progress recorded by
    /// [`mark_inventory_complete`](Self::mark_inventory_complete).
    fn clear_inventory_complete(&self) {}
}

#[derive(Debug, Clone, Copy)]
struct CompletedInventory {
    hash: Hash256,
    height: u64,
}

pub struct ChainDownloadPlanner {
    chain: Arc<dyn ChainIndex>,
    pending: Arc<dyn PendingBlockStore>,
    genesis_hash: Hash256,
    batch_size: usize,
    max_download_ahead_depth: Option<u64>,
    alternate_chain_download: bool,
    best_completed: Mutex<Option<CompletedInventory>>,
}

impl ChainDownloadPlanner {
    pub fn new(chain: Arc<dyn ChainIndex>, pending: Arc<dyn PendingBlockStore>, config: &DownloadConfig) -> Self {
        Self {
            chain,
            pending,
            genesis_hash: *MAINNET_GENESIS_HASH,
            batch_size: config.batch_size,
            max_download_ahead_depth: config.max_download_ahead_depth,
            alternate_chain_download: config.alternate_chain_download,
            best_completed: Mutex::new(None),
        }
    }

    /// Seed an empty chain with a different genesis block.
    pub fn with_genesis(mut self, genesis_hash: Hash256) -> Self {
        self.genesis_hash = genesis_hash;
        self
    }

    pub fn set_max_download_ahead_depth(&mut self, depth: Option<u64>) {
        self.max_download_ahead_depth = depth;
    }

    pub fn set_alternate_chain_download(&mut self, enabled: bool) {
        self.alternate_chain_download = enabled;
    }

    fn plan(&self) -> Result<Vec<PendingBlockInventory>, StorageError> {
        let head_segment = self.chain.head_segment()?;
        let head_block = self.chain.head_block()?;

        let start = match (self.best_completed_on_chain(head_segment)?, head_block) {
            (Some(best), _) => Some(best),
            (None, head) => head,
        };

        let mut limit = self.batch_size;
        if let (Some(max_depth), Some(head), Some(start)) = (self.max_download_ahead_depth, head_block, start) {
            let head_height = self.chain.block_height(head)?;
            let start_height = self.chain.block_height(start)?;
            if start_height > head_height {
                let depth = start_height - head_height;
                trace!(depth, "planner: download ahead depth");
                if depth >= max_depth {
                    return Ok(Vec::new());
                }
                limit = limit.min(usize::try_from(max_depth - depth).unwrap_or(usize::MAX));
            }
        }

        let mut batch = Vec::new();
        let start = match start {
            Some(start) => Some(start),
            None => {
                if !self.pending.exists(&self.genesis_hash)? {
                    batch.push(PendingBlockInventory::at_height(self.genesis_hash, 0));
                }
                self.chain.block_id(&self.genesis_hash)?
            }
        };

        if let (Some(segment), Some(start)) = (head_segment, start) {
            self.walk_segment(segment, start, limit, &mut batch)?;
        }
        if !batch.is_empty() || !self.alternate_chain_download {
            return Ok(batch);
        }

        let Some(segment) = head_segment else {
            return Ok(batch);
        };
        self.plan_alternate_chains(segment, &mut batch)?;
        Ok(batch)
    }

    /// The best completed block, if it still lies on the chain through
    /// `head_segment`.
    fn best_completed_on_chain(&self, head_segment: Option<SegmentId>) -> Result<Option<BlockId>, StorageError> {
        let (Some(best), Some(head_segment)) = (*self.best_completed.lock(), head_segment) else {
            return Ok(None);
        };
        let Some(id) = self.chain.block_id(&best.hash)? else {
            return Ok(None);
        };
        if self.chain.segments_connected(self.chain.segment_of(id)?, head_segment)? {
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    /// Follow `segment` forward from `start`, adding unstaged blocks until
    /// `batch` holds `limit` entries or the walk reaches the segment tip or an
    /// invalid block.
    fn walk_segment(
        &self,
        segment: SegmentId,
        start: BlockId,
        limit: usize,
        batch: &mut Vec<PendingBlockInventory>,
    ) -> Result<(), StorageError> {
        let mut height = self.chain.block_height(start)?;
        let mut previous = start;
        let mut visited = 0;
        while visited < limit && batch.len() < self.batch_size {
            let Some(child) = self.chain.child_block(segment, previous)? else {
                break;
            };
            let hash = self.chain.block_hash(child)?;
            if self.chain.is_block_invalid(&hash)? {
                debug!(%hash, "planner: stopping at invalid block");
                break;
            }
            height += 1;
            if !self.pending.exists(&hash)? {
                batch.push(PendingBlockInventory::at_height(hash, height));
            }
            previous = child;
            visited += 1;
        }
        Ok(())
    }

    fn plan_alternate_chains(
        &self,
        head_segment: SegmentId,
        batch: &mut Vec<PendingBlockInventory>,
    ) -> Result<(), StorageError> {
        let Some(best_header) = self.chain.head_header()? else {
            return Ok(());
        };
        let best_height = self.chain.block_height(best_header)?;
        let floor = best_height.saturating_sub(ALTERNATE_CHAIN_EVALUATION_DEPTH);
        let Some(floor_block) = self.chain.block_at_height(head_segment, floor)? else {
            return Ok(());
        };
        let min_work = self.chain.chain_work(floor_block)?;

        for segment in self.chain.leaf_segments()? {
            if segment == head_segment {
                continue;
            }
            let Some(tip) = self.chain.segment_head(segment)? else {
                continue;
            };
            if self.chain.chain_work(tip)? < min_work {
                continue;
            }
            let Some(start) = self.processed_start(segment)? else {
                continue;
            };
            debug!(%segment, "planner: planning alternate chain");
            let remaining = self.batch_size - batch.len();
            self.walk_segment(segment, start, remaining, batch)?;
            if batch.len() >= self.batch_size {
                break;
            }
        }
        Ok(())
    }

    /// Highest processed block of `segment`, looking through parent segments
    /// when it has none of its own.
    fn processed_start(&self, segment: SegmentId) -> Result<Option<BlockId>, StorageError> {
        let mut current = Some(segment);
        while let Some(segment) = current {
            if let Some(id) = self.chain.processed_head_in_segment(segment)? {
                return Ok(Some(id));
            }
            current = self.chain.segment_parent(segment)?;
        }
        Ok(None)
    }

    fn record_completed(&self, inventory: &PendingBlockInventory) -> Result<(), StorageError> {
        let Some(height) = inventory.block_height() else {
            return Ok(());
        };
        let best_height = self.best_completed.lock().map(|best| best.height).unwrap_or(0);
        if height <= best_height {
            return Ok(());
        }
        let (Some(id), Some(head_segment)) = (self.chain.block_id(inventory.block_hash())?, self.chain.head_segment()?) else {
            return Ok(());
        };
        if self.chain.segments_connected(self.chain.segment_of(id)?, head_segment)? {
            let mut best = self.best_completed.lock();
            if best.is_none_or(|best| height > best.height) {
                *best = Some(CompletedInventory {
                    hash: *inventory.block_hash(),
                    height,
                });
            }
        }
        Ok(())
    }
}

impl BlockDownloadPlanner for ChainDownloadPlanner {
    fn next_batch(&self) -> Vec<PendingBlockInventory> {
        match self.plan() {
            Ok(batch) => {
                trace!(count = batch.len(), "planner: planned batch");
                batch
            }
            Err(e) => {
                warn!(error = %e, "planner: failed to plan download batch");
                Vec::new()
            }
        }
    }

    fn mark_inventory_complete(&self, inventory: &PendingBlockInventory) {
        if let Err(e) = self.record_completed(inventory) {
            warn!(error = %e, hash = %inventory.block_hash(), "planner: failed to record completed block");
        }
    }

    fn clear_inventory_complete(&self) {
        *self.best_completed.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync_core::memory::{MemoryChain, MemoryPendingBlockStore};
    use blocksync_core::testing::{child_block, coinbase, make_block};
    use blocksync_core::types::Block;

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    struct Fixture {
        chain: Arc<MemoryChain>,
        pending: Arc<MemoryPendingBlockStore>,
        blocks: Vec<Block>,
    }

    impl Fixture {
        /// `committed` connected blocks followed by `headers` header-only blocks.
        fn new(committed: u32, headers: u32) -> Self {
            let chain = Arc::new(MemoryChain::new());
            let mut blocks = vec![make_block(Hash256::ZERO, 0, vec![coinbase(0, 0)])];
            for h in 1..committed + headers {
                blocks.push(child_block(&blocks[h as usize - 1], h, 0, vec![]));
            }
            for (i, b) in blocks.iter().enumerate() {
                if (i as u32) < committed {
                    chain.extend(b.clone()).unwrap();
                } else {
                    chain.insert_header(b.header.clone()).unwrap();
                }
            }
            Self {
                chain,
                pending: Arc::new(MemoryPendingBlockStore::new()),
                blocks,
            }
        }

        fn planner(&self, config: DownloadConfig) -> ChainDownloadPlanner {
            ChainDownloadPlanner::new(self.chain.clone(), self.pending.clone(), &config)
                .with_genesis(self.blocks[0].hash())
        }
    }

    fn heights(batch: &[PendingBlockInventory]) -> Vec<u64> {
        batch.iter().filter_map(PendingBlockInventory::block_height).collect()
    }

    // -------------------------------------------------------------------------
    // Main chain
    // -------------------------------------------------------------------------

    #[test]
    fn plans_missing_blocks_above_head_in_order() {
        let fx = Fixture::new(4, 3);
        let batch = fx.planner(DownloadConfig::default()).next_batch();
        assert_eq!(heights(&batch), vec![4, 5, 6]);
        assert_eq!(batch[0].block_hash(), &fx.blocks[4].hash());
        assert!(batch.iter().all(|inv| inv.suggested_peer().is_none()));
        assert!(batch.iter().all(|inv| inv.priority() == inv.block_height().unwrap() as i64));
    }

    #[test]
    fn skips_blocks_already_staged() {
        let fx = Fixture::new(2, 3);
        fx.pending.store(&fx.blocks[3]).unwrap();
        let batch = fx.planner(DownloadConfig::default()).next_batch();
        assert_eq!(heights(&batch), vec![2, 4]);
    }

    #[test]
    fn batch_is_capped() {
        let fx = Fixture::new(1, 10);
        let config = DownloadConfig {
            batch_size: 4,
            ..DownloadConfig::default()
        };
        assert_eq!(heights(&fx.planner(config).next_batch()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn stops_at_invalid_block() {
        let fx = Fixture::new(1, 4);
        fx.chain.mark_invalid(fx.blocks[3].hash());
        assert_eq!(heights(&fx.planner(DownloadConfig::default()).next_batch()), vec![1, 2]);
    }

    #[test]
    fn empty_chain_seeds_genesis() {
        let chain = Arc::new(MemoryChain::new());
        let pending = Arc::new(MemoryPendingBlockStore::new());
        let planner = ChainDownloadPlanner::new(chain, pending.clone(), &DownloadConfig::default());
        let batch = planner.next_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].block_hash(), &*MAINNET_GENESIS_HASH);
        assert_eq!(batch[0].priority(), 0);
        assert_eq!(batch[0].block_height(), Some(0));
    }

    #[test]
    fn headers_without_committed_head_start_at_genesis() {
        let fx = Fixture::new(0, 3);
        let batch = fx.planner(DownloadConfig::default()).next_batch();
        assert_eq!(heights(&batch), vec![0, 1, 2]);

        fx.pending.store(&fx.blocks[0]).unwrap();
        assert_eq!(heights(&fx.planner(DownloadConfig::default()).next_batch()), vec![1, 2]);
    }

    #[test]
    fn fully_synced_chain_yields_nothing() {
        let fx = Fixture::new(5, 0);
        assert!(fx.planner(DownloadConfig::default()).next_batch().is_empty());
    }

    // -------------------------------------------------------------------------
    // Download-ahead bound
    // -------------------------------------------------------------------------

    #[test]
    fn continues_from_best_completed_block() {
        let fx = Fixture::new(2, 6);
        let planner = fx.planner(DownloadConfig::default());
        planner.mark_inventory_complete(&PendingBlockInventory::at_height(fx.blocks[4].hash(), 4));
        assert_eq!(heights(&planner.next_batch()), vec![5, 6, 7]);

        planner.clear_inventory_complete();
        assert_eq!(heights(&planner.next_batch()), vec![2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn lower_completion_does_not_regress_progress() {
        let fx = Fixture::new(2, 6);
        let planner = fx.planner(DownloadConfig::default());
        planner.mark_inventory_complete(&PendingBlockInventory::at_height(fx.blocks[5].hash(), 5));
        planner.mark_inventory_complete(&PendingBlockInventory::at_height(fx.blocks[3].hash(), 3));
        assert_eq!(heights(&planner.next_batch()), vec![6, 7]);
    }

    #[test]
    fn download_ahead_depth_bounds_the_batch() {
        let fx = Fixture::new(2, 10);
        let config = DownloadConfig {
            max_download_ahead_depth: Some(4),
            ..DownloadConfig::default()
        };
        let planner = fx.planner(config);
        planner.mark_inventory_complete(&PendingBlockInventory::at_height(fx.blocks[3].hash(), 3));
        // Two ahead of the head at height 1: two more may be planned.
        assert_eq!(heights(&planner.next_batch()), vec![4, 5]);

        planner.mark_inventory_complete(&PendingBlockInventory::at_height(fx.blocks[5].hash(), 5));
        assert!(planner.next_batch().is_empty());
    }

    #[test]
    fn completed_block_off_the_head_chain_is_ignored() {
        let fx = Fixture::new(3, 2);
        let side = child_block(&fx.blocks[1], 2, 9, vec![]);
        fx.chain.insert_header(side.header.clone()).unwrap();
        let planner = fx.planner(DownloadConfig::default());
        planner.mark_inventory_complete(&PendingBlockInventory::at_height(side.hash(), 2));
        assert_eq!(heights(&planner.next_batch()), vec![3, 4]);
    }

    // -------------------------------------------------------------------------
    // Alternate chains
    // -------------------------------------------------------------------------

    /// Committed G..B2 plus one header, and a header-only fork off B1 that
    /// reaches the same height without exceeding the main chain's work.
    fn forked_fixture() -> (Fixture, Vec<Block>) {
        let fx = Fixture::new(3, 1);
        let mut fork = vec![child_block(&fx.blocks[1], 2, 5, vec![])];
        fork.push(child_block(&fork[0], 3, 5, vec![]));
        for b in &fork {
            fx.chain.insert_header(b.header.clone()).unwrap();
        }
        (fx, fork)
    }

    #[test]
    fn plans_alternate_chain_when_main_chain_is_done() {
        let (fx, fork) = forked_fixture();
        fx.pending.store(&fx.blocks[3]).unwrap();
        let batch = fx.planner(DownloadConfig::default()).next_batch();
        let hashes: Vec<Hash256> = batch.iter().map(|inv| *inv.block_hash()).collect();
        assert_eq!(hashes, vec![fork[0].hash(), fork[1].hash()]);
        assert_eq!(heights(&batch), vec![2, 3]);
    }

    #[test]
    fn alternate_chain_download_can_be_disabled() {
        let (fx, _fork) = forked_fixture();
        fx.pending.store(&fx.blocks[3]).unwrap();
        let mut planner = fx.planner(DownloadConfig::default());
        planner.set_alternate_chain_download(false);
        assert!(planner.next_batch().is_empty());
    }

    #[test]
    fn main_chain_work_takes_precedence() {
        let (fx, _fork) = forked_fixture();
        assert_eq!(heights(&fx.planner(DownloadConfig::default()).next_batch()), vec![3]);
    }
}
