//! Storage interfaces consumed by the synchronization engine.
//!
//! - [`ChainIndex`]: header tree, segments, committed head, block bodies
//! - [`UtxoStore`]: durable unspent-output set and transaction lookups
//! - [`PendingBlockStore`]: staging area for downloaded, not yet processed blocks
//!
//! [`MemoryChain`](crate::memory::MemoryChain) implements the first two,
//! [`MemoryPendingBlockStore`](crate::memory::MemoryPendingBlockStore) the third.

use std::collections::HashMap;

use crate::error::StorageError;
use crate::types::{Block, BlockId, ChainWork, Hash256, OutPoint, SegmentId, UnspentOutput};

/// Read access to the indexed header tree.
///
/// Headers are grouped into segments: maximal runs of blocks where every
/// block but the last has exactly one child. A segment's parent is the
/// segment containing the block it forks from, and that block is always the
/// last block of the parent segment.
pub trait ChainIndex: Send + Sync {
    /// Head of the committed chain (the block the durable UTXO set reflects).
    fn head_block(&self) -> Result<Option<BlockId>, StorageError>;

    /// Header with the most cumulative work.
    fn head_header(&self) -> Result<Option<BlockId>, StorageError>;

    /// Segment containing [`head_header`](Self::head_header).
    fn head_segment(&self) -> Result<Option<SegmentId>, StorageError> {
        match self.head_header()? {
            Some(id) => Ok(Some(self.segment_of(id)?)),
            None => Ok(None),
        }
    }

    fn block_id(&self, hash: &Hash256) -> Result<Option<BlockId>, StorageError>;

    fn block_hash(&self, id: BlockId) -> Result<Hash256, StorageError>;

    fn block_height(&self, id: BlockId) -> Result<u64, StorageError>;

    fn parent_block(&self, id: BlockId) -> Result<Option<BlockId>, StorageError>;

    /// The child of `id` lying on the path toward `segment`, if any.
    fn child_block(&self, segment: SegmentId, id: BlockId) -> Result<Option<BlockId>, StorageError>;

    fn segment_of(&self, id: BlockId) -> Result<SegmentId, StorageError>;

    /// Whether either segment is an ancestor of (or equal to) the other.
    fn segments_connected(&self, a: SegmentId, b: SegmentId) -> Result<bool, StorageError>;

    /// Block at `height` on the chain ending in `segment`.
    fn block_at_height(&self, segment: SegmentId, height: u64) -> Result<Option<BlockId>, StorageError>;

    fn has_block_body(&self, id: BlockId) -> Result<bool, StorageError>;

    fn block(&self, id: BlockId) -> Result<Option<Block>, StorageError>;

    fn is_block_invalid(&self, hash: &Hash256) -> Result<bool, StorageError>;

    fn chain_work(&self, id: BlockId) -> Result<ChainWork, StorageError>;

    /// Segments with no child segments.
    fn leaf_segments(&self) -> Result<Vec<SegmentId>, StorageError>;

    /// Last block of a segment.
    fn segment_head(&self, segment: SegmentId) -> Result<Option<BlockId>, StorageError>;

    fn segment_parent(&self, segment: SegmentId) -> Result<Option<SegmentId>, StorageError>;

    /// Highest block of `segment` whose body is stored.
    fn processed_head_in_segment(&self, segment: SegmentId) -> Result<Option<BlockId>, StorageError>;
}

/// The durable UTXO set.
pub trait UtxoStore: Send + Sync {
    /// Batch lookup of unspent outputs. The result is positional: entry `i`
    /// answers `outpoints[i]`, `None` when spent or unknown.
    fn get_unspent_outputs(&self, outpoints: &[OutPoint]) -> Result<Vec<Option<UnspentOutput>>, StorageError>;

    /// Output data regardless of whether it has been spent.
    fn find_output(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>, StorageError>;

    /// Blocks containing the given transactions, restricted to the chain ending
    /// in `segment`. Unknown transactions are absent from the map.
    fn block_ids_for_transactions(
        &self,
        segment: SegmentId,
        txids: &[Hash256],
    ) -> Result<HashMap<Hash256, BlockId>, StorageError>;

    fn heights_for_blocks(&self, ids: &[BlockId]) -> Result<HashMap<BlockId, u64>, StorageError>;
}

/// Staging store for downloaded blocks.
///
/// The single source of truth for "has this block already been obtained".
pub trait PendingBlockStore: Send + Sync {
    fn exists(&self, hash: &Hash256) -> Result<bool, StorageError>;

    /// Store a block. Returns `true` if it was not already present.
    fn store(&self, block: &Block) -> Result<bool, StorageError>;

    /// Fetch a stored block. `height` is a lookup hint and may be ignored.
    fn get(&self, hash: &Hash256, height: Option<u64>) -> Result<Option<Block>, StorageError>;
}
