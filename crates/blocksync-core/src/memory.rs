//! In-memory implementations of the storage traits.
//!
//! [`MemoryChain`] keeps the full header tree with segment bookkeeping, block
//! bodies, the committed chain with per-block undo data, and the UTXO set.
//! Not suitable for production use (no persistence, unbounded growth).

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{ChainError, StorageError};
use crate::traits::{ChainIndex, PendingBlockStore, UtxoStore};
use crate::types::{
    Block, BlockHeader, BlockId, ChainWork, Hash256, OutPoint, SegmentId, UnspentOutput,
};

struct HeaderEntry {
    hash: Hash256,
    height: u64,
    parent: Option<BlockId>,
    segment: SegmentId,
    chain_work: ChainWork,
}

struct SegmentEntry {
    parent: Option<SegmentId>,
    /// Blocks in ascending height order.
    blocks: Vec<BlockId>,
}

#[derive(Default)]
struct ChainInner {
    headers: Vec<HeaderEntry>,
    by_hash: HashMap<Hash256, BlockId>,
    children: HashMap<BlockId, Vec<BlockId>>,
    segments: Vec<SegmentEntry>,
    best_header: Option<BlockId>,
    bodies: HashMap<BlockId, Block>,
    invalid: HashSet<Hash256>,
    /// Committed chain from the first connected block to the head.
    committed: Vec<BlockId>,
    utxos: HashMap<OutPoint, UnspentOutput>,
    /// Every output of every stored body, spent or not.
    all_outputs: HashMap<OutPoint, UnspentOutput>,
    tx_blocks: HashMap<Hash256, Vec<BlockId>>,
    /// Outputs consumed by each committed block, in spend order.
    undo: HashMap<BlockId, Vec<(OutPoint, UnspentOutput)>>,
}

impl ChainInner {
    fn entry(&self, id: BlockId) -> Result<&HeaderEntry, StorageError> {
        self.headers
            .get(id.0 as usize)
            .ok_or_else(|| ChainError::UnknownBlock(id.to_string()).into())
    }

    fn segment(&self, id: SegmentId) -> Result<&SegmentEntry, StorageError> {
        self.segments
            .get(id.0 as usize)
            .ok_or_else(|| ChainError::UnknownSegment(id.to_string()).into())
    }

    fn new_segment(&mut self, parent: Option<SegmentId>, blocks: Vec<BlockId>) -> SegmentId {
        let id = SegmentId(self.segments.len() as u64);
        for block in &blocks {
            self.headers[block.0 as usize].segment = id;
        }
        self.segments.push(SegmentEntry { parent, blocks });
        id
    }

    /// Segment chain from `segment` up to the root, inclusive.
    fn ancestry(&self, segment: SegmentId) -> Result<Vec<SegmentId>, StorageError> {
        let mut out = vec![segment];
        let mut current = self.segment(segment)?.parent;
        while let Some(s) = current {
            out.push(s);
            current = self.segment(s)?.parent;
        }
        Ok(out)
    }

    fn is_ancestor_segment(&self, ancestor: SegmentId, of: SegmentId) -> Result<bool, StorageError> {
        Ok(self.ancestry(of)?.contains(&ancestor))
    }

    /// Split `segment` after `at`; blocks above move to a new child segment
    /// which also adopts the original segment's children.
    fn split_after(&mut self, segment: SegmentId, at: BlockId) -> Result<(), StorageError> {
        let blocks = &self.segment(segment)?.blocks;
        let Some(pos) = blocks.iter().position(|b| *b == at) else {
            return Err(ChainError::UnknownBlock(at.to_string()).into());
        };
        if pos + 1 == blocks.len() {
            return Ok(());
        }
        let tail = self.segments[segment.0 as usize].blocks.split_off(pos + 1);
        let tail_id = SegmentId(self.segments.len() as u64);
        for s in self.segments.iter_mut() {
            if s.parent == Some(segment) {
                s.parent = Some(tail_id);
            }
        }
        self.new_segment(Some(segment), tail);
        Ok(())
    }

    fn insert_header(&mut self, header: BlockHeader) -> Result<BlockId, StorageError> {
        let hash = header.hash();
        if let Some(id) = self.by_hash.get(&hash) {
            return Ok(*id);
        }

        let parent = match self.by_hash.get(&header.prev_hash) {
            Some(p) => Some(*p),
            None if self.headers.is_empty() => None,
            None => return Err(ChainError::OrphanHeader(header.prev_hash.to_string()).into()),
        };

        let id = BlockId(self.headers.len() as u64);
        let (height, parent_work) = match parent {
            Some(p) => {
                let e = self.entry(p)?;
                (e.height + 1, e.chain_work)
            }
            None => (0, 0),
        };
        let chain_work = parent_work + header.work();
        self.headers.push(HeaderEntry {
            hash,
            height,
            parent,
            segment: SegmentId(u64::MAX),
            chain_work,
        });
        self.by_hash.insert(hash, id);

        match parent {
            None => {
                self.new_segment(None, vec![id]);
            }
            Some(p) => {
                let parent_segment = self.entry(p)?.segment;
                let parent_is_last = self.segment(parent_segment)?.blocks.last() == Some(&p);
                let has_children = self.children.get(&p).is_some_and(|c| !c.is_empty());
                if parent_is_last && !has_children {
                    self.headers[id.0 as usize].segment = parent_segment;
                    self.segments[parent_segment.0 as usize].blocks.push(id);
                } else {
                    self.split_after(parent_segment, p)?;
                    self.new_segment(Some(parent_segment), vec![id]);
                }
                self.children.entry(p).or_default().push(id);
            }
        }

        let is_best = match self.best_header {
            Some(best) => chain_work > self.entry(best)?.chain_work,
            None => true,
        };
        if is_best {
            self.best_header = Some(id);
        }
        Ok(id)
    }

    fn store_body(&mut self, block: Block) -> Result<BlockId, StorageError> {
        let hash = block.hash();
        let id = *self
            .by_hash
            .get(&hash)
            .ok_or_else(|| ChainError::UnknownBlock(hash.to_string()))?;
        if self.bodies.contains_key(&id) {
            return Ok(id);
        }
        let height = self.entry(id)?.height;
        for (i, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            self.tx_blocks.entry(txid).or_default().push(id);
            for (index, output) in tx.outputs.iter().enumerate() {
                self.all_outputs.insert(
                    OutPoint::new(txid, index as u32),
                    UnspentOutput::new(output.clone(), height, i == 0),
                );
            }
        }
        self.bodies.insert(id, block);
        Ok(id)
    }

    fn connect(&mut self, id: BlockId) -> Result<(), StorageError> {
        let entry = self.entry(id)?;
        let hash = entry.hash;
        let height = entry.height;
        if entry.parent != self.committed.last().copied() {
            return Err(ChainError::NotConnectable(hash.to_string()).into());
        }
        let block = self
            .bodies
            .get(&id)
            .ok_or_else(|| ChainError::MissingBody(hash.to_string()))?;

        let mut spent = Vec::new();
        let mut created = Vec::new();
        for (i, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            if i > 0 {
                for input in &tx.inputs {
                    spent.push(input.previous_output);
                }
            }
            for (index, output) in tx.outputs.iter().enumerate() {
                created.push((
                    OutPoint::new(txid, index as u32),
                    UnspentOutput::new(output.clone(), height, i == 0),
                ));
            }
        }

        // Intra-block spends are resolved against outputs created earlier in the block.
        let mut undo = Vec::with_capacity(spent.len());
        let mut created_map: HashMap<OutPoint, UnspentOutput> = HashMap::new();
        let mut pending_spends: Vec<OutPoint> = Vec::new();
        for (outpoint, utxo) in created {
            created_map.insert(outpoint, utxo);
        }
        for outpoint in spent {
            if created_map.remove(&outpoint).is_some() {
                continue;
            }
            pending_spends.push(outpoint);
        }
        for outpoint in &pending_spends {
            match self.utxos.get(outpoint) {
                Some(utxo) => undo.push((*outpoint, utxo.clone())),
                None => return Err(ChainError::MissingOutput(outpoint.to_string()).into()),
            }
        }
        for outpoint in &pending_spends {
            self.utxos.remove(outpoint);
        }
        self.utxos.extend(created_map);
        self.undo.insert(id, undo);
        self.committed.push(id);
        debug!(%hash, height, "chain: connected block");
        Ok(())
    }

    fn disconnect_head(&mut self) -> Result<BlockId, StorageError> {
        let id = *self.committed.last().ok_or(ChainError::EmptyChain)?;
        let entry = self.entry(id)?;
        let hash = entry.hash;
        let block = self
            .bodies
            .get(&id)
            .ok_or_else(|| ChainError::MissingBody(hash.to_string()))?;
        for tx in &block.transactions {
            let txid = tx.txid();
            for index in 0..tx.outputs.len() {
                self.utxos.remove(&OutPoint::new(txid, index as u32));
            }
        }
        for (outpoint, utxo) in self.undo.remove(&id).unwrap_or_default() {
            self.utxos.insert(outpoint, utxo);
        }
        self.committed.pop();
        debug!(%hash, "chain: disconnected block");
        Ok(id)
    }
}

/// In-memory header tree, block store, and UTXO set.
///
/// Implements both [`ChainIndex`] and [`UtxoStore`]. Interior mutability via
/// a [`RwLock`] lets one instance be shared behind an `Arc` by the planner,
/// the snapshot builder, and whatever commits blocks.
#[derive(Default)]
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a header. The first header becomes the root; every later header
    /// must extend an indexed one. Re-inserting a known header is a no-op.
    pub fn insert_header(&self, header: BlockHeader) -> Result<BlockId, StorageError> {
        self.inner.write().insert_header(header)
    }

    /// Store the body of an indexed header.
    pub fn store_block_body(&self, block: Block) -> Result<BlockId, StorageError> {
        self.inner.write().store_body(block)
    }

    /// Index the header and store the body in one step.
    pub fn add_block(&self, block: Block) -> Result<BlockId, StorageError> {
        let mut inner = self.inner.write();
        inner.insert_header(block.header.clone())?;
        inner.store_body(block)
    }

    /// Apply a stored block on top of the committed head.
    pub fn connect_block(&self, id: BlockId) -> Result<(), StorageError> {
        self.inner.write().connect(id)
    }

    /// Index, store, and connect a block on top of the committed head.
    pub fn extend(&self, block: Block) -> Result<BlockId, StorageError> {
        let mut inner = self.inner.write();
        inner.insert_header(block.header.clone())?;
        let id = inner.store_body(block)?;
        inner.connect(id)?;
        Ok(id)
    }

    /// Revert the committed head using its undo data.
    pub fn disconnect_head(&self) -> Result<BlockId, StorageError> {
        self.inner.write().disconnect_head()
    }

    /// Flag a block as failing validation.
    pub fn mark_invalid(&self, hash: Hash256) {
        self.inner.write().invalid.insert(hash);
    }

    /// Forget the confirmation height of every unspent output, as stores
    /// that do not track it report them.
    pub fn strip_output_heights(&self) {
        for utxo in self.inner.write().utxos.values_mut() {
            utxo.block_height = None;
        }
    }

    /// Number of unspent outputs in the committed set.
    pub fn utxo_count(&self) -> usize {
        self.inner.read().utxos.len()
    }
}

impl ChainIndex for MemoryChain {
    fn head_block(&self) -> Result<Option<BlockId>, StorageError> {
        Ok(self.inner.read().committed.last().copied())
    }

    fn head_header(&self) -> Result<Option<BlockId>, StorageError> {
        Ok(self.inner.read().best_header)
    }

    fn block_id(&self, hash: &Hash256) -> Result<Option<BlockId>, StorageError> {
        Ok(self.inner.read().by_hash.get(hash).copied())
    }

    fn block_hash(&self, id: BlockId) -> Result<Hash256, StorageError> {
        Ok(self.inner.read().entry(id)?.hash)
    }

    fn block_height(&self, id: BlockId) -> Result<u64, StorageError> {
        Ok(self.inner.read().entry(id)?.height)
    }

    fn parent_block(&self, id: BlockId) -> Result<Option<BlockId>, StorageError> {
        Ok(self.inner.read().entry(id)?.parent)
    }

    fn child_block(&self, segment: SegmentId, id: BlockId) -> Result<Option<BlockId>, StorageError> {
        let inner = self.inner.read();
        let ancestry = inner.ancestry(segment)?;
        let Some(children) = inner.children.get(&id) else {
            return Ok(None);
        };
        for child in children {
            if ancestry.contains(&inner.entry(*child)?.segment) {
                return Ok(Some(*child));
            }
        }
        Ok(None)
    }

    fn segment_of(&self, id: BlockId) -> Result<SegmentId, StorageError> {
        Ok(self.inner.read().entry(id)?.segment)
    }

    fn segments_connected(&self, a: SegmentId, b: SegmentId) -> Result<bool, StorageError> {
        let inner = self.inner.read();
        Ok(inner.is_ancestor_segment(a, b)? || inner.is_ancestor_segment(b, a)?)
    }

    fn block_at_height(&self, segment: SegmentId, height: u64) -> Result<Option<BlockId>, StorageError> {
        let inner = self.inner.read();
        for s in inner.ancestry(segment)? {
            let blocks = &inner.segment(s)?.blocks;
            let Some(first) = blocks.first() else { continue };
            let first_height = inner.entry(*first)?.height;
            if height >= first_height {
                return Ok(blocks.get((height - first_height) as usize).copied());
            }
        }
        Ok(None)
    }

    fn has_block_body(&self, id: BlockId) -> Result<bool, StorageError> {
        Ok(self.inner.read().bodies.contains_key(&id))
    }

    fn block(&self, id: BlockId) -> Result<Option<Block>, StorageError> {
        Ok(self.inner.read().bodies.get(&id).cloned())
    }

    fn is_block_invalid(&self, hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.inner.read().invalid.contains(hash))
    }

    fn chain_work(&self, id: BlockId) -> Result<ChainWork, StorageError> {
        Ok(self.inner.read().entry(id)?.chain_work)
    }

    fn leaf_segments(&self) -> Result<Vec<SegmentId>, StorageError> {
        let inner = self.inner.read();
        let parents: HashSet<SegmentId> = inner.segments.iter().filter_map(|s| s.parent).collect();
        Ok((0..inner.segments.len() as u64)
            .map(SegmentId)
            .filter(|s| !parents.contains(s))
            .collect())
    }

    fn segment_head(&self, segment: SegmentId) -> Result<Option<BlockId>, StorageError> {
        Ok(self.inner.read().segment(segment)?.blocks.last().copied())
    }

    fn segment_parent(&self, segment: SegmentId) -> Result<Option<SegmentId>, StorageError> {
        Ok(self.inner.read().segment(segment)?.parent)
    }

    fn processed_head_in_segment(&self, segment: SegmentId) -> Result<Option<BlockId>, StorageError> {
        let inner = self.inner.read();
        Ok(inner
            .segment(segment)?
            .blocks
            .iter()
            .rev()
            .find(|id| inner.bodies.contains_key(id))
            .copied())
    }
}

impl UtxoStore for MemoryChain {
    fn get_unspent_outputs(&self, outpoints: &[OutPoint]) -> Result<Vec<Option<UnspentOutput>>, StorageError> {
        let inner = self.inner.read();
        Ok(outpoints.iter().map(|op| inner.utxos.get(op).cloned()).collect())
    }

    fn find_output(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>, StorageError> {
        Ok(self.inner.read().all_outputs.get(outpoint).cloned())
    }

    fn block_ids_for_transactions(
        &self,
        segment: SegmentId,
        txids: &[Hash256],
    ) -> Result<HashMap<Hash256, BlockId>, StorageError> {
        let inner = self.inner.read();
        let ancestry = inner.ancestry(segment)?;
        let mut out = HashMap::new();
        for txid in txids {
            let Some(blocks) = inner.tx_blocks.get(txid) else { continue };
            for block in blocks {
                if ancestry.contains(&inner.entry(*block)?.segment) {
                    out.insert(*txid, *block);
                    break;
                }
            }
        }
        Ok(out)
    }

    fn heights_for_blocks(&self, ids: &[BlockId]) -> Result<HashMap<BlockId, u64>, StorageError> {
        let inner = self.inner.read();
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            out.insert(*id, inner.entry(*id)?.height);
        }
        Ok(out)
    }
}

/// In-memory [`PendingBlockStore`].
#[derive(Default)]
pub struct MemoryPendingBlockStore {
    blocks: RwLock<HashMap<Hash256, Block>>,
}

impl MemoryPendingBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl PendingBlockStore for MemoryPendingBlockStore {
    fn exists(&self, hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.blocks.read().contains_key(hash))
    }

    fn store(&self, block: &Block) -> Result<bool, StorageError> {
        let mut blocks = self.blocks.write();
        let hash = block.hash();
        if blocks.contains_key(&hash) {
            return Ok(false);
        }
        blocks.insert(hash, block.clone());
        Ok(true)
    }

    fn get(&self, hash: &Hash256, _height: Option<u64>) -> Result<Option<Block>, StorageError> {
        Ok(self.blocks.read().get(hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{child_block, coinbase, make_block as block, spend};
    use proptest::prelude::*;

    /// Builds `len` connected blocks starting from a genesis.
    fn linear_chain(chain: &MemoryChain, len: u32) -> Vec<Block> {
        let mut out = Vec::new();
        let mut prev = Hash256::ZERO;
        for h in 0..len {
            let b = block(prev, h, vec![coinbase(h, 0)]);
            prev = b.hash();
            chain.extend(b.clone()).unwrap();
            out.push(b);
        }
        out
    }

    // --- Header tree and segments ---

    #[test]
    fn linear_chain_stays_in_one_segment() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 5);
        let head = chain.head_block().unwrap().unwrap();
        assert_eq!(chain.block_height(head).unwrap(), 4);
        assert_eq!(chain.block_hash(head).unwrap(), blocks[4].hash());
        assert_eq!(chain.leaf_segments().unwrap().len(), 1);
        let seg = chain.segment_of(head).unwrap();
        let genesis = chain.block_id(&blocks[0].hash()).unwrap().unwrap();
        assert_eq!(chain.segment_of(genesis).unwrap(), seg);
    }

    #[test]
    fn fork_splits_segment_at_fork_point() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 4); // G A B C
        let fork = block(blocks[1].hash(), 100, vec![coinbase(2, 9)]);
        let fork_id = chain.add_block(fork).unwrap();

        let a = chain.block_id(&blocks[1].hash()).unwrap().unwrap();
        let b = chain.block_id(&blocks[2].hash()).unwrap().unwrap();
        let root = chain.segment_of(a).unwrap();
        let main_tail = chain.segment_of(b).unwrap();
        let fork_seg = chain.segment_of(fork_id).unwrap();

        assert_ne!(root, main_tail);
        assert_ne!(main_tail, fork_seg);
        assert_eq!(chain.segment_parent(main_tail).unwrap(), Some(root));
        assert_eq!(chain.segment_parent(fork_seg).unwrap(), Some(root));
        assert_eq!(chain.segment_head(root).unwrap(), Some(a));
        assert!(chain.segments_connected(root, fork_seg).unwrap());
        assert!(!chain.segments_connected(main_tail, fork_seg).unwrap());

        let mut leaves = chain.leaf_segments().unwrap();
        leaves.sort();
        assert_eq!(leaves, vec![main_tail, fork_seg]);
    }

    #[test]
    fn split_reparents_existing_child_segments() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 4); // G A B C
        let c = chain.block_id(&blocks[3].hash()).unwrap().unwrap();
        let first = chain.add_block(block(blocks[3].hash(), 50, vec![coinbase(4, 1)])).unwrap();
        assert_eq!(chain.segment_of(first).unwrap(), chain.segment_of(c).unwrap());

        // A second child of C splits after C.
        let second = chain.add_block(block(blocks[3].hash(), 51, vec![coinbase(4, 2)])).unwrap();
        assert_ne!(chain.segment_of(first).unwrap(), chain.segment_of(c).unwrap());
        assert_eq!(chain.segment_parent(chain.segment_of(second).unwrap()).unwrap(), Some(chain.segment_of(c).unwrap()));

        // Forking at A moves B and C into a new segment that adopts both children.
        let off_a = chain.add_block(block(blocks[1].hash(), 60, vec![coinbase(2, 3)])).unwrap();
        let tail = chain.segment_of(c).unwrap();
        assert_eq!(chain.segment_parent(chain.segment_of(first).unwrap()).unwrap(), Some(tail));
        assert_eq!(chain.segment_parent(chain.segment_of(second).unwrap()).unwrap(), Some(tail));
        assert_eq!(chain.segment_head(tail).unwrap(), Some(c));
        assert!(!chain.segments_connected(tail, chain.segment_of(off_a).unwrap()).unwrap());
        assert!(chain.segments_connected(tail, chain.segment_of(first).unwrap()).unwrap());
    }

    #[test]
    fn child_block_follows_requested_segment() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 3); // G A B
        let c = chain.add_block(block(blocks[1].hash(), 70, vec![coinbase(2, 3)])).unwrap();
        let a = chain.block_id(&blocks[1].hash()).unwrap().unwrap();
        let b = chain.block_id(&blocks[2].hash()).unwrap().unwrap();

        assert_eq!(chain.child_block(chain.segment_of(c).unwrap(), a).unwrap(), Some(c));
        assert_eq!(chain.child_block(chain.segment_of(b).unwrap(), a).unwrap(), Some(b));
        assert_eq!(chain.child_block(chain.segment_of(b).unwrap(), b).unwrap(), None);
    }

    #[test]
    fn block_at_height_walks_ancestry() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 3);
        let c = chain.add_block(block(blocks[1].hash(), 70, vec![coinbase(2, 3)])).unwrap();
        let seg = chain.segment_of(c).unwrap();
        let g = chain.block_id(&blocks[0].hash()).unwrap();
        assert_eq!(chain.block_at_height(seg, 0).unwrap(), g);
        assert_eq!(chain.block_at_height(seg, 2).unwrap(), Some(c));
        assert_eq!(chain.block_at_height(seg, 3).unwrap(), None);
    }

    #[test]
    fn best_header_follows_most_work() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 3);
        let c = chain.add_block(block(blocks[1].hash(), 70, vec![coinbase(2, 3)])).unwrap();
        let best = chain.head_header().unwrap().unwrap();
        assert_eq!(chain.block_hash(best).unwrap(), blocks[2].hash());

        let d = chain.insert_header(block(chain.block_hash(c).unwrap(), 71, vec![coinbase(3, 3)]).header).unwrap();
        assert_eq!(chain.head_header().unwrap(), Some(d));
        assert_eq!(chain.head_segment().unwrap(), Some(chain.segment_of(d).unwrap()));
        assert!(chain.chain_work(d).unwrap() > chain.chain_work(c).unwrap());
    }

    #[test]
    fn orphan_header_rejected() {
        let chain = MemoryChain::new();
        linear_chain(&chain, 1);
        let orphan = block(Hash256([0xEE; 32]), 1, vec![coinbase(1, 0)]);
        let err = chain.insert_header(orphan.header).unwrap_err();
        assert!(matches!(err, StorageError::Chain(ChainError::OrphanHeader(_))));
    }

    #[test]
    fn processed_head_in_segment_skips_header_only_blocks() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 2);
        let h = chain.insert_header(block(blocks[1].hash(), 9, vec![coinbase(2, 0)]).header).unwrap();
        let seg = chain.segment_of(h).unwrap();
        let processed = chain.processed_head_in_segment(seg).unwrap().unwrap();
        assert_eq!(chain.block_hash(processed).unwrap(), blocks[1].hash());
        assert!(!chain.has_block_body(h).unwrap());
    }

    // --- Committed chain and UTXO set ---

    #[test]
    fn connect_and_disconnect_restore_utxos() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 2);
        let cb = blocks[1].transactions[0].txid();
        let spend_tx = spend(&[OutPoint::new(cb, 0)], &[40]);
        let b2 = block(blocks[1].hash(), 2, vec![coinbase(2, 0), spend_tx.clone()]);
        let before = chain.utxo_count();

        chain.extend(b2).unwrap();
        let res = chain.get_unspent_outputs(&[OutPoint::new(cb, 0), OutPoint::new(spend_tx.txid(), 0)]).unwrap();
        assert!(res[0].is_none());
        assert_eq!(res[1].as_ref().unwrap().block_height, Some(2));

        chain.disconnect_head().unwrap();
        assert_eq!(chain.utxo_count(), before);
        let res = chain.get_unspent_outputs(&[OutPoint::new(cb, 0)]).unwrap();
        assert!(res[0].as_ref().unwrap().is_coinbase);
        // Output data survives spending.
        assert!(chain.find_output(&OutPoint::new(spend_tx.txid(), 0)).unwrap().is_some());
    }

    #[test]
    fn connect_rejects_missing_input() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 1);
        let bad = block(blocks[0].hash(), 1, vec![coinbase(1, 0), spend(&[OutPoint::new(Hash256([5; 32]), 0)], &[1])]);
        let id = chain.add_block(bad).unwrap();
        let err = chain.connect_block(id).unwrap_err();
        assert!(matches!(err, StorageError::Chain(ChainError::MissingOutput(_))));
        assert_eq!(chain.block_height(chain.head_block().unwrap().unwrap()).unwrap(), 0);
    }

    #[test]
    fn connect_rejects_non_extending_block() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 3);
        let side = chain.add_block(block(blocks[0].hash(), 33, vec![coinbase(1, 7)])).unwrap();
        assert!(matches!(
            chain.connect_block(side),
            Err(StorageError::Chain(ChainError::NotConnectable(_)))
        ));
    }

    #[test]
    fn disconnect_empty_chain_errors() {
        let chain = MemoryChain::new();
        assert!(matches!(chain.disconnect_head(), Err(StorageError::Chain(ChainError::EmptyChain))));
    }

    #[test]
    fn transaction_lookup_scoped_to_segment() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 3);
        let side = chain.add_block(block(blocks[1].hash(), 80, vec![coinbase(2, 4)])).unwrap();
        let main_tx = blocks[2].transactions[0].txid();
        let a_tx = blocks[1].transactions[0].txid();

        let side_seg = chain.segment_of(side).unwrap();
        let found = chain.block_ids_for_transactions(side_seg, &[main_tx, a_tx]).unwrap();
        assert!(!found.contains_key(&main_tx));
        let a = chain.block_id(&blocks[1].hash()).unwrap().unwrap();
        assert_eq!(found.get(&a_tx), Some(&a));
        assert_eq!(chain.heights_for_blocks(&[a]).unwrap().get(&a), Some(&1));
    }

    #[test]
    fn strip_output_heights_clears_heights() {
        let chain = MemoryChain::new();
        let blocks = linear_chain(&chain, 1);
        chain.strip_output_heights();
        let op = OutPoint::new(blocks[0].transactions[0].txid(), 0);
        assert_eq!(chain.get_unspent_outputs(&[op]).unwrap()[0].as_ref().unwrap().block_height, None);
    }

    // --- Pending block store ---

    #[test]
    fn pending_store_is_idempotent() {
        let store = MemoryPendingBlockStore::new();
        let b = block(Hash256::ZERO, 0, vec![coinbase(0, 0)]);
        assert!(!store.exists(&b.hash()).unwrap());
        assert!(store.store(&b).unwrap());
        assert!(!store.store(&b).unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&b.hash(), None).unwrap(), Some(b));
    }

    // --- proptest ---

    proptest! {
        #[test]
        fn random_trees_keep_segment_invariants(parents in prop::collection::vec(0usize..1000, 1..40)) {
            let chain = MemoryChain::new();
            let genesis = block(Hash256::ZERO, 0, vec![coinbase(0, 0)]);
            chain.insert_header(genesis.header.clone()).unwrap();
            let mut blocks = vec![(genesis, 0u32)];
            for (i, pick) in parents.iter().enumerate() {
                let (parent, height) = blocks[pick % blocks.len()].clone();
                let next = child_block(&parent, height + 1, (i + 1) as u8, vec![]);
                chain.insert_header(next.header.clone()).unwrap();
                blocks.push((next, height + 1));
            }

            for (b, height) in &blocks {
                let id = chain.block_id(&b.hash()).unwrap().unwrap();
                let seg = chain.segment_of(id).unwrap();
                prop_assert_eq!(chain.block_height(id).unwrap(), *height as u64);
                prop_assert_eq!(chain.block_at_height(seg, *height as u64).unwrap(), Some(id));
                if let Some(parent) = chain.parent_block(id).unwrap() {
                    prop_assert_eq!(chain.child_block(seg, parent).unwrap(), Some(id));
                    let parent_seg = chain.segment_of(parent).unwrap();
                    prop_assert!(chain.segments_connected(parent_seg, seg).unwrap());
                    if parent_seg != seg {
                        prop_assert_eq!(chain.segment_head(parent_seg).unwrap(), Some(parent));
                    }
                }
            }
        }
    }
}
