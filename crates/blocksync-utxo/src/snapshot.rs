//! Per-block UTXO snapshot for validation.
//!
//! [`MutableUtxoSet`] holds exactly the previous outputs one candidate block
//! spends, the confirmation heights of the transactions involved, and a small
//! height-to-hash index. It resolves outputs directly from the durable store
//! when the candidate extends the committed chain, and through a
//! [`UtxoUndoLog`] walk when the candidate sits on an alternate branch.

use std::collections::{HashMap, HashSet};

use blocksync_core::constants::{MAX_REORG_DEPTH, is_allowed_duplicate};
use blocksync_core::error::{ChainError, StorageError};
use blocksync_core::traits::{ChainIndex, UtxoStore};
use blocksync_core::types::{Block, BlockId, Hash256, OutPoint, SegmentId, TxOutput, UnspentOutput};
use tracing::{debug, trace, warn};

use crate::undo_log::UtxoUndoLog;

/// Read access a block validator needs to the outputs its block spends.
pub trait UtxoContext {
    fn output(&self, outpoint: &OutPoint) -> Option<&TxOutput>;

    /// Height of the block containing the transaction that created `outpoint`.
    fn block_height(&self, outpoint: &OutPoint) -> Option<u64>;

    /// Hash of the block containing the transaction that created `outpoint`,
    /// when that height has been seen by this snapshot.
    fn block_hash(&self, outpoint: &OutPoint) -> Option<Hash256>;

    fn is_coinbase_output(&self, outpoint: &OutPoint) -> Option<bool>;
}

#[derive(Debug, Clone)]
pub struct MutableUtxoSet {
    outputs: HashMap<OutPoint, UnspentOutput>,
    tx_block_heights: HashMap<Hash256, u64>,
    block_hash_by_height: HashMap<u64, Hash256>,
    missing: Vec<OutPoint>,
    max_reorg_depth: usize,
}

impl Default for MutableUtxoSet {
    fn default() -> Self {
        Self {
            outputs: HashMap::new(),
            tx_block_heights: HashMap::new(),
            block_hash_by_height: HashMap::new(),
            missing: Vec::new(),
            max_reorg_depth: MAX_REORG_DEPTH,
        }
    }
}

impl MutableUtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the number of blocks unwound, and replayed, when resolving an
    /// alternate-branch block.
    pub fn with_max_reorg_depth(mut self, depth: usize) -> Self {
        self.max_reorg_depth = depth;
        self
    }

    /// Load every previous output spent by `block` at `height`.
    ///
    /// Returns `Ok(true)` when all of them were resolved. `Ok(false)` means
    /// either a duplicate spend within the block (outside the BIP30
    /// allow-list), an unindexed header, or at least one output that could not
    /// be found yet; [`missing_outputs`](Self::missing_outputs) lists the
    /// latter. Outputs created by the block's own transactions are neither
    /// looked up nor loaded, so a transaction spending an earlier one in the
    /// same block finds no entry for that input.
    pub fn load_outputs_for_block(
        &mut self,
        chain: &dyn ChainIndex,
        utxos: &dyn UtxoStore,
        block: &Block,
        height: u64,
    ) -> Result<bool, StorageError> {
        let hash = block.hash();
        let Some(block_id) = chain.block_id(&hash)? else {
            debug!(%hash, "utxo: header not indexed, cannot load outputs");
            return Ok(false);
        };
        self.block_hash_by_height.insert(height, hash);
        self.missing.clear();

        let segment = chain.segment_of(block_id)?;
        let on_main_chain = match chain.head_block()? {
            Some(head) => chain.segments_connected(segment, chain.segment_of(head)?)?,
            None => true,
        };

        let Some(required) = self.collect_required_outputs(block, height) else {
            debug!(%hash, "utxo: duplicate spend within block");
            return Ok(false);
        };

        let resolved = if on_main_chain {
            utxos.get_unspent_outputs(&required)?
        } else {
            debug!(%hash, height, "utxo: loading outputs for alternate block");
            let mut log = UtxoUndoLog::new(utxos);
            self.rewind_to_branch(chain, &mut log, block_id, segment)?;
            log.get_many(&required)?
        };

        let mut unknown_heights = HashSet::new();
        for (outpoint, output) in required.into_iter().zip(resolved) {
            let Some(output) = output else {
                if self.missing.is_empty() {
                    debug!(%outpoint, "utxo: missing output");
                }
                self.missing.push(outpoint);
                continue;
            };
            match output.block_height {
                Some(h) => {
                    self.tx_block_heights.insert(outpoint.txid, h);
                }
                None => {
                    unknown_heights.insert(outpoint.txid);
                }
            }
            self.outputs.insert(outpoint, output);
        }

        self.resolve_unknown_heights(utxos, segment, unknown_heights)?;

        if !self.missing.is_empty() {
            debug!(%hash, missing = self.missing.len(), "utxo: failed to load all outputs");
        }
        Ok(self.missing.is_empty())
    }

    /// Previous outputs referenced by the block's non-coinbase inputs, minus
    /// outputs the block itself creates. `None` on a disallowed duplicate.
    fn collect_required_outputs(&mut self, block: &Block, height: u64) -> Option<Vec<OutPoint>> {
        let mut required = Vec::new();
        let mut seen = HashSet::new();
        let mut created = HashSet::new();

        for (i, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            self.tx_block_heights.insert(txid, height);
            if i == 0 {
                continue;
            }
            for input in &tx.inputs {
                let outpoint = input.previous_output;
                if seen.insert(outpoint) {
                    required.push(outpoint);
                } else if !is_allowed_duplicate(&outpoint.txid) {
                    return None;
                }
            }
            created.extend(tx.output_points());
        }

        required.retain(|op| !created.contains(op));
        Some(required)
    }

    /// Unwind the committed chain to the fork point with `segment`, then
    /// replay the branch up to (not including) `target`.
    fn rewind_to_branch(
        &mut self,
        chain: &dyn ChainIndex,
        log: &mut UtxoUndoLog<'_>,
        target: BlockId,
        segment: SegmentId,
    ) -> Result<(), StorageError> {
        let Some(head) = chain.head_block()? else {
            return Ok(());
        };

        let mut cursor = head;
        let mut fork = None;
        for _ in 0..self.max_reorg_depth {
            let block = chain
                .block(cursor)?
                .ok_or_else(|| ChainError::MissingBody(cursor.to_string()))?;
            log.undo_block(&block)?;
            for txid in block.txids() {
                self.tx_block_heights.remove(&txid);
            }

            let Some(parent) = chain.parent_block(cursor)? else {
                break;
            };
            cursor = parent;
            if chain.segments_connected(segment, chain.segment_of(parent)?)? {
                fork = Some(parent);
                break;
            }
        }

        let Some(fork) = fork else {
            warn!(max_depth = self.max_reorg_depth, "utxo: fork point not found within reorg depth");
            return Ok(());
        };
        trace!(fork = %chain.block_hash(fork)?, "utxo: found fork point");

        let mut cursor = fork;
        for _ in 0..self.max_reorg_depth {
            let Some(child) = chain.child_block(segment, cursor)? else {
                break;
            };
            if child == target || !chain.has_block_body(child)? {
                break;
            }
            let Some(block) = chain.block(child)? else {
                break;
            };
            let height = chain.block_height(child)?;
            log.apply_block(&block, height);
            for txid in block.txids() {
                self.tx_block_heights.insert(txid, height);
            }
            cursor = child;
        }
        Ok(())
    }

    /// Fill in confirmation heights the durable set did not record.
    fn resolve_unknown_heights(
        &mut self,
        utxos: &dyn UtxoStore,
        segment: SegmentId,
        unknown: HashSet<Hash256>,
    ) -> Result<(), StorageError> {
        let txids: Vec<Hash256> = unknown
            .into_iter()
            .filter(|txid| !self.tx_block_heights.contains_key(txid))
            .collect();
        if txids.is_empty() {
            return Ok(());
        }

        let block_ids = utxos.block_ids_for_transactions(segment, &txids)?;
        let unique: HashSet<BlockId> = block_ids.values().copied().collect();
        let unique: Vec<BlockId> = unique.into_iter().collect();
        let heights = utxos.heights_for_blocks(&unique)?;
        for (txid, block_id) in block_ids {
            if let Some(height) = heights.get(&block_id) {
                self.tx_block_heights.insert(txid, *height);
            }
        }
        Ok(())
    }

    /// Advance the snapshot past an accepted block: add its outputs and drop
    /// the outputs it spends.
    pub fn update(&mut self, block: &Block, height: u64) {
        self.block_hash_by_height.insert(height, block.hash());
        for (i, tx) in block.transactions.iter().enumerate() {
            self.tx_block_heights.insert(tx.txid(), height);
            for (outpoint, output) in tx.output_points().zip(&tx.outputs) {
                self.outputs
                    .insert(outpoint, UnspentOutput::new(output.clone(), height, i == 0));
            }
        }
        for tx in block.transactions.iter().skip(1) {
            for input in &tx.inputs {
                self.outputs.remove(&input.previous_output);
            }
        }
    }

    pub fn clear(&mut self) {
        self.outputs.clear();
        self.tx_block_heights.clear();
        self.block_hash_by_height.clear();
        self.missing.clear();
    }

    /// Outputs the last [`load_outputs_for_block`](Self::load_outputs_for_block)
    /// could not resolve.
    pub fn missing_outputs(&self) -> &[OutPoint] {
        &self.missing
    }

    pub fn unspent_output(&self, outpoint: &OutPoint) -> Option<&UnspentOutput> {
        self.outputs.get(outpoint)
    }

    pub fn transaction_height(&self, txid: &Hash256) -> Option<u64> {
        self.tx_block_heights.get(txid).copied()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

impl UtxoContext for MutableUtxoSet {
    fn output(&self, outpoint: &OutPoint) -> Option<&TxOutput> {
        self.outputs.get(outpoint).map(|u| &u.output)
    }

    fn block_height(&self, outpoint: &OutPoint) -> Option<u64> {
        self.tx_block_heights.get(&outpoint.txid).copied()
    }

    fn block_hash(&self, outpoint: &OutPoint) -> Option<Hash256> {
        let height = self.block_height(outpoint)?;
        self.block_hash_by_height.get(&height).copied()
    }

    fn is_coinbase_output(&self, outpoint: &OutPoint) -> Option<bool> {
        self.outputs.get(outpoint).map(|u| u.is_coinbase)
    }
}
