//! Layered UTXO view used to walk across a chain reorganization.
//!
//! The log sits on top of the durable [`UtxoStore`]: undoing a committed
//! block restores the outputs it spent and hides the outputs it created;
//! applying a block on the alternate branch does the reverse. Lookups consult
//! the hidden set, then the restored set, then fall back to the store.

use std::collections::{HashMap, HashSet};

use blocksync_core::error::{ChainError, StorageError};
use blocksync_core::traits::UtxoStore;
use blocksync_core::types::{Block, Hash256, OutPoint, UnspentOutput};
use tracing::debug;

pub struct UtxoUndoLog<'a> {
    store: &'a dyn UtxoStore,
    available: HashMap<OutPoint, UnspentOutput>,
    unavailable: HashSet<OutPoint>,
}

impl<'a> UtxoUndoLog<'a> {
    pub fn new(store: &'a dyn UtxoStore) -> Self {
        Self {
            store,
            available: HashMap::new(),
            unavailable: HashSet::new(),
        }
    }

    /// Reverse a committed block's effect on the view.
    ///
    /// Outputs the block spent become available again unless the block itself
    /// created them. Every output the block created becomes unavailable, so a
    /// stale read of the durable set cannot resurrect it.
    pub fn undo_block(&mut self, block: &Block) -> Result<(), StorageError> {
        debug!(hash = %block.hash(), "utxo: undoing block");
        let txids: HashSet<Hash256> = block.txids().into_iter().collect();

        for (i, tx) in block.transactions.iter().enumerate() {
            if i > 0 {
                for input in &tx.inputs {
                    let outpoint = input.previous_output;
                    if txids.contains(&outpoint.txid) {
                        continue;
                    }
                    let output = self
                        .store
                        .find_output(&outpoint)?
                        .ok_or_else(|| ChainError::MissingOutput(outpoint.to_string()))?;
                    self.available.insert(outpoint, output);
                }
            }
            self.unavailable.extend(tx.output_points());
        }
        Ok(())
    }

    /// Apply a block of the alternate branch at `height`.
    ///
    /// Outputs it spends are hidden (including ones still unspent in the
    /// durable set, which reflects the other branch); outputs it creates
    /// become available.
    pub fn apply_block(&mut self, block: &Block, height: u64) {
        debug!(hash = %block.hash(), height, "utxo: applying block");
        for (i, tx) in block.transactions.iter().enumerate() {
            let is_coinbase = i == 0;
            if !is_coinbase {
                for input in &tx.inputs {
                    self.available.remove(&input.previous_output);
                    self.unavailable.insert(input.previous_output);
                }
            }
            for (outpoint, output) in tx.output_points().zip(&tx.outputs) {
                self.unavailable.remove(&outpoint);
                self.available
                    .insert(outpoint, UnspentOutput::new(output.clone(), height, is_coinbase));
            }
        }
    }

    /// Look up one output through the view.
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>, StorageError> {
        Ok(self.get_many(std::slice::from_ref(outpoint))?.pop().flatten())
    }

    /// Positional batch lookup. Outpoints not decided by the log are fetched
    /// from the durable store in a single call.
    pub fn get_many(&self, outpoints: &[OutPoint]) -> Result<Vec<Option<UnspentOutput>>, StorageError> {
        let mut results: Vec<Option<UnspentOutput>> = Vec::with_capacity(outpoints.len());
        let mut deferred_positions = Vec::new();
        let mut deferred = Vec::new();

        for (pos, outpoint) in outpoints.iter().enumerate() {
            if self.unavailable.contains(outpoint) {
                results.push(None);
            } else if let Some(output) = self.available.get(outpoint) {
                results.push(Some(output.clone()));
            } else {
                results.push(None);
                deferred_positions.push(pos);
                deferred.push(*outpoint);
            }
        }

        if !deferred.is_empty() {
            let fetched = self.store.get_unspent_outputs(&deferred)?;
            for (pos, output) in deferred_positions.into_iter().zip(fetched) {
                results[pos] = output;
            }
        }
        Ok(results)
    }
}
