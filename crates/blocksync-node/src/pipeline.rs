//! The download callback that prepares and validates each staged block.
//!
//! For every block the scheduler hands over, [`ValidationPipeline`] looks up
//! the block's height, builds a fresh [`MutableUtxoSet`] for it and runs the
//! configured [`BlockValidator`] against that view. The verdict is published
//! as a [`ValidationReport`] on an unbounded Tokio channel; valid main-chain
//! blocks are also reported back to the planner so it can continue from them.
//!
//! Deferred blocks stay staged. The pipeline remembers which chain position
//! each was checked against and [`ValidationPipeline::retry_deferred`]
//! re-reads them from the pending store once that position has moved.

use std::collections::HashMap;
use std::sync::Arc;

use blocksync_core::traits::{ChainIndex, PendingBlockStore, UtxoStore};
use blocksync_core::types::{Block, BlockId, Hash256};
use blocksync_download::{BlockDownloadCallback, BlockDownloadPlanner, PeerId, PendingBlockInventory};
use blocksync_utxo::{MutableUtxoSet, UtxoContext};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Consensus checks run against a block's resolved inputs.
pub trait BlockValidator: Send + Sync {
    fn validate(&self, block: &Block, height: u64, utxos: &dyn UtxoContext) -> Result<(), String>;
}

/// Checks that no transaction creates more value than it spends.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValueBalanceValidator;

impl BlockValidator for ValueBalanceValidator {
    fn validate(&self, block: &Block, _height: u64, utxos: &dyn UtxoContext) -> Result<(), String> {
        for tx in block.transactions.iter().skip(1) {
            let mut spent: u64 = 0;
            for input in &tx.inputs {
                let output = utxos
                    .output(&input.previous_output)
                    .ok_or_else(|| format!("unresolved input {}", input.previous_output))?;
                spent = spent
                    .checked_add(output.value)
                    .ok_or_else(|| format!("input value overflow in {}", tx.txid()))?;
            }
            let created = tx
                .outputs
                .iter()
                .try_fold(0u64, |acc, out| acc.checked_add(out.value))
                .ok_or_else(|| format!("output value overflow in {}", tx.txid()))?;
            if created > spent {
                return Err(format!("{} creates {created} but spends {spent}", tx.txid()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(String),
    /// Not decidable yet: the header is not indexed or an input has not been
    /// seen. The block stays staged and is retried once the committed head or
    /// the best header changes.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub hash: Hash256,
    pub height: Option<u64>,
    pub peer: Option<PeerId>,
    pub outcome: ValidationOutcome,
}

/// Committed head and best header at the time a block was checked.
type ChainPosition = Option<(Option<BlockId>, Option<BlockId>)>;

struct DeferredBlock {
    peer: Option<PeerId>,
    checked_at: ChainPosition,
}

pub struct ValidationPipeline {
    chain: Arc<dyn ChainIndex>,
    utxos: Arc<dyn UtxoStore>,
    pending: Arc<dyn PendingBlockStore>,
    validator: Arc<dyn BlockValidator>,
    planner: Option<Arc<dyn BlockDownloadPlanner>>,
    max_reorg_depth: usize,
    reports: mpsc::UnboundedSender<ValidationReport>,
    deferred: Mutex<HashMap<Hash256, DeferredBlock>>,
    retry_pass: Mutex<()>,
}

impl ValidationPipeline {
    /// Build a pipeline and the receiving end of its report channel.
    pub fn new(
        chain: Arc<dyn ChainIndex>,
        utxos: Arc<dyn UtxoStore>,
        pending: Arc<dyn PendingBlockStore>,
        validator: Arc<dyn BlockValidator>,
        max_reorg_depth: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ValidationReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let pipeline = Self {
            chain,
            utxos,
            pending,
            validator,
            planner: None,
            max_reorg_depth,
            reports,
            deferred: Mutex::new(HashMap::new()),
            retry_pass: Mutex::new(()),
        };
        (pipeline, rx)
    }

    /// Report valid blocks back to `planner` as completed inventory.
    pub fn with_planner(mut self, planner: Arc<dyn BlockDownloadPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Resolve inputs for `block` and run the validator. Returns the height
    /// the block was validated at alongside the outcome.
    pub fn validate_block(&self, block: &Block) -> (Option<u64>, ValidationOutcome) {
        let hash = block.hash();
        let height = match self.block_height(&hash) {
            Ok(Some(height)) => height,
            Ok(None) => {
                debug!(%hash, "pipeline: header not indexed yet, deferring");
                return (None, ValidationOutcome::Deferred);
            }
            Err(e) => {
                warn!(%hash, "pipeline: height lookup failed: {e}");
                return (None, ValidationOutcome::Deferred);
            }
        };

        let mut set = MutableUtxoSet::new().with_max_reorg_depth(self.max_reorg_depth);
        let loaded = match set.load_outputs_for_block(self.chain.as_ref(), self.utxos.as_ref(), block, height) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(%hash, height, "pipeline: loading outputs failed: {e}");
                return (Some(height), ValidationOutcome::Deferred);
            }
        };
        if !loaded {
            let missing = set.missing_outputs();
            if missing.is_empty() {
                return (Some(height), ValidationOutcome::Invalid("duplicate input within block".into()));
            }
            debug!(%hash, height, missing = missing.len(), "pipeline: inputs not available yet");
            return (Some(height), ValidationOutcome::Deferred);
        }

        match self.validator.validate(block, height, &set) {
            Ok(()) => (Some(height), ValidationOutcome::Valid),
            Err(reason) => (Some(height), ValidationOutcome::Invalid(reason)),
        }
    }

    /// Number of staged blocks waiting for a retry.
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Re-validate deferred blocks whose chain position has moved since they
    /// were last checked. Returns how many were retried.
    ///
    /// A retry that is still undecidable publishes no report. A concurrent
    /// call returns 0 at once.
    pub fn retry_deferred(&self) -> usize {
        let Some(_pass) = self.retry_pass.try_lock() else {
            return 0;
        };
        let position = self.chain_position();
        let due: Vec<(Hash256, Option<PeerId>)> = self
            .deferred
            .lock()
            .iter()
            .filter(|(_, d)| d.checked_at != position)
            .map(|(hash, d)| (*hash, d.peer))
            .collect();

        let mut retried = 0;
        for (hash, peer) in due {
            match self.pending.get(&hash, None) {
                Ok(Some(block)) => {
                    self.process(block, peer, true);
                    retried += 1;
                }
                Ok(None) => {
                    debug!(%hash, "pipeline: deferred block no longer staged");
                    self.deferred.lock().remove(&hash);
                }
                Err(e) => warn!(%hash, "pipeline: reading deferred block failed: {e}"),
            }
        }
        if retried > 0 {
            debug!(retried, remaining = self.deferred_count(), "pipeline: deferred blocks retried");
        }
        retried
    }

    fn chain_position(&self) -> ChainPosition {
        match (self.chain.head_block(), self.chain.head_header()) {
            (Ok(block), Ok(header)) => Some((block, header)),
            (Err(e), _) | (_, Err(e)) => {
                warn!("pipeline: chain head lookup failed: {e}");
                None
            }
        }
    }

    fn process(&self, block: Block, peer: Option<PeerId>, retry: bool) {
        let hash = block.hash();
        let checked_at = self.chain_position();
        let (height, outcome) = self.validate_block(&block);

        match &outcome {
            ValidationOutcome::Valid => {
                trace!(%hash, ?height, retry, "pipeline: block valid");
                self.deferred.lock().remove(&hash);
                if let (Some(planner), Some(height)) = (&self.planner, height) {
                    planner.mark_inventory_complete(&PendingBlockInventory::at_height(hash, height));
                }
            }
            ValidationOutcome::Invalid(reason) => {
                info!(%hash, ?height, peer = ?peer, "pipeline: block invalid: {reason}");
                self.deferred.lock().remove(&hash);
            }
            ValidationOutcome::Deferred => {
                self.deferred.lock().insert(hash, DeferredBlock { peer, checked_at });
                if retry {
                    return;
                }
            }
        }

        let report = ValidationReport {
            hash,
            height,
            peer,
            outcome,
        };
        if self.reports.send(report).is_err() {
            trace!(%hash, "pipeline: report receiver dropped");
        }
    }

    fn block_height(&self, hash: &Hash256) -> Result<Option<u64>, blocksync_core::error::StorageError> {
        match self.chain.block_id(hash)? {
            Some(id) => Ok(Some(self.chain.block_height(id)?)),
            None => Ok(None),
        }
    }
}

impl BlockDownloadCallback for ValidationPipeline {
    fn on_block_downloaded(&self, block: Block, peer: Option<PeerId>) {
        self.process(block, peer, false);
    }
}
