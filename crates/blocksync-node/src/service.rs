//! The scheduler loop.
//!
//! [`SyncService`] drives a [`BlockDownloader`]: each tick runs one
//! scheduling pass, refills the queue from the planner once it has drained
//! and hands deferred blocks back to the validation pipeline. Between ticks
//! it sleeps until a completion wakes it, the tick interval elapses, or
//! shutdown is signalled.

use std::sync::Arc;
use std::time::Duration;

use blocksync_core::error::StorageError;
use blocksync_core::traits::{ChainIndex, PendingBlockStore, UtxoStore};
use blocksync_download::{BlockDownloadPlanner, BlockDownloader, ChainDownloadPlanner, InventoryTracker, PeerCollector};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::pipeline::{BlockValidator, ValidationPipeline, ValidationReport};

/// Storage and network collaborators the service is assembled from.
pub struct SyncDependencies {
    pub chain: Arc<dyn ChainIndex>,
    pub utxos: Arc<dyn UtxoStore>,
    pub pending: Arc<dyn PendingBlockStore>,
    pub peers: Arc<dyn PeerCollector>,
    pub inventory: Arc<dyn InventoryTracker>,
    pub validator: Arc<dyn BlockValidator>,
}

pub struct SyncService {
    downloader: BlockDownloader,
    pipeline: Option<Arc<ValidationPipeline>>,
    tick_interval: Duration,
}

impl SyncService {
    pub fn new(downloader: BlockDownloader, tick_interval: Duration) -> Self {
        Self {
            downloader,
            pipeline: None,
            tick_interval,
        }
    }

    /// Retry the pipeline's deferred blocks on every tick.
    pub fn with_pipeline(mut self, pipeline: Arc<ValidationPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Wire planner, scheduler and validation pipeline from `config`.
    ///
    /// Returns the service and the receiver of validation reports.
    pub fn assemble(
        config: &NodeConfig,
        deps: SyncDependencies,
    ) -> (Self, mpsc::UnboundedReceiver<ValidationReport>) {
        let planner: Arc<dyn BlockDownloadPlanner> = Arc::new(ChainDownloadPlanner::new(
            Arc::clone(&deps.chain),
            Arc::clone(&deps.pending),
            &config.download,
        ));
        let downloader = BlockDownloader::new(
            Arc::clone(&planner),
            Arc::clone(&deps.pending),
            deps.peers,
            deps.inventory,
            &config.download,
        );
        let (pipeline, reports) = ValidationPipeline::new(
            deps.chain,
            deps.utxos,
            deps.pending,
            deps.validator,
            config.max_reorg_depth,
        );
        let pipeline = Arc::new(pipeline.with_planner(planner));
        downloader.set_callback(pipeline.clone());

        let service = Self::new(downloader, config.tick_interval()).with_pipeline(pipeline);
        (service, reports)
    }

    pub fn downloader(&self) -> &BlockDownloader {
        &self.downloader
    }

    /// One scheduling pass, followed by a refill and a second pass when the
    /// queue has drained. Deferred blocks are retried on a blocking task, or
    /// inline outside a runtime.
    pub fn tick(&self) -> Result<(), StorageError> {
        self.downloader.run_once()?;
        if self.downloader.queue_len() == 0 && self.downloader.start() > 0 {
            self.downloader.run_once()?;
        }
        if let Some(pipeline) = &self.pipeline {
            if pipeline.deferred_count() > 0 {
                let pipeline = Arc::clone(pipeline);
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn_blocking(move || pipeline.retry_deferred());
                    }
                    Err(_) => {
                        pipeline.retry_deferred();
                    }
                }
            }
        }
        Ok(())
    }

    /// Run until `shutdown` carries `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let seeded = self.downloader.start();
        info!(seeded, "sync: service started");

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if let Err(e) = self.tick() {
                warn!("sync: scheduling pass failed: {e}");
            }

            tokio::select! {
                _ = self.downloader.notified() => {}
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(
            queued = self.downloader.queue_len(),
            active = self.downloader.active_download_count(),
            "sync: service stopped"
        );
    }

    /// Spawn [`run`](Self::run) on the current runtime. Send `true` on the
    /// returned sender to stop it.
    pub fn spawn(self) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(rx));
        (handle, tx)
    }
}
