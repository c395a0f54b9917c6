//! # blocksync-node
//! Assembles the synchronization engine into a running service.
//!
//! - [`config`]: layered [`NodeConfig`] loading and validation
//! - [`telemetry`]: `tracing` subscriber setup
//! - [`pending_store`]: RocksDB staging area for downloaded blocks
//! - [`pipeline`]: per-block UTXO view construction and validation
//! - [`service`]: the periodically woken scheduler loop

pub mod config;
pub mod error;
pub mod pending_store;
pub mod pipeline;
pub mod service;
pub mod telemetry;

pub use config::NodeConfig;
pub use error::{ConfigError, NodeError};
pub use pending_store::RocksPendingBlockStore;
pub use pipeline::{BlockValidator, ValidationOutcome, ValidationPipeline, ValidationReport, ValueBalanceValidator};
pub use service::{SyncDependencies, SyncService};
pub use telemetry::init_logging;
