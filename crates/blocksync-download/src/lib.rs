//! # blocksync-download
//! Decides which blocks to fetch, from which peer, and in what order.
//!
//! - [`planner`]: walks the header chain for blocks not yet staged
//! - [`selector`]: picks a serving peer from announcements and chain heights
//! - [`downloader`]: priority queue, in-flight limits and retry policy

pub mod config;
pub mod counters;
pub mod downloader;
pub mod inventory;
pub mod peer;
pub mod planner;
pub mod selector;

pub use config::DownloadConfig;
pub use downloader::{BlockDownloadCallback, BlockDownloader};
pub use inventory::PendingBlockInventory;
pub use peer::{
    InventoryTracker, NoInventory, PeerCollector, PeerHandle, PeerId, PeerNode, RequestId, RequestPriority, StaticPeers,
};
pub use planner::{BlockDownloadPlanner, ChainDownloadPlanner};
pub use selector::PeerSelector;
