//! Download scheduler configuration.

use blocksync_core::constants::{
    DEFAULT_MAX_CONCURRENT_DOWNLOADS, DEFAULT_MAX_CONCURRENT_DOWNLOADS_PER_PEER,
    DOWNLOAD_BATCH_SIZE, MAX_DOWNLOAD_AHEAD_DEPTH,
};
use serde::{Deserialize, Serialize};

/// Limits and planning options for the block downloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum number of block requests in flight across all peers.
    pub max_concurrent_downloads: usize,
    /// Maximum number of block requests in flight to a single peer.
    pub max_concurrent_downloads_per_peer: usize,
    /// Maximum number of descriptors produced by one planner batch.
    pub batch_size: usize,
    /// How far past the committed head the planner may schedule downloads.
    /// `None` disables the bound.
    pub max_download_ahead_depth: Option<u64>,
    /// Plan blocks of sufficiently-worked alternate chains when the main chain
    /// has nothing left to fetch.
    pub alternate_chain_download: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_concurrent_downloads_per_peer: DEFAULT_MAX_CONCURRENT_DOWNLOADS_PER_PEER,
            batch_size: DOWNLOAD_BATCH_SIZE,
            max_download_ahead_depth: Some(MAX_DOWNLOAD_AHEAD_DEPTH),
            alternate_chain_download: true,
        }
    }
}
