//! Synchronization and consensus constants.

use std::sync::LazyLock;

use crate::types::Hash256;

/// Maximum number of blocks the UTXO view may be unwound or replayed while
/// resolving outputs for a block on an alternate branch.
pub const MAX_REORG_DEPTH: usize = 288;

/// Maximum number of descriptors produced by one planner batch.
pub const DOWNLOAD_BATCH_SIZE: usize = 256;

/// Default number of blocks the downloader may run ahead of the committed head.
pub const MAX_DOWNLOAD_AHEAD_DEPTH: u64 = 2048;

/// How far below the best header an alternate chain's work is measured against.
pub const ALTERNATE_CHAIN_EVALUATION_DEPTH: u64 = 144;

/// Default global in-flight download limit.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 8;

/// Default in-flight download limit for a single peer.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS_PER_PEER: usize = 2;

/// Lower bound of the priority step applied to a failed download.
pub const MIN_RETRY_PRIORITY_STEP: i64 = 8;

/// A reselected peer gets a normal-priority request only when its advertised
/// height is at least this far past the requested block.
pub const MIN_DISTANCE_FOR_NORMAL_PRIORITY: u64 = 128;

/// Mainnet genesis block hash, in display byte order.
pub static MAINNET_GENESIS_HASH: LazyLock<Hash256> = LazyLock::new(|| {
    hash_from_static_hex("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
});

/// The two historical coinbase transactions whose hashes were duplicated on
/// mainnet before BIP30 (blocks 91842 and 91880).
pub static ALLOWED_DUPLICATE_TRANSACTIONS: LazyLock<[Hash256; 2]> = LazyLock::new(|| {
    [
        hash_from_static_hex("d5d27987d2a3dfc724e359870c6644b40e497bdc0589a033220fe15429d88599"),
        hash_from_static_hex("e3bf3d07d4b0375638d5f1db5255fe07ba2c4cb067cd81b84ee974b6585fb468"),
    ]
});

/// Whether two inputs of one block may reference outputs of `txid`.
pub fn is_allowed_duplicate(txid: &Hash256) -> bool {
    ALLOWED_DUPLICATE_TRANSACTIONS.contains(txid)
}

fn hash_from_static_hex(s: &str) -> Hash256 {
    Hash256::from_hex(s).unwrap_or(Hash256::ZERO)
}
