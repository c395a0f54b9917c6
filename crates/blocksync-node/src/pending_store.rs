//! RocksDB-backed staging area for downloaded blocks.
//!
//! Blocks are bincode-encoded and keyed by their 32-byte header hash in the
//! `pending_blocks` column family. The height hint passed to
//! [`PendingBlockStore::get`] is not needed for a hash-keyed lookup and is
//! ignored.

use std::path::Path;

use blocksync_core::error::StorageError;
use blocksync_core::traits::PendingBlockStore;
use blocksync_core::types::{Block, Hash256};
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, DB, Options};
use tracing::{debug, trace};

// --- Column family names ---

const CF_PENDING_BLOCKS: &str = "pending_blocks";

const ALL_CFS: &[&str] = &[CF_PENDING_BLOCKS];

pub struct RocksPendingBlockStore {
    db: DB,
    /// Makes the exists-then-put in [`store`](PendingBlockStore::store) atomic
    /// with respect to concurrent completions of the same block.
    write_lock: Mutex<()>,
}

impl RocksPendingBlockStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        debug!(path = %path.as_ref().display(), "pending: store opened");

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Number of staged blocks. Walks the column family.
    pub fn count(&self) -> Result<usize, StorageError> {
        let cf = self.cf_handle(CF_PENDING_BLOCKS)?;
        let mut n = 0;
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            item.map_err(|e| StorageError::Backend(e.to_string()))?;
            n += 1;
        }
        Ok(n)
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Backend(format!("missing column family: {name}")))
    }
}

impl PendingBlockStore for RocksPendingBlockStore {
    fn exists(&self, hash: &Hash256) -> Result<bool, StorageError> {
        let cf = self.cf_handle(CF_PENDING_BLOCKS)?;
        Ok(self
            .db
            .get_pinned_cf(cf, hash.as_bytes())
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .is_some())
    }

    fn store(&self, block: &Block) -> Result<bool, StorageError> {
        let hash = block.hash();
        let bytes = bincode::encode_to_vec(block, bincode::config::standard())
            .map_err(|e| StorageError::Codec(e.to_string()))?;

        let _guard = self.write_lock.lock();
        if self.exists(&hash)? {
            trace!(%hash, "pending: block already staged");
            return Ok(false);
        }
        let cf = self.cf_handle(CF_PENDING_BLOCKS)?;
        self.db
            .put_cf(cf, hash.as_bytes(), bytes)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(true)
    }

    fn get(&self, hash: &Hash256, _height: Option<u64>) -> Result<Option<Block>, StorageError> {
        let cf = self.cf_handle(CF_PENDING_BLOCKS)?;
        let Some(bytes) = self
            .db
            .get_pinned_cf(cf, hash.as_bytes())
            .map_err(|e| StorageError::Backend(e.to_string()))?
        else {
            return Ok(None);
        };
        let (block, _): (Block, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(Some(block))
    }
}
