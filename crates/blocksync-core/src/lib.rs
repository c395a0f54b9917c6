//! # blocksync-core
//! Protocol types, constants, errors, and the storage interfaces shared by
//! the download scheduler and the UTXO snapshot builder.

pub mod constants;
pub mod error;
pub mod memory;
pub mod merkle;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod traits;
pub mod types;
