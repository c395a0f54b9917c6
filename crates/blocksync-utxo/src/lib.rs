//! # blocksync-utxo
//! Builds the per-block UTXO view a validator needs, for blocks extending the
//! committed chain as well as blocks on an alternate branch.

pub mod snapshot;
pub mod undo_log;

pub use snapshot::{MutableUtxoSet, UtxoContext};
pub use undo_log::UtxoUndoLog;
