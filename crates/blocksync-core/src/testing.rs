//! Block and transaction builders for tests.

use crate::merkle::merkle_root;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// Regtest difficulty: every header carries a work of 2.
pub const REGTEST_BITS: u32 = 0x207f_ffff;

/// Coinbase paying 50 coins. `tag` distinguishes coinbases at the same
/// height on competing branches.
pub fn coinbase(height: u32, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            script_sig: vec![tag, height as u8, (height >> 8) as u8, (height >> 16) as u8],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput {
            value: 50_0000_0000,
            script_pubkey: vec![0x51, tag],
        }],
        lock_time: height,
    }
}

/// Transaction spending `inputs` into one output per entry of `values`.
pub fn spend(inputs: &[OutPoint], values: &[u64]) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .iter()
            .map(|op| TxInput {
                previous_output: *op,
                script_sig: vec![0x00],
                sequence: u32::MAX,
            })
            .collect(),
        outputs: values
            .iter()
            .map(|value| TxOutput {
                value: *value,
                script_pubkey: vec![0x76, 0xa9],
            })
            .collect(),
        lock_time: 0,
    }
}

/// Block on top of `prev_hash` with a correct merkle root.
pub fn make_block(prev_hash: Hash256, nonce: u32, txs: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: merkle_root(&txids),
            timestamp: 1_600_000_000 + nonce,
            bits: REGTEST_BITS,
            nonce,
        },
        transactions: txs,
    }
}

/// Child of `parent` at `height` holding a tagged coinbase plus `txs`.
pub fn child_block(parent: &Block, height: u32, tag: u8, txs: Vec<Transaction>) -> Block {
    let mut all = vec![coinbase(height, tag)];
    all.extend(txs);
    make_block(parent.hash(), height * 256 + tag as u32, all)
}

/// Outpoint of output `index` of `tx`.
pub fn outpoint(tx: &Transaction, index: u32) -> OutPoint {
    OutPoint::new(tx.txid(), index)
}
