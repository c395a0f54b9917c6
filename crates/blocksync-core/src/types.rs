//! Core protocol types: transactions, blocks, unspent outputs.
//!
//! Transaction and header hashes are double SHA-256 over the Bitcoin
//! consensus byte layout. Values are in satoshis.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Double SHA-256 of arbitrary bytes.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// A 32-byte hash value.
///
/// Used for transaction ids, block header hashes, and merkle roots.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used for coinbase previous outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string. Returns `None` on bad length or digits.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction id containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Unlocking script. Arbitrary data for coinbase inputs.
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

/// A transaction output, creating a new spendable coin.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: u64,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
}

/// A transaction transferring value between scripts.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: u32,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Consensus serialization: version, inputs, outputs, lock time, with
    /// compact-size length prefixes.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(64 * (self.inputs.len() + self.outputs.len()) + 16);
        data.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(&mut data, self.inputs.len() as u64);
        for input in &self.inputs {
            data.extend_from_slice(input.previous_output.txid.as_bytes());
            data.extend_from_slice(&input.previous_output.index.to_le_bytes());
            write_compact_size(&mut data, input.script_sig.len() as u64);
            data.extend_from_slice(&input.script_sig);
            data.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_compact_size(&mut data, self.outputs.len() as u64);
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_le_bytes());
            write_compact_size(&mut data, output.script_pubkey.len() as u64);
            data.extend_from_slice(&output.script_pubkey);
        }
        data.extend_from_slice(&self.lock_time.to_le_bytes());
        data
    }

    /// Transaction id: double SHA-256 of the consensus serialization.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode())
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Outpoints of every output this transaction creates, in index order.
    pub fn output_points(&self) -> impl Iterator<Item = OutPoint> + '_ {
        let txid = self.txid();
        (0..self.outputs.len() as u32).map(move |index| OutPoint::new(txid, index))
    }
}

fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Block header containing the proof-of-work puzzle.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// Merkle root of the block's transaction ids.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u32,
    /// Compact difficulty target.
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialized header size in bytes.
    pub const SIZE: usize = 80;

    /// Compute the block header hash (double SHA-256 over the 80-byte layout).
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.bits.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        sha256d(&data)
    }

    /// Approximate proof-of-work represented by `bits`.
    ///
    /// Computed as `2^24 / mantissa` scaled by the target's leading zero
    /// bytes, which tracks `2^256 / (target + 1)` closely enough to order
    /// chains while staying within `u128`. Difficulty-1 headers yield `2^32`.
    pub fn work(&self) -> ChainWork {
        let exponent = self.bits >> 24;
        let mantissa = (self.bits & 0x007f_ffff) as u128;
        if mantissa == 0 {
            return 0;
        }
        let shift = 8 * 32u32.saturating_sub(exponent).min(12);
        ((1u128 << 24) / mantissa).max(1) << shift
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// Ordered list of transactions. First transaction must be coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Hash of the block header.
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Get the coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Transaction ids in block order.
    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Whether a transaction with the given id is part of this block.
    pub fn has_transaction(&self, txid: &Hash256) -> bool {
        self.transactions.iter().any(|tx| tx.txid() == *txid)
    }
}

/// An output as recorded in the UTXO set.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UnspentOutput {
    pub output: TxOutput,
    /// Height of the block containing the output, when the store knows it.
    pub block_height: Option<u64>,
    /// Whether this output is from a coinbase transaction.
    pub is_coinbase: bool,
}

impl UnspentOutput {
    pub fn new(output: TxOutput, block_height: u64, is_coinbase: bool) -> Self {
        Self {
            output,
            block_height: Some(block_height),
            is_coinbase,
        }
    }
}

/// Cumulative proof-of-work up to and including a block.
pub type ChainWork = u128;

/// Storage-assigned identifier of an indexed block header.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a maximal run of blocks sharing ancestry.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct SegmentId(pub u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment-{}", self.0)
    }
}
