use chrono::Utc;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::crypto::{Address, Wallet};
use super::hashing;
use super::transaction::Transaction;

/// Genesis timestamp: 2024-01-01T00:00:00Z in milliseconds
pub const GENESIS_TIMESTAMP: i64 = 1_704_067_200_000;

/// Sentinel `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Funds minted to the treasury in the genesis block
pub const TREASURY_BALANCE: u64 = 10_000_000;

/// Published educational key owning the genesis treasury. Never use it for
/// anything that matters.
const TREASURY_SECRET_KEY: [u8; 32] = [
    0xb7, 0x05, 0xc5, 0xf5, 0x6f, 0x21, 0x8a, 0x20, 0x03, 0xf9, 0x40, 0xf3, 0xd7, 0xd8, 0x25, 0xee,
    0x73, 0x69, 0xc5, 0x04, 0xba, 0x3a, 0xd5, 0xfd, 0xa8, 0xa2, 0x30, 0x3f, 0x4b, 0x3c, 0x5e, 0x26,
];

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Merkle root over the transactions; absent for an empty block
    pub merkle_root: Option<String>,

    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Declared number of leading zero hex characters in `hash`
    pub difficulty: Option<u32>,

    /// Proof of work
    pub nonce: u64,

    /// List of transactions included in this block
    pub transactions: Vec<Transaction>,

    /// Hash of the header
    pub hash: String,
}

impl Block {
    /// Creates a new block with nonce zero and its header hash filled in
    pub fn new(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        difficulty: Option<u32>,
    ) -> Self {
        Self::with_timestamp(
            index,
            previous_hash,
            transactions,
            Utc::now().timestamp_millis(),
            difficulty,
        )
    }

    /// Creates a block with an explicit timestamp
    pub fn with_timestamp(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        timestamp: i64,
        difficulty: Option<u32>,
    ) -> Self {
        let merkle_root = Self::compute_merkle_root(&transactions);

        let block = Block {
            index,
            previous_hash,
            merkle_root,
            timestamp,
            difficulty,
            nonce: 0,
            transactions,
            hash: String::new(),
        };

        let hash = block.calculate_hash();

        Block { hash, ..block }
    }

    /// Header fields: everything but `transactions` and `hash`
    pub fn header(&self) -> serde_json::Value {
        json!({
            "index": self.index,
            "previous_hash": self.previous_hash,
            "merkle_root": self.merkle_root,
            "timestamp": self.timestamp,
            "difficulty": self.difficulty,
            "nonce": self.nonce,
        })
    }

    /// Calculates the SHA-256 hash of the canonical header
    pub fn calculate_hash(&self) -> String {
        hashing::hash_value(&self.header())
    }

    /// Merkle root over the canonical serialization of each transaction
    pub fn compute_merkle_root(transactions: &[Transaction]) -> Option<String> {
        hashing::merkle_root(transactions.iter().map(Transaction::hash).collect())
    }

    /// Full wire form: header fields, transactions and hash
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = self.header();
        if let Some(fields) = value.as_object_mut() {
            fields.insert(
                "transactions".to_string(),
                self.transactions.iter().map(Transaction::to_json).collect(),
            );
            fields.insert("hash".to_string(), json!(self.hash));
        }
        value
    }
}

/// Wallet owning the genesis treasury
pub fn treasury_wallet() -> Wallet {
    Wallet::from_signing_key(SigningKey::from_bytes(&TREASURY_SECRET_KEY))
}

/// Address credited by the genesis block
pub fn treasury_address() -> Address {
    treasury_wallet().address().clone()
}

/// Builds the fixed genesis block every node agrees on
pub fn genesis_block() -> Block {
    let funding = Transaction::new_coinbase(treasury_address(), TREASURY_BALANCE)
        .with_timestamp(GENESIS_TIMESTAMP);

    Block::with_timestamp(
        0,
        GENESIS_PREVIOUS_HASH.to_string(),
        vec![funding],
        GENESIS_TIMESTAMP,
        None,
    )
}
