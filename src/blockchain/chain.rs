use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use log::{info, warn};
use thiserror::Error;

use super::account::{Account, AccountState};
use super::block::{genesis_block, Block};
use super::consensus::meets_difficulty;
use super::contract::Sandbox;
use super::crypto::Address;
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::TransactionError;
use crate::config::{ChainConfig, LedgerConfig};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Block {got} rejected: expected index {expected}")]
    InvalidIndex { expected: u64, got: u64 },

    #[error("Block {index} rejected: previous hash does not match the tip")]
    InvalidPreviousHash { index: u64 },

    #[error("Block {index} rejected: hash does not match header")]
    InvalidHash { index: u64 },

    #[error("Block {index} rejected: hash does not meet difficulty {difficulty}")]
    InsufficientDifficulty { index: u64, difficulty: u32 },

    #[error("Block {index} rejected: difficulty {difficulty} is below the minimum {minimum}")]
    BelowMinimumDifficulty {
        index: u64,
        difficulty: u32,
        minimum: u32,
    },

    #[error("Block {index} rejected: merkle root does not match transactions")]
    InvalidMerkleRoot { index: u64 },

    #[error("Block {index} rejected: {reason}")]
    InvalidCoinbase { index: u64, reason: String },

    #[error("Block {index} rejected: transaction {position} failed: {source}")]
    RejectedTransaction {
        index: u64,
        position: usize,
        source: TransactionError,
    },

    #[error("Chain rejected: genesis block differs from ours")]
    InvalidGenesis,

    #[error("Chain rejected: length {candidate} is not longer than {current}")]
    ChainNotLonger { candidate: usize, current: usize },

    #[error("Chain rejected: no blocks")]
    EmptyChain,

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// Committed chain and the state derived from it; always replaced together
#[derive(Debug)]
struct Ledger {
    chain: Vec<Block>,
    state: AccountState,
}

/// The chain of blocks and its account state.
///
/// Readers take a short read lock and only ever see fully committed blocks.
/// Writers (`add_block`, `replace_chain`) are serialized by `commit_lock`,
/// validate against a private snapshot without holding the ledger lock,
/// and publish by a single swap. Clones share the same ledger.
#[derive(Debug, Clone)]
pub struct Blockchain {
    ledger: Arc<RwLock<Ledger>>,

    /// Held for the whole of every mutation
    commit_lock: Arc<Mutex<()>>,

    rules: ChainConfig,

    sandbox: Sandbox,

    /// Storage for blockchain data
    storage: Option<Arc<BlockchainStorage>>,
}

impl Blockchain {
    /// Creates an in-memory blockchain holding only the genesis block
    pub fn new(config: &LedgerConfig) -> Result<Self, BlockchainError> {
        let sandbox = Sandbox::new(config.sandbox_limits());
        let genesis = genesis_block();
        let state = genesis_state(&genesis, &sandbox)?;

        Ok(Blockchain {
            ledger: Arc::new(RwLock::new(Ledger {
                chain: vec![genesis],
                state,
            })),
            commit_lock: Arc::new(Mutex::new(())),
            rules: config.chain.clone(),
            sandbox,
            storage: None,
        })
    }

    /// Opens a blockchain persisted at `storage_path`
    ///
    /// Stored blocks are replayed from genesis; an empty store is seeded
    /// with the genesis block.
    pub fn with_storage<P: AsRef<Path>>(
        storage_path: P,
        config: &LedgerConfig,
    ) -> Result<Self, BlockchainError> {
        let storage = BlockchainStorage::new(storage_path)?;
        let mut blockchain = Self::new(config)?;

        let blocks = storage.get_all_blocks()?;
        if blocks.is_empty() {
            info!("No existing blockchain found in storage, storing genesis block");
            storage.save_block(&genesis_block())?;
        } else {
            let state = blockchain.validate_chain(&blocks)?;
            info!("Loaded {} blocks from storage", blocks.len());
            blockchain.ledger = Arc::new(RwLock::new(Ledger {
                chain: blocks,
                state,
            }));
        }

        blockchain.storage = Some(Arc::new(storage));
        Ok(blockchain)
    }

    fn read(&self) -> RwLockReadGuard<'_, Ledger> {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, chain: Option<Vec<Block>>, block: Option<Block>, state: AccountState) {
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(chain) = chain {
            ledger.chain = chain;
        }
        if let Some(block) = block {
            ledger.chain.push(block);
        }
        ledger.state = state;
    }

    /// Validates `block` against the tip and appends it.
    ///
    /// All-or-nothing: on any error neither the chain nor the state change.
    pub fn add_block(&self, block: Block) -> Result<(), BlockchainError> {
        let _commit = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (tip, mut state) = self.tip_and_snapshot();
        if let Err(e) = validate_block(&block, &tip, &mut state, &self.rules) {
            warn!("{}", e);
            return Err(e);
        }

        if let Some(storage) = &self.storage {
            storage.save_block(&block)?;
        }

        info!(
            "Block {} added with {} transactions ({})",
            block.index,
            block.transactions.len(),
            block.hash
        );
        self.publish(None, Some(block), state);
        Ok(())
    }

    /// Replays a candidate chain from genesis against a fresh state and
    /// returns the resulting state.
    pub fn validate_chain(&self, blocks: &[Block]) -> Result<AccountState, BlockchainError> {
        let genesis = blocks.first().ok_or(BlockchainError::EmptyChain)?;
        if *genesis != genesis_block() {
            return Err(BlockchainError::InvalidGenesis);
        }

        let mut state = genesis_state(genesis, &self.sandbox)?;
        for pair in blocks.windows(2) {
            validate_block(&pair[1], &pair[0], &mut state, &self.rules)?;
        }
        Ok(state)
    }

    /// Longest-valid-chain rule: adopts `blocks` only if strictly longer
    /// than the current chain and valid from genesis.
    pub fn replace_chain(&self, blocks: Vec<Block>) -> Result<(), BlockchainError> {
        let _commit = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.height();
        if blocks.len() <= current {
            let e = BlockchainError::ChainNotLonger {
                candidate: blocks.len(),
                current,
            };
            warn!("{}", e);
            return Err(e);
        }

        let state = match self.validate_chain(&blocks) {
            Ok(state) => state,
            Err(e) => {
                warn!("Received chain failed validation: {}", e);
                return Err(e);
            }
        };

        if let Some(storage) = &self.storage {
            storage.replace_all(&blocks)?;
        }

        info!("Replacing chain: {} -> {} blocks", current, blocks.len());
        self.publish(Some(blocks), None, state);
        Ok(())
    }

    /// Number of blocks in the chain
    pub fn height(&self) -> usize {
        self.read().chain.len()
    }

    /// Gets the last block in the chain
    pub fn last_block(&self) -> Block {
        let ledger = self.read();
        match ledger.chain.last() {
            Some(block) => block.clone(),
            None => genesis_block(),
        }
    }

    /// Gets the entire blockchain
    pub fn get_chain(&self) -> Vec<Block> {
        self.read().chain.clone()
    }

    /// Copy of the committed account state
    pub fn state_snapshot(&self) -> AccountState {
        self.read().state.snapshot()
    }

    /// Tip and state read under one lock, so they always belong together
    pub fn tip_and_snapshot(&self) -> (Block, AccountState) {
        let ledger = self.read();
        let tip = match ledger.chain.last() {
            Some(block) => block.clone(),
            None => genesis_block(),
        };
        (tip, ledger.state.snapshot())
    }

    pub fn get_account(&self, address: &Address) -> Account {
        self.read().state.get_account(address)
    }

    pub fn rules(&self) -> &ChainConfig {
        &self.rules
    }
}

fn genesis_state(genesis: &Block, sandbox: &Sandbox) -> Result<AccountState, BlockchainError> {
    let mut state = AccountState::new(sandbox.clone());
    apply_transactions(genesis, &mut state)?;
    Ok(state)
}

fn apply_transactions(block: &Block, state: &mut AccountState) -> Result<(), BlockchainError> {
    for (position, tx) in block.transactions.iter().enumerate() {
        state
            .apply_transaction(tx)
            .map_err(|source| BlockchainError::RejectedTransaction {
                index: block.index,
                position,
                source,
            })?;
    }
    Ok(())
}

/// Checks `block` as the successor of `previous` and applies its
/// transactions to `state`. `state` is garbage on error.
fn validate_block(
    block: &Block,
    previous: &Block,
    state: &mut AccountState,
    rules: &ChainConfig,
) -> Result<(), BlockchainError> {
    let index = block.index;

    let expected = previous.index + 1;
    if index != expected {
        return Err(BlockchainError::InvalidIndex {
            expected,
            got: index,
        });
    }
    if block.previous_hash != previous.hash {
        return Err(BlockchainError::InvalidPreviousHash { index });
    }
    if block.hash != block.calculate_hash() {
        return Err(BlockchainError::InvalidHash { index });
    }

    let difficulty = block.difficulty.unwrap_or(0);
    if !meets_difficulty(&block.hash, difficulty) {
        return Err(BlockchainError::InsufficientDifficulty { index, difficulty });
    }
    if difficulty < rules.min_difficulty {
        return Err(BlockchainError::BelowMinimumDifficulty {
            index,
            difficulty,
            minimum: rules.min_difficulty,
        });
    }
    if block.merkle_root != Block::compute_merkle_root(&block.transactions) {
        return Err(BlockchainError::InvalidMerkleRoot { index });
    }

    let mut coinbases = block.transactions.iter().filter(|tx| tx.is_coinbase());
    if let Some(reward) = coinbases.next() {
        if coinbases.next().is_some() {
            return Err(BlockchainError::InvalidCoinbase {
                index,
                reason: "more than one coinbase transaction".to_string(),
            });
        }
        if reward.amount > rules.mining_reward {
            return Err(BlockchainError::InvalidCoinbase {
                index,
                reason: format!(
                    "coinbase amount {} exceeds reward {}",
                    reward.amount, rules.mining_reward
                ),
            });
        }
    }

    apply_transactions(block, state)
}
