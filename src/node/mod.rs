//! Node: ties the chain, the mempool and the miner together.
//!
//! All bookkeeping that spans components (pending nonces, the reward
//! address) is owned here rather than in globals.

pub mod mempool;
pub mod network;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::blockchain::chain::BlockchainError;
use crate::blockchain::consensus::{self, MiningError};
use crate::blockchain::{Address, Block, Blockchain, Transaction, Wallet};
use crate::config::{ConfigError, LedgerConfig};
use mempool::{Mempool, MempoolError};
use network::{ChainPayload, Message, PeerInfo};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Blockchain(#[from] BlockchainError),

    #[error(transparent)]
    Mining(#[from] MiningError),

    #[error(transparent)]
    Mempool(#[from] MempoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid beneficiary address: {0}")]
    InvalidBeneficiary(String),
}

#[derive(Debug)]
pub struct Node {
    chain: Blockchain,
    mempool: Mempool,
    /// Next nonce to hand out per sender, ahead of the committed state
    pending_nonces: DashMap<Address, u64>,
    beneficiary: Address,
    config: LedgerConfig,
}

impl Node {
    pub fn new(config: LedgerConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let chain = match &config.storage.path {
            Some(path) => Blockchain::with_storage(path, &config)?,
            None => Blockchain::new(&config)?,
        };

        let beneficiary = match &config.miner.beneficiary {
            Some(hex) => hex
                .parse::<Address>()
                .map_err(|e| NodeError::InvalidBeneficiary(e.to_string()))?,
            None => {
                let address = Wallet::new().address().clone();
                info!("No beneficiary configured, rewarding fresh address {}", address);
                address
            }
        };

        Ok(Node {
            chain,
            mempool: Mempool::new(config.mempool.max_size),
            pending_nonces: DashMap::new(),
            beneficiary,
            config,
        })
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn beneficiary(&self) -> &Address {
        &self.beneficiary
    }

    /// Nonce the next transaction from `address` should carry, counting
    /// transactions still waiting in the mempool
    pub fn next_nonce(&self, address: &Address) -> u64 {
        let committed = self.chain.get_account(address).nonce;
        self.pending_nonces
            .get(address)
            .map_or(committed, |pending| (*pending).max(committed))
    }

    pub fn submit_transaction(&self, tx: Transaction) -> Result<String, NodeError> {
        let sender = tx.sender.clone();
        let nonce = tx.nonce;
        let hash = self.mempool.add_transaction(tx)?;

        let mut pending = self.pending_nonces.entry(sender).or_insert(0);
        *pending = (*pending).max(nonce.saturating_add(1));
        Ok(hash)
    }

    /// Candidate for the next height: the reward followed by every mempool
    /// transaction that applies cleanly, in arrival order.
    ///
    /// Transactions that fail to apply are dropped from the mempool; they
    /// are never retried.
    pub fn build_block_template(&self) -> Block {
        let (tip, mut state) = self.chain.tip_and_snapshot();

        let reward = Transaction::new_coinbase(self.beneficiary.clone(), self.config.chain.mining_reward);
        let mut transactions = Vec::new();
        match state.apply_transaction(&reward) {
            Ok(_) => transactions.push(reward),
            Err(e) => warn!("Skipping mining reward: {}", e),
        }

        let mut rejected = Vec::new();
        for tx in self.mempool.transactions_for_block(self.config.miner.max_txs_per_block) {
            match state.apply_transaction(&tx) {
                Ok(_) => transactions.push(tx),
                Err(e) => {
                    debug!("Dropping {} from block {}: {}", tx.hash(), tip.index + 1, e);
                    rejected.push(tx);
                }
            }
        }

        if !rejected.is_empty() {
            self.mempool.prune(&rejected);
            self.reconcile_nonces();
        }

        Block::new(tip.index + 1, tip.hash, transactions, None)
    }

    /// Mines a block on the current tip and commits it.
    ///
    /// The nonce search runs without holding any chain lock; if another
    /// block wins the height meanwhile, `add_block` rejects this one.
    pub fn mine_next_block(&self, cancel: Option<&AtomicBool>) -> Result<Block, NodeError> {
        let template = self.build_block_template();
        let block = consensus::mine(
            &template,
            self.config.chain.difficulty,
            &self.config.mining_options(),
            cancel,
        )?;

        self.chain.add_block(block.clone())?;
        self.after_commit(&block.transactions);
        Ok(block)
    }

    /// Mines on a blocking Tokio thread until done or `cancel` is set
    pub fn spawn_miner(
        self: &Arc<Self>,
        cancel: Arc<AtomicBool>,
    ) -> JoinHandle<Result<Block, NodeError>> {
        let node = Arc::clone(self);
        tokio::task::spawn_blocking(move || node.mine_next_block(Some(&cancel)))
    }

    fn after_commit(&self, consumed: &[Transaction]) {
        self.mempool.prune(consumed);
        self.mempool.prune_stale(&self.chain.state_snapshot());
        self.reconcile_nonces();
    }

    /// Rebuilds the pending nonces from what is still in the mempool;
    /// `next_nonce` falls back to the committed nonce for everyone else
    fn reconcile_nonces(&self) {
        let mut expected: HashMap<Address, u64> = HashMap::new();
        for tx in self.mempool.pending() {
            let next = expected.entry(tx.sender.clone()).or_insert(0);
            *next = (*next).max(tx.nonce.saturating_add(1));
        }

        self.pending_nonces
            .retain(|address, _| expected.contains_key(address));
        for (address, next) in expected {
            self.pending_nonces.insert(address, next);
        }
    }

    /// Processes one raw peer message and returns the reply to send back,
    /// if any. Malformed or rejected input is logged and dropped.
    pub fn handle_message(&self, raw: &str) -> Option<Message> {
        let message = match Message::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                return None;
            }
        };

        match message {
            Message::Register(peer) => {
                info!("Peer registered (port {:?})", peer.port);
                None
            }
            Message::Tx(tx) => {
                if let Err(e) = self.submit_transaction(tx) {
                    warn!("Rejected peer transaction: {}", e);
                }
                None
            }
            Message::Block(block) => {
                let tip = self.chain.last_block();
                if block.index > tip.index + 1 {
                    info!(
                        "Block {} is ahead of our tip {}, requesting chain",
                        block.index, tip.index
                    );
                    return Some(Message::RequestChain(PeerInfo::default()));
                }

                let transactions = block.transactions.clone();
                match self.chain.add_block(block) {
                    Ok(()) => self.after_commit(&transactions),
                    Err(e) => warn!("Rejected peer block: {}", e),
                }
                None
            }
            Message::RequestChain(_) => Some(Message::Chain(ChainPayload::Blocks(self.chain.get_chain()))),
            Message::Chain(payload) => {
                match self.chain.replace_chain(payload.into_blocks()) {
                    Ok(()) => self.after_commit(&[]),
                    Err(e) => debug!("Kept local chain: {}", e),
                }
                None
            }
        }
    }
}
