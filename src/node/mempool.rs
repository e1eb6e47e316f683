//! Pending transaction pool.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use thiserror::Error;

use crate::blockchain::account::AccountState;
use crate::blockchain::Transaction;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Coinbase transactions are only created by miners")]
    Coinbase,

    #[error("Duplicate transaction {0}")]
    Duplicate(String),

    #[error("Mempool full ({0} transactions)")]
    Full(usize),
}

#[derive(Debug, Default)]
struct Pool {
    pending: VecDeque<Transaction>,
    seen: HashSet<String>,
}

/// FIFO pool of signed transactions waiting for a block
#[derive(Debug)]
pub struct Mempool {
    pool: Mutex<Pool>,
    max_size: usize,
}

impl Mempool {
    pub fn new(max_size: usize) -> Self {
        Mempool {
            pool: Mutex::new(Pool::default()),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a transaction, returning its hash.
    ///
    /// Only the signature is checked here; balance and nonce are checked
    /// when a block is built.
    pub fn add_transaction(&self, tx: Transaction) -> Result<String, MempoolError> {
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase);
        }
        if !tx.verify() {
            warn!("Mempool: invalid signature from {}", tx.sender.short());
            return Err(MempoolError::InvalidSignature);
        }

        let hash = tx.hash();
        let mut pool = self.lock();
        if pool.seen.contains(&hash) {
            return Err(MempoolError::Duplicate(hash));
        }
        if pool.pending.len() >= self.max_size {
            warn!("Mempool: full, rejecting {}", hash);
            return Err(MempoolError::Full(self.max_size));
        }

        debug!("Mempool: accepted {} from {}", hash, tx.sender.short());
        pool.seen.insert(hash.clone());
        pool.pending.push_back(tx);
        Ok(hash)
    }

    /// Oldest `limit` transactions; the pool keeps them until pruned
    pub fn transactions_for_block(&self, limit: usize) -> Vec<Transaction> {
        self.lock().pending.iter().take(limit).cloned().collect()
    }

    /// Removes transactions included in a committed block
    pub fn prune(&self, consumed: &[Transaction]) {
        let hashes: HashSet<String> = consumed.iter().map(Transaction::hash).collect();
        let mut pool = self.lock();
        pool.pending.retain(|tx| !hashes.contains(&tx.hash()));
        pool.seen.retain(|hash| !hashes.contains(hash));
    }

    /// Drops transactions whose nonce the committed state has already used
    pub fn prune_stale(&self, state: &AccountState) {
        let mut pool = self.lock();
        let Pool { pending, seen } = &mut *pool;
        pending.retain(|tx| {
            let fresh = tx.nonce >= state.nonce(&tx.sender);
            if !fresh {
                debug!("Mempool: dropping stale nonce {} from {}", tx.nonce, tx.sender.short());
                seen.remove(&tx.hash());
            }
            fresh
        });
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.lock().pending.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::{Address, Wallet};

    fn signed(wallet: &Wallet, nonce: u64) -> Transaction {
        let mut tx = Transaction::transfer(
            wallet.address().clone(),
            Wallet::new().address().clone(),
            1,
            nonce,
        );
        tx.sign(wallet).unwrap();
        tx
    }

    #[test]
    fn test_admission() {
        let mempool = Mempool::new(2);
        let wallet = Wallet::new();
        let tx = signed(&wallet, 0);

        assert_eq!(mempool.add_transaction(tx.clone()).unwrap(), tx.hash());
        assert!(matches!(
            mempool.add_transaction(tx),
            Err(MempoolError::Duplicate(_))
        ));

        let mut forged = signed(&wallet, 1);
        forged.amount = 1_000;
        assert_eq!(mempool.add_transaction(forged), Err(MempoolError::InvalidSignature));

        let coinbase = Transaction::new_coinbase(Address::coinbase(), 1);
        assert_eq!(mempool.add_transaction(coinbase), Err(MempoolError::Coinbase));

        mempool.add_transaction(signed(&wallet, 1)).unwrap();
        assert_eq!(
            mempool.add_transaction(signed(&wallet, 2)),
            Err(MempoolError::Full(2))
        );
    }

    #[test]
    fn test_block_selection_and_prune() {
        let mempool = Mempool::new(10);
        let wallet = Wallet::new();
        let txs: Vec<_> = (0..3).map(|nonce| signed(&wallet, nonce)).collect();
        for tx in &txs {
            mempool.add_transaction(tx.clone()).unwrap();
        }

        let selected = mempool.transactions_for_block(2);
        assert_eq!(selected, txs[..2].to_vec());
        assert_eq!(mempool.len(), 3);

        mempool.prune(&selected);
        assert_eq!(mempool.pending(), txs[2..].to_vec());

        // A pruned transaction may be submitted again.
        mempool.add_transaction(txs[0].clone()).unwrap();
        assert_eq!(mempool.len(), 2);
    }

    #[test]
    fn test_prune_stale() {
        let mempool = Mempool::new(10);
        let wallet = Wallet::new();
        let mut state = AccountState::default();
        state
            .apply_transaction(&Transaction::new_coinbase(wallet.address().clone(), 10))
            .unwrap();

        let first = signed(&wallet, 0);
        state.apply_transaction(&first).unwrap();
        mempool.add_transaction(first).unwrap();
        mempool.add_transaction(signed(&wallet, 1)).unwrap();

        mempool.prune_stale(&state);
        assert_eq!(mempool.len(), 1);
        assert_eq!(mempool.pending()[0].nonce, 1);
    }
}
