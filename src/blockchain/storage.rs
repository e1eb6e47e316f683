use std::path::Path;

use log::{debug, warn};
use sled::{Batch, Db, Tree};
use thiserror::Error;

use super::block::Block;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// Persistent block log.
///
/// Blocks are bincode-encoded and keyed by their big-endian index, so
/// iteration order is chain order. Account state is not stored; it is
/// rebuilt by replaying the blocks.
pub struct BlockchainStorage {
    db: Db,
    blocks: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

fn encode(block: &Block) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(block).map_err(|e| StorageError::SerializationError(e.to_string()))
}

impl BlockchainStorage {
    /// Opens (or creates) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;

        Ok(Self { db, blocks })
    }

    /// Saves a block and flushes it to disk
    pub fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        self.blocks.insert(block.index.to_be_bytes(), encode(block)?)?;
        self.flush()?;
        debug!("Stored block {}", block.index);
        Ok(())
    }

    /// Gets a block by its index
    pub fn get_block(&self, index: u64) -> Result<Block, StorageError> {
        match self.blocks.get(index.to_be_bytes())? {
            Some(value) => bincode::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string())),
            None => Err(StorageError::NotFound(format!("Block {} not found", index))),
        }
    }

    /// Gets all blocks in chain order
    ///
    /// An undecodable entry truncates the result: blocks after a gap cannot
    /// be replayed anyway.
    pub fn get_all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();

        for result in self.blocks.iter() {
            let (key, value) = result?;
            match bincode::deserialize::<Block>(&value) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    warn!(
                        "Stopping at undecodable block entry {:?}: {}",
                        key.as_ref(),
                        e
                    );
                    break;
                }
            }
        }

        Ok(blocks)
    }

    /// Replaces the stored chain with `blocks` in one atomic batch
    pub fn replace_all(&self, blocks: &[Block]) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for result in self.blocks.iter().keys() {
            batch.remove(result?);
        }
        for block in blocks {
            batch.insert(block.index.to_be_bytes().to_vec(), encode(block)?);
        }

        self.blocks.apply_batch(batch)?;
        self.flush()?;
        debug!("Rewrote stored chain with {} blocks", blocks.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::genesis_block;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::transaction::Transaction;

    fn next(previous: &Block) -> Block {
        let reward = Transaction::new_coinbase(Wallet::new().address().clone(), 50);
        Block::new(previous.index + 1, previous.hash.clone(), vec![reward], None)
    }

    #[test]
    fn test_save_and_load_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BlockchainStorage::new(dir.path()).unwrap();
        assert!(storage.is_empty());

        let genesis = genesis_block();
        let mut blocks = vec![genesis];
        for _ in 0..300 {
            let block = next(blocks.last().unwrap());
            blocks.push(block);
        }
        // Out-of-order writes still load in index order.
        for block in blocks.iter().rev() {
            storage.save_block(block).unwrap();
        }

        assert_eq!(storage.len(), blocks.len());
        assert_eq!(storage.get_all_blocks().unwrap(), blocks);
        assert_eq!(storage.get_block(1).unwrap(), blocks[1]);
        assert!(matches!(storage.get_block(999), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_replace_all() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BlockchainStorage::new(dir.path()).unwrap();

        let genesis = genesis_block();
        let first = next(&genesis);
        let second = next(&first);
        for block in [&genesis, &first, &second] {
            storage.save_block(block).unwrap();
        }

        let fork = vec![genesis.clone(), next(&genesis)];
        storage.replace_all(&fork).unwrap();
        assert_eq!(storage.get_all_blocks().unwrap(), fork);
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let genesis = genesis_block();
        {
            let storage = BlockchainStorage::new(dir.path()).unwrap();
            storage.save_block(&genesis).unwrap();
        }

        let storage = BlockchainStorage::new(dir.path()).unwrap();
        assert_eq!(storage.get_all_blocks().unwrap(), vec![genesis]);
    }
}
