// Ledger core
//
// - hashing: canonical serialization, SHA-256, Merkle roots
// - crypto: addresses, signatures, wallets
// - transaction / block: the signed records and their container
// - contract: the sandbox contracts run in
// - account: account state and the transition function
// - consensus: proof of work
// - chain: validation, commit and chain selection
// - storage: sled-backed block log

pub mod account;
pub mod block;
pub mod chain;
pub mod consensus;
pub mod contract;
pub mod crypto;
pub mod hashing;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use account::{Account, AccountState, ApplyOutcome};
pub use block::Block;
pub use chain::{Blockchain, BlockchainError};
pub use crypto::{Address, DigitalSignature, Wallet};
pub use transaction::{Transaction, TransactionError};
