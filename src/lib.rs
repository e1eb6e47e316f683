//! A small account-based proof-of-work ledger with sandboxed contracts.

pub mod blockchain;
pub mod config;
pub mod node;
