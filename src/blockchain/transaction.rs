use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use super::contract::SandboxError;
use super::crypto::{verify_signature, Address, CryptoError, DigitalSignature, Wallet};
use super::hashing;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Missing receiver")]
    MissingReceiver,

    #[error("Contract already deployed at {0}")]
    AddressCollision(Address),

    #[error("Balance overflow for {0}")]
    BalanceOverflow(Address),

    #[error("Contract execution failed: {0}")]
    ContractFailed(#[from] SandboxError),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Represents a transaction in the blockchain.
///
/// The field order matches the wire schema shared with other peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender's address (hex public key, or the coinbase address)
    pub sender: Address,

    /// Receiver's address; absent for contract deployment
    pub receiver: Option<Address>,

    /// Amount being transferred
    pub amount: u64,

    /// Sender nonce, prevents replay
    pub nonce: u64,

    /// Contract code (deploy) or call payload
    pub data: Option<String>,

    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Signature over the signing payload
    pub signature: Option<DigitalSignature>,
}

impl Transaction {
    /// Creates a new unsigned transaction
    pub fn new(
        sender: Address,
        receiver: Option<Address>,
        amount: u64,
        nonce: u64,
        data: Option<String>,
    ) -> Self {
        Transaction {
            sender,
            receiver,
            amount,
            nonce,
            data,
            timestamp: Utc::now().timestamp_millis(),
            signature: None,
        }
    }

    /// Creates an unsigned value transfer
    pub fn transfer(sender: Address, receiver: Address, amount: u64, nonce: u64) -> Self {
        Self::new(sender, Some(receiver), amount, nonce, None)
    }

    /// Creates an unsigned contract deployment carrying `code`
    pub fn deploy(sender: Address, code: impl Into<String>, amount: u64, nonce: u64) -> Self {
        Self::new(sender, None, amount, nonce, Some(code.into()))
    }

    /// Creates an unsigned contract call
    pub fn call(
        sender: Address,
        contract: Address,
        payload: impl Into<String>,
        amount: u64,
        nonce: u64,
    ) -> Self {
        Self::new(sender, Some(contract), amount, nonce, Some(payload.into()))
    }

    /// Creates a new coinbase transaction (genesis funding, mining reward)
    pub fn new_coinbase(receiver: Address, amount: u64) -> Self {
        Self::new(Address::coinbase(), Some(receiver), amount, 0, None)
    }

    /// Sets an explicit timestamp; used for fixed, pre-agreed transactions.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Signs the transaction with a wallet
    ///
    /// Fails when the wallet's address is not the transaction's sender.
    pub fn sign(&mut self, wallet: &Wallet) -> Result<(), TransactionError> {
        if wallet.address() != &self.sender {
            return Err(TransactionError::InvalidSenderAddress(
                "Wallet address does not match sender address".to_string(),
            ));
        }

        self.signature = Some(wallet.sign(&self.signing_payload()));
        Ok(())
    }

    /// Verifies the transaction's signature
    ///
    /// Coinbase transactions always verify. Any malformed key or signature
    /// yields `false`.
    pub fn verify(&self) -> bool {
        if self.is_coinbase() {
            return true;
        }

        let signature = match &self.signature {
            Some(signature) => signature,
            None => return false,
        };

        let public_key = match self.sender.to_public_key() {
            Ok(key) => key,
            Err(_) => return false,
        };

        verify_signature(&self.signing_payload(), signature, &public_key).unwrap_or(false)
    }

    /// Canonical bytes covered by the signature
    pub fn signing_payload(&self) -> Vec<u8> {
        let payload = json!({
            "sender": self.sender,
            "receiver": self.receiver,
            "amount": self.amount,
            "nonce": self.nonce,
            "data": self.data,
            "timestamp": self.timestamp,
        });

        hashing::canonical_bytes(&payload)
    }

    /// Full wire form
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "sender": self.sender,
            "receiver": self.receiver,
            "amount": self.amount,
            "nonce": self.nonce,
            "data": self.data,
            "timestamp": self.timestamp,
            "signature": self.signature,
        })
    }

    /// Hash of the full wire form, signature included
    pub fn hash(&self) -> String {
        hashing::hash_value(&self.to_json())
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.sender.is_coinbase()
    }

    /// Payload if present and non-empty
    pub fn payload(&self) -> Option<&str> {
        self.data.as_deref().filter(|data| !data.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction() {
        let sender_wallet = Wallet::new();
        let recipient_wallet = Wallet::new();

        let transaction = Transaction::transfer(
            sender_wallet.address().clone(),
            recipient_wallet.address().clone(),
            10,
            1,
        );

        assert_eq!(transaction.sender, *sender_wallet.address());
        assert_eq!(transaction.receiver.as_ref(), Some(recipient_wallet.address()));
        assert_eq!(transaction.amount, 10);
        assert_eq!(transaction.nonce, 1);
        assert!(transaction.signature.is_none());
        assert!(!transaction.verify());
    }

    #[test]
    fn test_sign_transaction() {
        let sender_wallet = Wallet::new();
        let recipient_wallet = Wallet::new();

        let mut transaction = Transaction::transfer(
            sender_wallet.address().clone(),
            recipient_wallet.address().clone(),
            10,
            1,
        );

        transaction.sign(&sender_wallet).unwrap();

        assert!(transaction.signature.is_some());
        assert!(transaction.verify());
    }

    #[test]
    fn test_sign_with_wrong_wallet_fails() {
        let sender_wallet = Wallet::new();
        let other_wallet = Wallet::new();

        let mut transaction =
            Transaction::transfer(sender_wallet.address().clone(), other_wallet.address().clone(), 1, 0);

        let result = transaction.sign(&other_wallet);
        assert!(matches!(result, Err(TransactionError::InvalidSenderAddress(_))));
        assert!(transaction.signature.is_none());
    }

    #[test]
    fn test_tampered_transaction_fails_verification() {
        let sender_wallet = Wallet::new();
        let recipient_wallet = Wallet::new();

        let mut transaction = Transaction::transfer(
            sender_wallet.address().clone(),
            recipient_wallet.address().clone(),
            10,
            0,
        );
        transaction.sign(&sender_wallet).unwrap();

        let mut tampered = transaction.clone();
        tampered.amount = 1_000;
        assert!(!tampered.verify());

        let mut tampered = transaction.clone();
        tampered.data = Some("payload".to_string());
        assert!(!tampered.verify());
    }

    #[test]
    fn test_malformed_fields_verify_false() {
        let wallet = Wallet::new();
        let mut transaction = Transaction::transfer(wallet.address().clone(), Address::coinbase(), 1, 0);
        transaction.sign(&wallet).unwrap();

        let mut bad_sender = transaction.clone();
        bad_sender.sender = Address("not hex".to_string());
        assert!(!bad_sender.verify());

        let mut bad_signature = transaction.clone();
        bad_signature.signature = Some(DigitalSignature("xyz".to_string()));
        assert!(!bad_signature.verify());
    }

    #[test]
    fn test_coinbase_transaction() {
        let miner_wallet = Wallet::new();

        let transaction = Transaction::new_coinbase(miner_wallet.address().clone(), 50);

        assert!(transaction.is_coinbase());
        assert_eq!(transaction.receiver.as_ref(), Some(miner_wallet.address()));
        assert_eq!(transaction.amount, 50);
        assert!(transaction.verify());
    }

    #[test]
    fn test_signing_payload_is_canonical() {
        let transaction = Transaction::new(
            Address("aa".to_string()),
            None,
            5,
            2,
            Some("x".to_string()),
        )
        .with_timestamp(1_700_000_000_000);

        assert_eq!(
            String::from_utf8(transaction.signing_payload()).unwrap(),
            r#"{"amount": 5, "data": "x", "nonce": 2, "receiver": null, "sender": "aa", "timestamp": 1700000000000}"#
        );
    }

    #[test]
    fn test_wire_round_trip_preserves_hash() {
        let wallet = Wallet::new();
        let mut transaction = Transaction::deploy(wallet.address().clone(), "storage['x'] = 1", 0, 0);
        transaction.sign(&wallet).unwrap();

        let encoded = serde_json::to_string(&transaction).unwrap();
        let decoded: Transaction = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, transaction);
        assert_eq!(decoded.hash(), transaction.hash());
        assert!(decoded.verify());
    }
}
