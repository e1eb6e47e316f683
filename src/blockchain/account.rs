use log::debug;
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use super::contract::{CallContext, Sandbox, SandboxError, Storage};
use super::crypto::Address;
use super::hashing;
use super::transaction::{Transaction, TransactionError};

/// Hex characters kept from the hash when deriving a contract address.
const CONTRACT_ADDRESS_LEN: usize = 40;

/// Represents an account in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// The account's address
    pub address: Address,

    /// The account's balance
    pub balance: u64,

    /// Number of transactions applied from this account
    pub nonce: u64,

    /// Contract source, present only for contract accounts
    pub code: Option<String>,

    /// Contract storage
    pub storage: Storage,
}

impl Account {
    /// Creates an empty account
    pub fn new(address: Address) -> Self {
        Account {
            address,
            balance: 0,
            nonce: 0,
            code: None,
            storage: Storage::new(),
        }
    }

    /// Checks if the account carries contract code
    pub fn is_contract(&self) -> bool {
        self.code.is_some()
    }

    fn credit(&mut self, amount: u64) -> Result<(), TransactionError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| TransactionError::BalanceOverflow(self.address.clone()))?;
        Ok(())
    }
}

/// Result of a successfully applied transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Coinbase credit
    Credited,
    /// Plain value transfer
    Transferred,
    /// Contract created at the given address
    Deployed(Address),
    /// Contract executed and its storage committed
    Called,
}

/// Prior versions of the accounts a transaction touched; `None` means the
/// account did not exist.
type Journal = Vec<(Address, Option<Account>)>;

/// Derives the address of a contract deployed by `sender` with `nonce`
pub fn derive_contract_address(sender: &Address, nonce: u64) -> Address {
    let digest = hashing::sha256_hex(format!("{}{}", sender, nonce).as_bytes());
    Address(digest[..CONTRACT_ADDRESS_LEN].to_string())
}

/// Manages the state of all accounts in the ledger
///
/// Cloning produces an independent deep snapshot.
#[derive(Debug, Clone, Default)]
pub struct AccountState {
    accounts: BTreeMap<Address, Account>,
    sandbox: Sandbox,
}

impl AccountState {
    /// Creates an empty state whose contracts run in `sandbox`
    pub fn new(sandbox: Sandbox) -> Self {
        AccountState {
            accounts: BTreeMap::new(),
            sandbox,
        }
    }

    /// Gets an account by address, or an empty one if it was never touched
    pub fn get_account(&self, address: &Address) -> Account {
        self.accounts
            .get(address)
            .cloned()
            .unwrap_or_else(|| Account::new(address.clone()))
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.accounts.get(address).map_or(0, |account| account.balance)
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.accounts.get(address).map_or(0, |account| account.nonce)
    }

    /// Gets all accounts, ordered by address
    pub fn get_all_accounts(&self) -> Vec<Account> {
        self.accounts.values().cloned().collect()
    }

    /// Independent copy used to validate candidate blocks
    pub fn snapshot(&self) -> AccountState {
        self.clone()
    }

    fn account_mut(&mut self, address: &Address) -> &mut Account {
        self.accounts
            .entry(address.clone())
            .or_insert_with(|| Account::new(address.clone()))
    }

    fn record(&self, journal: &mut Journal, address: &Address) {
        journal.push((address.clone(), self.accounts.get(address).cloned()));
    }

    fn rollback(&mut self, journal: Journal) {
        for (address, previous) in journal.into_iter().rev() {
            match previous {
                Some(account) => {
                    self.accounts.insert(address, account);
                }
                None => {
                    self.accounts.remove(&address);
                }
            }
        }
    }

    /// Applies a transaction to the state
    ///
    /// Either every effect of the transaction is applied or, on error, the
    /// state is left exactly as it was.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<ApplyOutcome, TransactionError> {
        if tx.is_coinbase() {
            let receiver = tx.receiver.as_ref().ok_or(TransactionError::MissingReceiver)?;
            self.account_mut(receiver).credit(tx.amount)?;
            return Ok(ApplyOutcome::Credited);
        }

        if !tx.verify() {
            return Err(TransactionError::InvalidSignature);
        }

        let sender = self.get_account(&tx.sender);
        if sender.balance < tx.amount {
            return Err(TransactionError::InsufficientFunds {
                required: tx.amount,
                available: sender.balance,
            });
        }
        if sender.nonce != tx.nonce {
            return Err(TransactionError::InvalidNonce {
                expected: sender.nonce,
                got: tx.nonce,
            });
        }

        let mut journal = Journal::new();
        self.record(&mut journal, &tx.sender);
        let debited = self.account_mut(&tx.sender);
        debited.balance -= tx.amount;
        debited.nonce += 1;

        match self.dispatch(tx, &mut journal) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.rollback(journal);
                Err(e)
            }
        }
    }

    fn dispatch(
        &mut self,
        tx: &Transaction,
        journal: &mut Journal,
    ) -> Result<ApplyOutcome, TransactionError> {
        match (&tx.receiver, tx.payload()) {
            (None, Some(code)) => self.deploy(tx, code, journal),
            (None, None) => Err(TransactionError::MissingReceiver),
            (Some(receiver), Some(payload))
                if self.accounts.get(receiver).map_or(false, Account::is_contract) =>
            {
                self.call(tx, receiver, payload, journal)
            }
            (Some(receiver), _) => {
                self.record(journal, receiver);
                self.account_mut(receiver).credit(tx.amount)?;
                Ok(ApplyOutcome::Transferred)
            }
        }
    }

    fn deploy(
        &mut self,
        tx: &Transaction,
        code: &str,
        journal: &mut Journal,
    ) -> Result<ApplyOutcome, TransactionError> {
        let address = derive_contract_address(&tx.sender, tx.nonce);
        if self
            .accounts
            .get(&address)
            .map_or(false, |account| account.code.as_deref().map_or(false, |c| !c.is_empty()))
        {
            return Err(TransactionError::AddressCollision(address));
        }

        self.record(journal, &address);
        let contract = self.account_mut(&address);
        contract.credit(tx.amount)?;
        contract.code = Some(code.to_string());
        contract.storage = Storage::new();

        debug!("Deployed contract {} from {}", address, tx.sender.short());
        Ok(ApplyOutcome::Deployed(address))
    }

    fn call(
        &mut self,
        tx: &Transaction,
        receiver: &Address,
        payload: &str,
        journal: &mut Journal,
    ) -> Result<ApplyOutcome, TransactionError> {
        self.record(journal, receiver);
        let contract = self.account_mut(receiver);
        contract.credit(tx.amount)?;
        let code = contract.code.clone().ok_or(SandboxError::MissingCode)?;
        let storage = contract.storage.clone();

        let context = CallContext {
            sender: tx.sender.clone(),
            payload: Some(payload.to_string()),
            amount: tx.amount,
        };
        let updated = self.sandbox.execute(&code, &storage, &context)?;

        self.account_mut(receiver).storage = updated;
        Ok(ApplyOutcome::Called)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;
    use serde_json::json;

    const COUNTER: &str = "storage['counter'] = storage.get('counter', 0) + 1\n";

    fn funded(state: &mut AccountState, amount: u64) -> Wallet {
        let wallet = Wallet::new();
        let coinbase = Transaction::new_coinbase(wallet.address().clone(), amount);
        assert_eq!(state.apply_transaction(&coinbase).unwrap(), ApplyOutcome::Credited);
        wallet
    }

    fn signed(wallet: &Wallet, mut tx: Transaction) -> Transaction {
        tx.sign(wallet).unwrap();
        tx
    }

    #[test]
    fn test_account_creation() {
        let address = Address("ab".repeat(32));
        let account = AccountState::default().get_account(&address);

        assert_eq!(account.address, address);
        assert_eq!(account.balance, 0);
        assert_eq!(account.nonce, 0);
        assert!(!account.is_contract());
    }

    #[test]
    fn test_transfer() {
        let mut state = AccountState::default();
        let sender = funded(&mut state, 100);
        let recipient = Wallet::new();

        let tx = signed(
            &sender,
            Transaction::transfer(sender.address().clone(), recipient.address().clone(), 40, 0),
        );
        assert_eq!(state.apply_transaction(&tx).unwrap(), ApplyOutcome::Transferred);

        assert_eq!(state.balance(sender.address()), 60);
        assert_eq!(state.nonce(sender.address()), 1);
        assert_eq!(state.balance(recipient.address()), 40);
    }

    #[test]
    fn test_replay_is_rejected() {
        let mut state = AccountState::default();
        let sender = funded(&mut state, 100);
        let tx = signed(
            &sender,
            Transaction::transfer(sender.address().clone(), Wallet::new().address().clone(), 10, 0),
        );

        state.apply_transaction(&tx).unwrap();
        let result = state.apply_transaction(&tx);
        assert!(matches!(
            result,
            Err(TransactionError::InvalidNonce { expected: 1, got: 0 })
        ));
        assert_eq!(state.balance(sender.address()), 90);
    }

    #[test]
    fn test_insufficient_funds_leaves_state_unchanged() {
        let mut state = AccountState::default();
        let sender = funded(&mut state, 5);
        let before = state.get_all_accounts();

        let tx = signed(
            &sender,
            Transaction::transfer(sender.address().clone(), Wallet::new().address().clone(), 6, 0),
        );
        assert!(matches!(
            state.apply_transaction(&tx),
            Err(TransactionError::InsufficientFunds { required: 6, available: 5 })
        ));
        assert_eq!(state.get_all_accounts(), before);
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let mut state = AccountState::default();
        let sender = funded(&mut state, 100);
        let mut tx = signed(
            &sender,
            Transaction::transfer(sender.address().clone(), Wallet::new().address().clone(), 10, 0),
        );
        tx.amount = 90;

        assert!(matches!(
            state.apply_transaction(&tx),
            Err(TransactionError::InvalidSignature)
        ));
        assert_eq!(state.balance(sender.address()), 100);
    }

    #[test]
    fn test_self_transfer_keeps_balance() {
        let mut state = AccountState::default();
        let sender = funded(&mut state, 100);
        let tx = signed(
            &sender,
            Transaction::transfer(sender.address().clone(), sender.address().clone(), 30, 0),
        );

        state.apply_transaction(&tx).unwrap();
        assert_eq!(state.balance(sender.address()), 100);
        assert_eq!(state.nonce(sender.address()), 1);
    }

    #[test]
    fn test_deploy_and_call_counter() {
        let mut state = AccountState::default();
        let owner = funded(&mut state, 100);

        let deploy = signed(&owner, Transaction::deploy(owner.address().clone(), COUNTER, 10, 0));
        let contract = match state.apply_transaction(&deploy).unwrap() {
            ApplyOutcome::Deployed(address) => address,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(contract, derive_contract_address(owner.address(), 0));
        assert_eq!(
            derive_contract_address(&Address("ab".repeat(32)), 7).0,
            "5cd54a3cc0138b4217bee96c82403c8172543461"
        );
        assert_eq!(contract.0.len(), 40);
        assert_eq!(state.balance(&contract), 10);

        let call = signed(
            &owner,
            Transaction::call(owner.address().clone(), contract.clone(), "increment", 5, 1),
        );
        assert_eq!(state.apply_transaction(&call).unwrap(), ApplyOutcome::Called);

        let account = state.get_account(&contract);
        assert_eq!(account.storage.get("counter"), Some(&json!(1)));
        assert_eq!(account.balance, 15);
        assert_eq!(state.balance(owner.address()), 85);
    }

    #[test]
    fn test_failed_call_rolls_back_everything() {
        let mut state = AccountState::default();
        let owner = funded(&mut state, 100);

        let deploy = signed(&owner, Transaction::deploy(owner.address().clone(), "import os\n", 0, 0));
        let contract = match state.apply_transaction(&deploy).unwrap() {
            ApplyOutcome::Deployed(address) => address,
            other => panic!("unexpected outcome {:?}", other),
        };
        let before = state.get_all_accounts();

        let call = signed(
            &owner,
            Transaction::call(owner.address().clone(), contract.clone(), "go", 25, 1),
        );
        assert!(matches!(
            state.apply_transaction(&call),
            Err(TransactionError::ContractFailed(SandboxError::Forbidden(_)))
        ));

        assert_eq!(state.get_all_accounts(), before);
        assert!(state.get_account(&contract).storage.is_empty());
        assert_eq!(state.nonce(owner.address()), 1);
    }

    #[test]
    fn test_data_to_plain_account_is_a_transfer() {
        let mut state = AccountState::default();
        let sender = funded(&mut state, 50);
        let receiver = Wallet::new();

        let tx = signed(
            &sender,
            Transaction::call(sender.address().clone(), receiver.address().clone(), "hello", 20, 0),
        );
        assert_eq!(state.apply_transaction(&tx).unwrap(), ApplyOutcome::Transferred);
        assert_eq!(state.balance(receiver.address()), 20);
    }

    #[test]
    fn test_missing_receiver_rolls_back() {
        let mut state = AccountState::default();
        let sender = funded(&mut state, 50);

        let tx = signed(&sender, Transaction::new(sender.address().clone(), None, 10, 0, None));
        assert!(matches!(
            state.apply_transaction(&tx),
            Err(TransactionError::MissingReceiver)
        ));
        assert_eq!(state.balance(sender.address()), 50);
        assert_eq!(state.nonce(sender.address()), 0);

        let coinbase = Transaction::new(Address::coinbase(), None, 10, 0, None);
        assert!(state.apply_transaction(&coinbase).is_err());
    }

    #[test]
    fn test_credit_overflow_rolls_back() {
        let mut state = AccountState::default();
        let sender = funded(&mut state, 10);
        let rich = funded(&mut state, u64::MAX);

        let tx = signed(
            &sender,
            Transaction::transfer(sender.address().clone(), rich.address().clone(), 1, 0),
        );
        assert!(matches!(
            state.apply_transaction(&tx),
            Err(TransactionError::BalanceOverflow(_))
        ));
        assert_eq!(state.balance(sender.address()), 10);
        assert_eq!(state.nonce(sender.address()), 0);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut state = AccountState::default();
        let wallet = funded(&mut state, 10);

        let mut copy = state.snapshot();
        copy.apply_transaction(&Transaction::new_coinbase(wallet.address().clone(), 5))
            .unwrap();

        assert_eq!(state.balance(wallet.address()), 10);
        assert_eq!(copy.balance(wallet.address()), 15);
    }
}
