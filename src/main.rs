use std::env;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;

use mini_ledger::blockchain::block::{treasury_address, treasury_wallet};
use mini_ledger::blockchain::{account::derive_contract_address, Address, Transaction, Wallet};
use mini_ledger::config::load_config;
use mini_ledger::node::Node;

const COUNTER_CONTRACT: &str = "\
if msg['data'] == 'increment':
    storage['counter'] = storage.get('counter', 0) + 1
    storage['last_caller'] = msg['sender']
";

fn config_path() -> Option<PathBuf> {
    env::args()
        .nth(1)
        .or_else(|| env::var("LEDGER_CONFIG").ok())
        .map(PathBuf::from)
}

fn signed(wallet: &Wallet, mut tx: Transaction) -> Result<Transaction> {
    tx.sign(wallet)?;
    Ok(tx)
}

async fn mine(node: &Arc<Node>) -> Result<()> {
    let block = node
        .spawn_miner(Arc::new(AtomicBool::new(false)))
        .await
        .context("miner task panicked")??;
    info!(
        "Block {} committed with {} transactions",
        block.index,
        block.transactions.len()
    );
    Ok(())
}

fn log_account(node: &Node, label: &str, address: &Address) {
    let account = node.chain().get_account(address);
    info!(
        "{} {}: balance {}, nonce {}, storage {:?}",
        label,
        address.short(),
        account.balance,
        account.nonce,
        account.storage
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let path = config_path();
    let config = load_config(path.as_deref())
        .with_context(|| format!("loading configuration from {:?}", path))?;
    let node = Arc::new(Node::new(config)?);
    info!("Chain height at start: {}", node.chain().height());

    let treasury = treasury_wallet();
    let user = Wallet::new();
    info!("Created wallet {}", user.address());

    let nonce = node.next_nonce(&treasury_address());
    node.submit_transaction(signed(
        &treasury,
        Transaction::transfer(treasury_address(), user.address().clone(), 1_000, nonce),
    )?)?;
    mine(&node).await?;

    let nonce = node.next_nonce(user.address());
    let contract = derive_contract_address(user.address(), nonce);
    node.submit_transaction(signed(
        &user,
        Transaction::deploy(user.address().clone(), COUNTER_CONTRACT, 0, nonce),
    )?)?;
    mine(&node).await?;

    if node.chain().get_account(&contract).code.is_none() {
        bail!("contract {} was not deployed", contract);
    }

    let nonce = node.next_nonce(user.address());
    node.submit_transaction(signed(
        &user,
        Transaction::call(user.address().clone(), contract.clone(), "increment", 10, nonce),
    )?)?;
    mine(&node).await?;

    log_account(&node, "Treasury", &treasury_address());
    log_account(&node, "User", user.address());
    log_account(&node, "Contract", &contract);
    log_account(&node, "Miner", node.beneficiary());
    info!("Final chain height: {}", node.chain().height());

    Ok(())
}
