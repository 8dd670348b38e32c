//! Fixtures shared by the integration tests

#![allow(dead_code)]

use proof_ledger::core::{Block, Blockchain, OutPoint, TXOutput, Transaction};
use proof_ledger::error::{BlockchainError, Result};
use proof_ledger::storage::{KvStore, SledStore};
use proof_ledger::utils::{new_key_pair, public_key_from_pkcs8};
use proof_ledger::NodeSettings;
use std::sync::Mutex;

pub struct Key {
    pub pkcs8: Vec<u8>,
    pub public: Vec<u8>,
}

pub fn key() -> Key {
    let pkcs8 = new_key_pair().unwrap();
    let public = public_key_from_pkcs8(&pkcs8).unwrap();
    Key { pkcs8, public }
}

/// Easy difficulty, no retargeting and a reward of 50
pub fn settings() -> NodeSettings {
    let mut settings = NodeSettings::default();
    settings.consensus.initial_difficulty_level = 4;
    settings.consensus.blocks_per_difficulty = 1_000;
    settings.consensus.base_reward = 50;
    settings.consensus.blocks_per_halving = 1_000;
    settings
}

/// Mines a block on `parent` paying `reward` to `miner`
pub fn child(
    chain: &Blockchain,
    parent: &Block,
    miner: &[u8],
    reward: u64,
    txs: &[Transaction],
    timestamp: i64,
) -> Block {
    let (difficulty, interval_total) = chain
        .get_difficulty_adjustment()
        .next_work(parent, timestamp);
    let mut content = vec![Transaction::new_coinbase(miner, reward, timestamp)];
    content.extend_from_slice(txs);
    Block::new_block(
        parent.get_height() + 1,
        parent.get_hash().to_vec(),
        difficulty,
        interval_total,
        timestamp,
        &content,
    )
    .unwrap()
}

pub fn genesis_of(chain: &Blockchain) -> Block {
    chain
        .iterator()
        .last()
        .expect("chain has a genesis block")
        .unwrap()
}

/// Spends output 0 of `funding` in full to `to`
pub fn pay(from: &Key, funding: &Transaction, to: &Key, value: u64, timestamp: i64) -> Transaction {
    Transaction::new_signed(
        &from.pkcs8,
        &[OutPoint::new(funding.get_id(), 0)],
        vec![TXOutput::new(&to.public, value)],
        timestamp,
    )
    .unwrap()
}

/// A store whose writes to one table can be switched off
pub struct FailingStore {
    inner: SledStore,
    failing_table: Mutex<Option<&'static str>>,
}

impl FailingStore {
    pub fn new() -> FailingStore {
        FailingStore {
            inner: SledStore::temporary().unwrap(),
            failing_table: Mutex::new(None),
        }
    }

    pub fn fail_writes_to(&self, table: Option<&'static str>) {
        *self.failing_table.lock().unwrap() = table;
    }

    fn check(&self, table: &str) -> Result<()> {
        match *self.failing_table.lock().unwrap() {
            Some(failing) if failing == table => Err(BlockchainError::Database(format!(
                "writes to {table} are switched off"
            ))),
            _ => Ok(()),
        }
    }
}

impl KvStore for FailingStore {
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.check(table)?;
        self.inner.put(table, key, value)
    }

    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(table, key)
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<()> {
        self.check(table)?;
        self.inner.delete(table, key)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
