//! Test utilities for blockchain testing

use crate::config::NodeSettings;
use crate::core::{Block, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::{KvStore, SledStore};
use crate::utils::{new_key_pair, public_key_from_pkcs8};
use std::sync::{Arc, Mutex};

/// A signing key together with its public half
pub struct TestKey {
    pub pkcs8: Vec<u8>,
    pub public: Vec<u8>,
}

pub fn new_test_key() -> TestKey {
    let pkcs8 = new_key_pair().expect("key generation");
    let public = public_key_from_pkcs8(&pkcs8).expect("public key");
    TestKey { pkcs8, public }
}

/// Easy difficulty, no retargeting and a reward of 50
pub fn test_settings() -> NodeSettings {
    let mut settings = NodeSettings::default();
    settings.consensus.initial_difficulty_level = 4;
    settings.consensus.blocks_per_difficulty = 1_000;
    settings.consensus.base_reward = 50;
    settings.consensus.blocks_per_halving = 1_000;
    settings
}

/// A store whose writes to one table can be switched off
pub struct FailingStore {
    inner: SledStore,
    failing_table: Mutex<Option<&'static str>>,
}

impl FailingStore {
    pub fn new() -> Result<FailingStore> {
        Ok(FailingStore {
            inner: SledStore::temporary()?,
            failing_table: Mutex::new(None),
        })
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

/// A chain on a temporary store whose genesis pays the returned key
pub fn create_test_blockchain() -> Result<(Blockchain, TestKey)> {
    let owner = new_test_key();
    let store = Arc::new(SledStore::temporary()?);
    let chain = Blockchain::create(store, test_settings(), &owner.public)?;
    Ok((chain, owner))
}

/// Mine a valid child of `parent` whose coinbase pays `coinbase_value` to `miner`
pub fn child_block(
    chain: &Blockchain,
    parent: &Block,
    miner: &[u8],
    coinbase_value: u64,
    txs: &[Transaction],
    timestamp: i64,
) -> Result<Block> {
    let (difficulty, interval_total) = chain
        .get_difficulty_adjustment()
        .next_work(parent, timestamp);
    let mut content = vec![Transaction::new_coinbase(miner, coinbase_value, timestamp)];
    content.extend_from_slice(txs);
    Block::new_block(
        parent.get_height() + 1,
        parent.get_hash().to_vec(),
        difficulty,
        interval_total,
        timestamp,
        &content,
    )
}
