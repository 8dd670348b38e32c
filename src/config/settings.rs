use crate::core::monetary::INITIAL_BLOCK_REWARD;
use crate::error::{BlockchainError, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::RwLock;

pub static GLOBAL_CONFIG: Lazy<Config> = Lazy::new(Config::new);

static DEFAULT_NODE_ADDR: &str = "127.0.0.1:2001";
static DEFAULT_DATA_DIR: &str = "data";

const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const DATA_DIR_KEY: &str = "DATA_DIR";
const MINER_KEY: &str = "MINER_KEY";

/// Process-level settings read from the environment
pub struct Config {
    inner: RwLock<HashMap<String, String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Config {
        let mut map = HashMap::new();
        map.insert(
            String::from(NODE_ADDRESS_KEY),
            env::var(NODE_ADDRESS_KEY).unwrap_or_else(|_| String::from(DEFAULT_NODE_ADDR)),
        );
        map.insert(
            String::from(DATA_DIR_KEY),
            env::var(DATA_DIR_KEY).unwrap_or_else(|_| String::from(DEFAULT_DATA_DIR)),
        );
        if let Ok(miner) = env::var(MINER_KEY) {
            map.insert(String::from(MINER_KEY), miner);
        }

        Config {
            inner: RwLock::new(map),
        }
    }

    pub fn get_node_addr(&self) -> String {
        self.get(NODE_ADDRESS_KEY)
            .unwrap_or_else(|| String::from(DEFAULT_NODE_ADDR))
    }

    pub fn get_data_dir(&self) -> String {
        self.get(DATA_DIR_KEY)
            .unwrap_or_else(|| String::from(DEFAULT_DATA_DIR))
    }

    /// Hex public key that receives mining rewards
    pub fn get_miner_key(&self) -> Option<String> {
        self.get(MINER_KEY)
    }

    pub fn set_miner_key(&self, key: String) {
        self.set(MINER_KEY, key);
    }

    /// Node data lives under `<data dir>/node_<port>` so several nodes can share a machine
    pub fn node_db_path(&self) -> String {
        let addr = self.get_node_addr();
        let node_id = addr.split(':').next_back().unwrap_or("default");
        Path::new(&self.get_data_dir())
            .join(format!("node_{node_id}"))
            .to_string_lossy()
            .to_string()
    }

    fn get(&self, key: &str) -> Option<String> {
        let inner = self
            .inner
            .read()
            .expect("Failed to acquire read lock on config - this should never happen");
        inner.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on config - this should never happen");
        inner.insert(String::from(key), value);
    }
}

/// Consensus parameters shared by every node of a network
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    /// Leading zero bits of the genesis target
    pub initial_difficulty_level: u32,
    /// Difficulty is rescaled whenever the chain length is a multiple of this
    pub blocks_per_difficulty: u64,
    pub target_interval_ms: u64,
    pub base_reward: u64,
    pub blocks_per_halving: u64,
    pub max_future_skew_ms: i64,
    pub max_block_transactions: usize,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        ConsensusSettings {
            initial_difficulty_level: 16,
            blocks_per_difficulty: 10,
            target_interval_ms: 10_000,
            base_reward: INITIAL_BLOCK_REWARD,
            blocks_per_halving: 210_000,
            max_future_skew_ms: 2 * 60 * 60 * 1000,
            max_block_transactions: 100,
        }
    }
}

/// Transaction broadcast parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GossipSettings {
    pub max_broadcast_nodes: usize,
    pub max_failed_count: u32,
    pub broadcast_workers: usize,
    pub queue_capacity: usize,
    pub rpc_timeout_ms: u64,
}

impl Default for GossipSettings {
    fn default() -> Self {
        GossipSettings {
            max_broadcast_nodes: 8,
            max_failed_count: 3,
            broadcast_workers: 4,
            queue_capacity: 256,
            rpc_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub consensus: ConsensusSettings,
    pub gossip: GossipSettings,
}

impl NodeSettings {
    pub fn from_toml_str(text: &str) -> Result<NodeSettings> {
        let settings: NodeSettings = toml::from_str(text)
            .map_err(|e| BlockchainError::Config(format!("Invalid settings file: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<NodeSettings> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consensus.blocks_per_difficulty == 0 || self.consensus.blocks_per_halving == 0 {
            return Err(BlockchainError::Config(
                "blocks_per_difficulty and blocks_per_halving must be positive".to_string(),
            ));
        }
        if self.consensus.initial_difficulty_level > 255 {
            return Err(BlockchainError::Config(
                "initial_difficulty_level must be below 256".to_string(),
            ));
        }
        if self.gossip.broadcast_workers == 0 || self.gossip.queue_capacity == 0 {
            return Err(BlockchainError::Config(
                "broadcast_workers and queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
