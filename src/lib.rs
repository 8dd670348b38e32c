//! # Proof Ledger - a minimal proof-of-work ledger
//!
//! Signed value transfers are validated against per-owner balances, batched
//! into blocks committed through a Merkle tree, mined against a retargeting
//! difficulty, and ordered into a main chain by longest-chain fork choice.
//! Pending transactions are gossiped to a random subset of peers.
//!
//! ## How the code is organized
//! - `core/`: blocks, transactions, Merkle commitment, the skip-list index,
//!   the balance ledger, fork choice, difficulty and rewards, and
//!   `Blockchain`, which ties them to storage
//! - `storage/`: the table-scoped key/value store and the fee-ranked mempool
//! - `network/`: peer registry, transaction gossip, TCP transport and server
//! - `config/`: environment-backed process config and TOML node settings
//! - `utils/`: hashing, signatures and canonical encodings
//! - `cli/`: command-line parsing for the node binary
//!
//! ## Where to start
//! 1. `core/blockchain.rs` for `accept_transaction` and `accept_block`
//! 2. `core/ledger.rs` for the validation rules and apply/rollback
//! 3. `core/chain_selector.rs` for how reorgs are detected
//! 4. `network/gossip.rs` for broadcast and peer eviction

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub mod testnet;

// Re-export commonly used types for convenience
pub use cli::{Command, Opt};
pub use config::{Config, ConsensusSettings, GossipSettings, NodeSettings, GLOBAL_CONFIG};
pub use core::{
    Block, Blockchain, ChainRecord, ChainSelector, ChainStatus, DifficultyAdjustment,
    LedgerPolicy, MerkleTree, OrderedIndex, OutPoint, ProofOfWork, TXInput, TXOutput,
    Transaction, UtxoLedger,
};
pub use error::{BlockchainError, ChainError, ErrorKind, MerkleError, Result, TxError};
pub use network::{
    BroadcastQueue, BroadcastReport, GossipBroadcaster, Node, Nodes, Server, TcpTransport,
    Transport, TxPacket, CENTRAL_NODE,
};
pub use storage::{KvStore, MemoryPool, SledStore};
pub use utils::{
    current_timestamp, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    new_key_pair, sha256_digest,
};
