//! Core ledger functionality
//!
//! Blocks and transactions, the Merkle commitment over a block's content,
//! the skip-list index behind fork choice and the mempool, the balance
//! ledger, and difficulty and reward economics. `Blockchain` ties them to
//! storage.

pub mod block;
pub mod blockchain;
pub mod chain_selector;
pub mod difficulty;
pub mod ledger;
pub mod merkle;
pub mod monetary;
pub mod ordered_index;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{Blockchain, BlockchainIterator};
pub use chain_selector::{ChainRecord, ChainSelector, ChainStatus, ChainUpdate};
pub use difficulty::DifficultyAdjustment;
pub use ledger::{LedgerPolicy, UtxoLedger};
pub use merkle::{MerkleContent, MerkleEntry, MerkleTree};
pub use monetary::{INITIAL_BLOCK_REWARD, SATOSHIS_PER_COIN};
pub use ordered_index::OrderedIndex;
pub use proof_of_work::ProofOfWork;
pub use transaction::{OutPoint, TXInput, TXOutput, Transaction};
