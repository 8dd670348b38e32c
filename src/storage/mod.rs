//! Data storage and persistence
//!
//! The table-scoped key/value store the chain persists into, and the
//! in-memory pool of pending transactions.

pub mod kv_store;
pub mod memory_pool;

pub use kv_store::{
    KvStore, SledStore, BLOCKS_TABLE, META_TABLE, TIP_BLOCK_HASH_KEY, TRANSACTIONS_TABLE,
};
pub use memory_pool::MemoryPool;
