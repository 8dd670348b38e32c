// Table-scoped key/value persistence
// The ledger only needs put/get/delete by table, so that is the whole capability
// SledStore backs it with one sled tree per table

use crate::error::{BlockchainError, Result};
use sled::{Db, Tree};
use std::path::Path;

pub const BLOCKS_TABLE: &str = "blocks";
pub const TRANSACTIONS_TABLE: &str = "transactions";
pub const META_TABLE: &str = "meta";

// Key in the meta table holding the hash of the main-chain tip
pub const TIP_BLOCK_HASH_KEY: &[u8] = b"tip_block_hash";

pub trait KvStore: Send + Sync {
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()>;
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn delete(&self, table: &str, key: &[u8]) -> Result<()>;
    fn close(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<SledStore> {
        let db = sled::open(path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        Ok(SledStore { db })
    }

    /// Store that lives only as long as the process
    pub fn temporary() -> Result<SledStore> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        Ok(SledStore { db })
    }

    fn tree(&self, table: &str) -> Result<Tree> {
        self.db
            .open_tree(table)
            .map_err(|e| BlockchainError::Database(format!("Failed to open {table} tree: {e}")))
    }
}

impl KvStore for SledStore {
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree(table)?
            .insert(key, value)
            .map_err(|e| BlockchainError::Database(format!("Failed to write to {table}: {e}")))?;
        Ok(())
    }

    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .tree(table)?
            .get(key)
            .map_err(|e| BlockchainError::Database(format!("Failed to read from {table}: {e}")))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<()> {
        self.tree(table)?
            .remove(key)
            .map_err(|e| BlockchainError::Database(format!("Failed to delete from {table}: {e}")))?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| BlockchainError::Database(format!("Failed to flush database: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tables_are_isolated() {
        let store = SledStore::temporary().unwrap();
        store.put(BLOCKS_TABLE, b"k", b"block").unwrap();
        store.put(TRANSACTIONS_TABLE, b"k", b"tx").unwrap();

        assert_eq!(store.get(BLOCKS_TABLE, b"k").unwrap(), Some(b"block".to_vec()));
        assert_eq!(store.get(TRANSACTIONS_TABLE, b"k").unwrap(), Some(b"tx".to_vec()));
        assert_eq!(store.get(META_TABLE, b"k").unwrap(), None);

        store.delete(BLOCKS_TABLE, b"k").unwrap();
        assert_eq!(store.get(BLOCKS_TABLE, b"k").unwrap(), None);
        assert!(store.get(TRANSACTIONS_TABLE, b"k").unwrap().is_some());
        // deleting a missing key is fine
        store.delete(BLOCKS_TABLE, b"k").unwrap();
    }

    #[test]
    fn test_values_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db");
        {
            let store = SledStore::open(&path).unwrap();
            store.put(META_TABLE, TIP_BLOCK_HASH_KEY, &[7; 32]).unwrap();
            store.close().unwrap();
        }
        let store = SledStore::open(&path).unwrap();
        assert_eq!(store.get(META_TABLE, TIP_BLOCK_HASH_KEY).unwrap(), Some(vec![7; 32]));
    }
}
