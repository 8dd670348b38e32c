use crate::core::{OrderedIndex, OutPoint, Transaction};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct PoolState {
    // K -> tx id, score -> fee
    ranked: OrderedIndex<Vec<u8>, u64, Transaction>,
    // outpoint -> id of the pending transaction spending it
    claimed: HashMap<OutPoint, Vec<u8>>,
}

impl PoolState {
    fn remove(&mut self, txid: &[u8]) -> Option<Transaction> {
        let (_, tx) = self.ranked.remove(&txid.to_vec())?;
        for input in tx.get_inputs() {
            self.claimed.remove(&input.outpoint());
        }
        Some(tx)
    }
}

/// Pending transactions ranked by fee
pub struct MemoryPool {
    inner: RwLock<PoolState>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(PoolState::default()),
        }
    }

    /// First outpoint of `tx` already claimed by another pending transaction
    pub fn conflict(&self, tx: &Transaction) -> Option<OutPoint> {
        match self.inner.read() {
            Ok(pool) => tx
                .get_inputs()
                .iter()
                .map(|input| input.outpoint())
                .find(|point| {
                    pool.claimed
                        .get(point)
                        .is_some_and(|owner| owner.as_slice() != tx.get_id())
                }),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                None
            }
        }
    }

    pub fn is_claimed(&self, point: &OutPoint) -> bool {
        match self.inner.read() {
            Ok(pool) => pool.claimed.contains_key(point),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                false
            }
        }
    }

    /// Add a validated transaction; false when it is already pending or conflicts
    pub fn add(&self, tx: Transaction, fee: u64) -> bool {
        match self.inner.write() {
            Ok(mut pool) => {
                let id = tx.get_id().to_vec();
                if pool.ranked.contains_key(&id) {
                    return false;
                }
                let points: Vec<OutPoint> =
                    tx.get_inputs().iter().map(|input| input.outpoint()).collect();
                if points.iter().any(|point| pool.claimed.contains_key(point)) {
                    return false;
                }
                for point in points {
                    pool.claimed.insert(point, id.clone());
                }
                pool.ranked.insert(id, fee, tx);
                true
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
                false
            }
        }
    }

    pub fn contains(&self, txid: &[u8]) -> bool {
        match self.inner.read() {
            Ok(pool) => pool.ranked.contains_key(&txid.to_vec()),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                false
            }
        }
    }

    pub fn remove(&self, txid: &[u8]) -> Option<Transaction> {
        match self.inner.write() {
            Ok(mut pool) => pool.remove(txid),
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
                None
            }
        }
    }

    /// Drop transactions confirmed by a block, plus pending ones now double-spending it
    pub fn remove_confirmed(&self, confirmed: &[Transaction]) {
        match self.inner.write() {
            Ok(mut pool) => {
                for tx in confirmed {
                    pool.remove(tx.get_id());
                    for input in tx.get_inputs() {
                        if let Some(rival) = pool.claimed.get(&input.outpoint()).cloned() {
                            pool.remove(&rival);
                        }
                    }
                }
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
            }
        }
    }

    /// Up to `n` transactions with the highest fees, best first
    pub fn top(&self, n: usize) -> Vec<(Transaction, u64)> {
        match self.inner.read() {
            Ok(pool) => pool
                .ranked
                .top_max(0, n)
                .into_iter()
                .rev()
                .map(|(_, fee, tx)| (tx.clone(), *fee))
                .collect(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                Vec::new()
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(pool) => pool.ranked.len(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self.inner.read() {
            Ok(pool) => pool.ranked.is_empty(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                true // Conservative default
            }
        }
    }
}
