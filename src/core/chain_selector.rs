//! Fork choice over every known chain tip
//!
//! Each tracked chain is one entry of an `OrderedIndex` keyed by the
//! previous-block hash of its tip and scored by `(length, Reverse(arrival))`:
//! the longest chain wins and, between equal lengths, the one seen first.

use crate::core::{Block, OrderedIndex};
use data_encoding::HEXLOWER;
use log::{debug, info};
use std::cmp::Reverse;
use std::collections::HashMap;

type ChainScore = (u64, Reverse<u64>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRecord {
    pub last_block_hash: Vec<u8>,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    /// First chain the selector has seen
    Genesis,
    /// The main chain grew by this block
    Extended,
    /// Recorded, but the main chain is unchanged
    SideBranch,
    /// Another chain overtook the previous main chain
    Reorg { old_main: ChainRecord },
}

#[derive(Debug, Clone)]
pub struct ChainUpdate {
    pub status: ChainStatus,
    pub updated: ChainRecord,
    pub main: ChainRecord,
    inserted: Option<Vec<u8>>,
    removed: Vec<(Vec<u8>, ChainScore, ChainRecord)>,
}

#[derive(Debug, Default)]
pub struct ChainSelector {
    index: OrderedIndex<Vec<u8>, ChainScore, ChainRecord>,
    // tip hash -> index key
    tips: HashMap<Vec<u8>, Vec<u8>>,
    arrivals: u64,
}

impl ChainSelector {
    pub fn new() -> ChainSelector {
        ChainSelector::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get_main_chain(&self) -> Option<ChainRecord> {
        self.index.max().map(|(_, _, record)| record.clone())
    }

    /// Tips ranked `[lo, hi)` by chain weight, best first
    pub fn get_chain_hashes(&self, lo: usize, hi: usize) -> Vec<Vec<u8>> {
        self.index
            .top_max(lo, hi)
            .into_iter()
            .rev()
            .map(|(_, _, record)| record.last_block_hash.clone())
            .collect()
    }

    /// Record `block` as the new tip of the chain it extends
    pub fn set_chain(&mut self, block: &Block) -> ChainUpdate {
        let key = block.get_prev_hash().to_vec();
        let updated = ChainRecord {
            last_block_hash: block.get_hash().to_vec(),
            length: block.length(),
        };
        let old_main = self.get_main_chain();

        // A sibling tip already holds this key and is at least as long: it stays
        if let Some((_, existing)) = self.index.get(&key) {
            if existing.length >= updated.length {
                debug!(
                    "Block {} competes with tip {} and arrived later",
                    HEXLOWER.encode(block.get_hash()),
                    HEXLOWER.encode(&existing.last_block_hash)
                );
                let main = old_main.unwrap_or_else(|| existing.clone());
                return ChainUpdate {
                    status: ChainStatus::SideBranch,
                    updated,
                    main,
                    inserted: None,
                    removed: vec![],
                };
            }
        }

        let mut removed = Vec::new();
        if let Some(extended_key) = self.tips.remove(block.get_prev_hash()) {
            if let Some((score, record)) = self.index.remove(&extended_key) {
                removed.push((extended_key, score, record));
            }
        }
        if let Some((score, record)) = self.index.remove(&key) {
            self.tips.remove(&record.last_block_hash);
            removed.push((key.clone(), score, record));
        }

        let score = (updated.length, Reverse(self.arrivals));
        self.arrivals += 1;
        self.index.insert(key.clone(), score, updated.clone());
        self.tips.insert(updated.last_block_hash.clone(), key.clone());

        let main = self.get_main_chain().unwrap_or_else(|| updated.clone());
        let status = match old_main {
            None => ChainStatus::Genesis,
            Some(old) if main.last_block_hash == updated.last_block_hash => {
                if old.last_block_hash.as_slice() == block.get_prev_hash() {
                    ChainStatus::Extended
                } else {
                    info!(
                        "Chain {} (length {}) overtakes {} (length {})",
                        HEXLOWER.encode(&updated.last_block_hash),
                        updated.length,
                        HEXLOWER.encode(&old.last_block_hash),
                        old.length
                    );
                    ChainStatus::Reorg { old_main: old }
                }
            }
            Some(_) => ChainStatus::SideBranch,
        };

        ChainUpdate {
            status,
            updated,
            main,
            inserted: Some(key),
            removed,
        }
    }

    /// Undo a `set_chain`, used when the branch it selected fails validation
    pub fn revert(&mut self, update: ChainUpdate) {
        if let Some(key) = update.inserted {
            if let Some((_, record)) = self.index.remove(&key) {
                self.tips.remove(&record.last_block_hash);
            }
        }
        for (key, score, record) in update.removed {
            self.tips.insert(record.last_block_hash.clone(), key.clone());
            self.index.insert(key, score, record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::difficulty::make_difficulty_target;
    use crate::core::Transaction;

    fn child(parent: Option<&Block>, stamp: i64) -> Block {
        let (height, prev) = match parent {
            Some(p) => (p.get_height() + 1, p.get_hash().to_vec()),
            None => (0, vec![]),
        };
        let coinbase = Transaction::new_coinbase(&[1], 50, stamp);
        Block::new_block(height, prev, make_difficulty_target(0), 0, stamp, &[coinbase]).unwrap()
    }

    fn branch(from: &Block, count: usize, stamp: i64) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::new();
        for i in 0..count {
            let parent = blocks.last().unwrap_or(from).clone();
            blocks.push(child(Some(&parent), stamp + i as i64));
        }
        blocks
    }

    #[test]
    fn test_longest_branch_wins_and_reorgs() {
        let mut selector = ChainSelector::new();
        let genesis = child(None, 0);
        assert_eq!(selector.set_chain(&genesis).status, ChainStatus::Genesis);

        let short = branch(&genesis, 4, 100); // length 5
        let long = branch(&genesis, 5, 200); // length 6
        for block in &short {
            selector.set_chain(block);
        }
        for block in &long {
            selector.set_chain(block);
        }

        let main = selector.get_main_chain().unwrap();
        assert_eq!(main.length, 6);
        assert_eq!(main.last_block_hash, long[4].get_hash());
        assert_eq!(selector.len(), 2);

        // extending the short branch to 7 overtakes
        let more = branch(&short[3], 2, 300);
        let first = selector.set_chain(&more[0]);
        assert_eq!(first.status, ChainStatus::SideBranch);
        let second = selector.set_chain(&more[1]);
        assert_eq!(
            second.status,
            ChainStatus::Reorg {
                old_main: ChainRecord {
                    last_block_hash: long[4].get_hash().to_vec(),
                    length: 6
                }
            }
        );
        assert_eq!(selector.get_main_chain().unwrap().length, 7);
        assert_eq!(
            selector.get_chain_hashes(0, 10),
            vec![more[1].get_hash().to_vec(), long[4].get_hash().to_vec()]
        );
    }

    #[test]
    fn test_extension_of_main_tip() {
        let mut selector = ChainSelector::new();
        let genesis = child(None, 0);
        selector.set_chain(&genesis);
        let next = child(Some(&genesis), 1);
        let update = selector.set_chain(&next);
        assert_eq!(update.status, ChainStatus::Extended);
        assert_eq!(update.main.length, 2);
        assert_eq!(selector.len(), 1);
    }

    #[test]
    fn test_equal_length_keeps_first_seen() {
        let mut selector = ChainSelector::new();
        let genesis = child(None, 0);
        selector.set_chain(&genesis);

        let a = branch(&genesis, 2, 100);
        let b = branch(&genesis, 2, 200);
        for block in a.iter().chain(&b) {
            selector.set_chain(block);
        }
        assert_eq!(
            selector.get_main_chain().unwrap().last_block_hash,
            a[1].get_hash()
        );
    }

    #[test]
    fn test_sibling_of_tracked_tip_is_side_branch() {
        let mut selector = ChainSelector::new();
        let genesis = child(None, 0);
        selector.set_chain(&genesis);
        let first = child(Some(&genesis), 1);
        let second = child(Some(&genesis), 2);
        selector.set_chain(&first);

        let update = selector.set_chain(&second);
        assert_eq!(update.status, ChainStatus::SideBranch);
        assert_eq!(update.main.last_block_hash, first.get_hash());
        assert_eq!(selector.len(), 1);
    }

    #[test]
    fn test_revert_restores_previous_selection() {
        let mut selector = ChainSelector::new();
        let genesis = child(None, 0);
        selector.set_chain(&genesis);
        let main = branch(&genesis, 2, 100);
        for block in &main {
            selector.set_chain(block);
        }
        let side = branch(&main[0], 2, 200);
        selector.set_chain(&side[0]);
        let before = selector.get_chain_hashes(0, 10);

        let update = selector.set_chain(&side[1]);
        assert!(matches!(update.status, ChainStatus::Reorg { .. }));
        selector.revert(update);

        assert_eq!(selector.get_chain_hashes(0, 10), before);
        assert_eq!(
            selector.get_main_chain().unwrap().last_block_hash,
            main[1].get_hash()
        );
        // the reverted tip can be offered again
        let again = selector.set_chain(&side[1]);
        assert!(matches!(again.status, ChainStatus::Reorg { .. }));
    }
}
