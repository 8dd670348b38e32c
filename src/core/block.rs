use crate::core::{MerkleContent, MerkleTree, ProofOfWork, Transaction};
use crate::error::{ChainError, Result};
use crate::utils::serialization::{put_bytes, put_i64, put_u64};
use crate::utils::{deserialize, serialize, sha256_digest, CanonicalEncode};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    height: u64,
    prev_hash: Vec<u8>,
    root_hash: Vec<u8>,
    difficulty: Vec<u8>, // 32-byte big-endian target
    nonce: u64,
    timestamp: i64,
    interval_total: i64, // milliseconds since the last retarget
    hash: Vec<u8>,
    content: MerkleContent<Transaction>,
}

impl CanonicalEncode for Block {
    // Header fields only; the content is bound through root_hash
    fn encode_canonical(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header_prefix());
        put_u64(out, self.nonce);
    }
}

impl Block {
    /// Commit `transactions` and mine the header against `difficulty`
    pub fn new_block(
        height: u64,
        prev_hash: Vec<u8>,
        difficulty: Vec<u8>,
        interval_total: i64,
        timestamp: i64,
        transactions: &[Transaction],
    ) -> Result<Block> {
        let tree = MerkleTree::build(transactions)?;

        let mut block = Block {
            height,
            prev_hash,
            root_hash: tree.root_hash().to_vec(),
            difficulty,
            nonce: 0,
            timestamp,
            interval_total,
            hash: vec![],
            content: tree.serialize(),
        };

        info!("Starting proof-of-work for block at height {height}");
        let pow = ProofOfWork::new_proof_of_work(&block);
        let (nonce, hash) = pow.run()?;
        block.nonce = nonce;
        block.hash = hash;
        info!(
            "Proof-of-work completed for block {} at height {height}",
            HEXLOWER.encode(&block.hash)
        );

        Ok(block)
    }

    /// First block of a chain: a single coinbase paying `owner`
    pub fn new_genesis(
        owner: &[u8],
        reward: u64,
        difficulty: Vec<u8>,
        timestamp: i64,
    ) -> Result<Block> {
        let coinbase = Transaction::new_coinbase(owner, reward, timestamp);
        Block::new_block(0, vec![], difficulty, 0, timestamp, &[coinbase])
    }

    /// Canonical header bytes up to, but excluding, the nonce
    pub fn header_prefix(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u64(&mut out, self.height);
        put_bytes(&mut out, &self.prev_hash);
        put_bytes(&mut out, &self.root_hash);
        put_bytes(&mut out, &self.difficulty);
        put_i64(&mut out, self.timestamp);
        put_i64(&mut out, self.interval_total);
        out
    }

    pub fn compute_hash(&self) -> Vec<u8> {
        sha256_digest(&self.canonical_bytes())
    }

    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Rebuild the committed tree and check it against `root_hash`
    pub fn verify_content(&self) -> Result<MerkleTree<Transaction>> {
        let tree = MerkleTree::rebuild(&self.content)?;
        if !tree.validate() {
            return Err(ChainError::InvalidContent.into());
        }
        if tree.root_hash() != self.root_hash.as_slice() {
            return Err(ChainError::RootMismatch.into());
        }
        Ok(tree)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    /// Transactions in commit order, coinbase first
    pub fn transactions(&self) -> Vec<Transaction> {
        self.content.leaves().cloned().collect()
    }

    pub fn get_content(&self) -> &MerkleContent<Transaction> {
        &self.content
    }

    pub fn get_height(&self) -> u64 {
        self.height
    }

    /// Number of blocks in the chain ending here
    pub fn length(&self) -> u64 {
        self.height + 1
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    pub fn get_prev_hash(&self) -> &[u8] {
        self.prev_hash.as_slice()
    }

    pub fn get_root_hash(&self) -> &[u8] {
        self.root_hash.as_slice()
    }

    pub fn get_difficulty(&self) -> &[u8] {
        self.difficulty.as_slice()
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_interval_total(&self) -> i64 {
        self.interval_total
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    /// Test-only constructor that skips mining
    #[cfg(test)]
    pub fn new_unmined(
        height: u64,
        prev_hash: Vec<u8>,
        difficulty: Vec<u8>,
        interval_total: i64,
        timestamp: i64,
        content: MerkleContent<Transaction>,
        root_hash: Vec<u8>,
    ) -> Block {
        let mut block = Block {
            height,
            prev_hash,
            root_hash,
            difficulty,
            nonce: 0,
            timestamp,
            interval_total,
            hash: vec![],
            content,
        };
        block.hash = block.compute_hash();
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::difficulty::{make_difficulty_target, meets_target};
    use crate::error::BlockchainError;
    use crate::utils::serialization::put_u32;

    fn genesis() -> Block {
        Block::new_genesis(&[4; 65], 50, make_difficulty_target(4), 1_000).unwrap()
    }

    #[test]
    fn test_mined_block_is_self_consistent() {
        let block = genesis();
        assert!(block.is_genesis());
        assert_eq!(block.length(), 1);
        assert!(block.has_valid_hash());
        assert!(meets_target(block.get_hash(), block.get_difficulty()));
        assert!(ProofOfWork::validate(&block));

        let tree = block.verify_content().unwrap();
        assert_eq!(tree.root_hash(), block.get_root_hash());
        let txs = block.transactions();
        assert_eq!(txs.len(), 1);
        assert!(txs[0].is_coinbase());
    }

    #[test]
    fn test_header_fields_are_bound_to_hash() {
        let block = genesis();
        let mut moved = block.clone();
        moved.timestamp += 1;
        assert!(!moved.has_valid_hash());

        let mut renonced = block.clone();
        renonced.nonce += 1;
        assert!(!renonced.has_valid_hash());
    }

    #[test]
    fn test_foreign_content_fails_root_check() {
        let block = genesis();
        let other = genesis();
        let mut swapped = block.clone();
        swapped.content = other.content.clone();
        assert!(matches!(
            swapped.verify_content(),
            Err(BlockchainError::Chain(ChainError::RootMismatch))
        ));
    }

    #[test]
    fn test_corrupt_content_fails_rebuild() {
        let mut block = genesis();
        block.content.rows.pop();
        assert!(matches!(
            block.verify_content(),
            Err(BlockchainError::Merkle(_))
        ));
    }

    #[test]
    fn test_storage_round_trip() {
        let block = genesis();
        let restored = Block::deserialize(&block.serialize().unwrap()).unwrap();
        assert_eq!(restored, block);
        assert!(restored.has_valid_hash());
    }

    #[test]
    fn test_header_prefix_layout() {
        let block = genesis();
        let prefix = block.header_prefix();
        let mut expected = Vec::new();
        put_u64(&mut expected, 0);
        put_u32(&mut expected, 0);
        put_bytes(&mut expected, block.get_root_hash());
        put_bytes(&mut expected, block.get_difficulty());
        put_i64(&mut expected, 1_000);
        put_i64(&mut expected, 0);
        assert_eq!(prefix, expected);
        assert_eq!(block.canonical_bytes().len(), prefix.len() + 8);
    }
}
