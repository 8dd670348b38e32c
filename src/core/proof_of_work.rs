use crate::core::difficulty::{meets_target, score_of};
use crate::core::Block;
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use log::debug;
use num_bigint::BigUint;

/// Nonce search over a block header
pub struct ProofOfWork {
    header: Vec<u8>,
    target: BigUint,
}

const MAX_NONCE: u64 = u64::MAX;

impl ProofOfWork {
    pub fn new_proof_of_work(block: &Block) -> ProofOfWork {
        ProofOfWork {
            header: block.header_prefix(),
            target: score_of(block.get_difficulty()),
        }
    }

    /// A block carries valid work when its recomputed header hash meets its own target
    pub fn validate(block: &Block) -> bool {
        meets_target(&block.compute_hash(), block.get_difficulty())
    }

    fn prepare_data(&self, nonce: u64) -> Vec<u8> {
        let mut data_bytes = Vec::with_capacity(self.header.len() + 8);
        data_bytes.extend_from_slice(&self.header);
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    pub fn run(&self) -> Result<(u64, Vec<u8>)> {
        let mut nonce = 0;
        loop {
            let hash = sha256_digest(&self.prepare_data(nonce));
            if score_of(&hash) <= self.target {
                debug!("Found nonce {nonce}");
                return Ok((nonce, hash));
            }
            if nonce == MAX_NONCE {
                return Err(BlockchainError::Mining(
                    "Nonce space exhausted without meeting the target".to_string(),
                ));
            }
            nonce += 1;
        }
    }
}
