// This file implements the transaction model - the core of how value moves in my ledger
// Each transaction consumes previous outputs and creates new ones, UTXO style
// Outputs are owned by raw public keys, so signatures are checked directly against the owner

use crate::error::Result;
use crate::utils::serialization::{put_bytes, put_i64, put_u32, put_u64};
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, serialize,
    sha256_digest, CanonicalEncode,
};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reference to one output of a previous transaction
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct OutPoint {
    pub tx_id: Vec<u8>,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_id: &[u8], index: u32) -> OutPoint {
        OutPoint {
            tx_id: tx_id.to_vec(),
            index,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", HEXLOWER.encode(&self.tx_id), self.index)
    }
}

// This represents a transaction input - it references a previous transaction output
// The signature covers the previous transaction's id and must verify against that output's owner
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    prev_tx: Vec<u8>,
    index: u32,
    signature: Vec<u8>,
}

impl TXInput {
    // An unsigned input, the signature gets attached later
    pub fn new(prev_tx: &[u8], index: u32) -> TXInput {
        TXInput {
            prev_tx: prev_tx.to_vec(),
            index,
            signature: vec![],
        }
    }

    // I sign the previous transaction's id with the owner's PKCS#8 key
    pub fn signed(prev_tx: &[u8], index: u32, pkcs8: &[u8]) -> Result<TXInput> {
        let signature = ecdsa_p256_sha256_sign_digest(pkcs8, prev_tx)?;
        Ok(TXInput {
            prev_tx: prev_tx.to_vec(),
            index,
            signature,
        })
    }

    pub fn get_prev_tx(&self) -> &[u8] {
        self.prev_tx.as_slice()
    }

    pub fn get_index(&self) -> u32 {
        self.index
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(&self.prev_tx, self.index)
    }

    pub fn verify_signature(&self, owner: &[u8]) -> bool {
        ecdsa_p256_sha256_sign_verify(owner, &self.signature, &self.prev_tx)
    }
}

// This represents a transaction output - value locked to an owner's public key
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXOutput {
    owner: Vec<u8>,
    value: u64,
}

impl TXOutput {
    pub fn new(owner: &[u8], value: u64) -> TXOutput {
        TXOutput {
            owner: owner.to_vec(),
            value,
        }
    }

    pub fn get_owner(&self) -> &[u8] {
        self.owner.as_slice()
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }
}

// This is the main transaction structure
// `in_len`/`out_len` are the declared counts, validation checks them against the vectors
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    id: Vec<u8>,
    in_len: u32,
    inputs: Vec<TXInput>,
    out_len: u32,
    outputs: Vec<TXOutput>,
    timestamp: i64,
    block_hash: Option<Vec<u8>>,
}

impl CanonicalEncode for Transaction {
    // Everything except the id itself and the confirming block
    fn encode_canonical(&self, out: &mut Vec<u8>) {
        put_u32(out, self.in_len);
        for input in &self.inputs {
            put_bytes(out, &input.prev_tx);
            put_u32(out, input.index);
            put_bytes(out, &input.signature);
        }
        put_u32(out, self.out_len);
        for output in &self.outputs {
            put_bytes(out, &output.owner);
            put_u64(out, output.value);
        }
        put_i64(out, self.timestamp);
    }
}

impl Transaction {
    pub fn new(inputs: Vec<TXInput>, outputs: Vec<TXOutput>, timestamp: i64) -> Transaction {
        let in_len = inputs.len() as u32;
        let out_len = outputs.len() as u32;
        Self::from_parts(in_len, inputs, out_len, outputs, timestamp)
    }

    /// Build with explicit declared counts, which may disagree with the vectors
    pub fn from_parts(
        in_len: u32,
        inputs: Vec<TXInput>,
        out_len: u32,
        outputs: Vec<TXOutput>,
        timestamp: i64,
    ) -> Transaction {
        let mut tx = Transaction {
            id: vec![],
            in_len,
            inputs,
            out_len,
            outputs,
            timestamp,
            block_hash: None,
        };
        tx.id = tx.hash();
        tx
    }

    // When I create a coinbase transaction (the reward for mining a block)
    // The single input has no previous transaction; random bytes keep ids unique
    pub fn new_coinbase(owner: &[u8], value: u64, timestamp: i64) -> Transaction {
        let tx_input = TXInput {
            signature: Uuid::new_v4().as_bytes().to_vec(),
            ..Default::default()
        };
        Self::new(vec![tx_input], vec![TXOutput::new(owner, value)], timestamp)
    }

    /// Spend the given outpoints, all owned by the key in `pkcs8`
    pub fn new_signed(
        pkcs8: &[u8],
        spends: &[OutPoint],
        outputs: Vec<TXOutput>,
        timestamp: i64,
    ) -> Result<Transaction> {
        let inputs = spends
            .iter()
            .map(|point| TXInput::signed(&point.tx_id, point.index, pkcs8))
            .collect::<Result<Vec<TXInput>>>()?;
        Ok(Self::new(inputs, outputs, timestamp))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_tx.is_empty()
    }

    pub fn hash(&self) -> Vec<u8> {
        sha256_digest(&self.canonical_bytes())
    }

    pub fn has_valid_id(&self) -> bool {
        self.id == self.hash()
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_in_len(&self) -> u32 {
        self.in_len
    }

    pub fn get_inputs(&self) -> &[TXInput] {
        self.inputs.as_slice()
    }

    pub fn get_out_len(&self) -> u32 {
        self.out_len
    }

    pub fn get_outputs(&self) -> &[TXOutput] {
        self.outputs.as_slice()
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_block_hash(&self) -> Option<&[u8]> {
        self.block_hash.as_deref()
    }

    // The only field that may change after hashing
    pub fn set_block_hash(&mut self, block_hash: Option<Vec<u8>>) {
        self.block_hash = block_hash;
    }

    pub fn output_total(&self) -> u128 {
        self.outputs.iter().map(|out| out.value as u128).sum()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{new_key_pair, public_key_from_pkcs8};

    #[test]
    fn test_id_is_hash_of_canonical_bytes() {
        let owner = vec![4u8; 65];
        let tx = Transaction::new_coinbase(&owner, 10, 1_000);
        assert!(tx.has_valid_id());
        assert_eq!(tx.get_id(), sha256_digest(&tx.canonical_bytes()).as_slice());
        assert_eq!(tx.get_in_len(), 1);
        assert_eq!(tx.get_out_len(), 1);
    }

    #[test]
    fn test_block_hash_does_not_change_identity() {
        let tx = Transaction::new_coinbase(&[1, 2, 3], 10, 1_000);
        let mut confirmed = tx.clone();
        confirmed.set_block_hash(Some(vec![9; 32]));
        assert_eq!(confirmed.hash(), tx.hash());
        assert!(confirmed.has_valid_id());
        assert_eq!(confirmed.get_block_hash(), Some(&[9u8; 32][..]));
    }

    #[test]
    fn test_coinbase_ids_are_unique() {
        let a = Transaction::new_coinbase(&[1], 10, 1_000);
        let b = Transaction::new_coinbase(&[1], 10, 1_000);
        assert!(a.is_coinbase());
        assert_ne!(a.get_id(), b.get_id());
    }

    #[test]
    fn test_signed_inputs_verify_against_owner() {
        let pkcs8 = new_key_pair().unwrap();
        let owner = public_key_from_pkcs8(&pkcs8).unwrap();
        let funding = Transaction::new_coinbase(&owner, 10, 1_000);

        let spend = Transaction::new_signed(
            &pkcs8,
            &[OutPoint::new(funding.get_id(), 0)],
            vec![TXOutput::new(&[7; 65], 8)],
            61_000,
        )
        .unwrap();

        assert!(!spend.is_coinbase());
        let input = &spend.get_inputs()[0];
        assert_eq!(input.outpoint(), OutPoint::new(funding.get_id(), 0));
        assert!(input.verify_signature(&owner));
        assert!(!input.verify_signature(&[7; 65]));
    }

    #[test]
    fn test_storage_round_trip_keeps_identity() {
        let mut tx = Transaction::new_coinbase(&[1], 10, 1_000);
        tx.set_block_hash(Some(vec![5; 32]));
        let restored = Transaction::deserialize(&tx.serialize().unwrap()).unwrap();
        assert_eq!(restored, tx);
        assert!(restored.has_valid_id());

        let moved = Transaction::new(tx.get_inputs().to_vec(), tx.get_outputs().to_vec(), 1_001);
        assert_ne!(moved.get_id(), tx.get_id());
    }

    #[test]
    fn test_declared_lengths_are_kept() {
        let tx = Transaction::from_parts(
            3,
            vec![TXInput::new(&[1; 32], 0), TXInput::new(&[2; 32], 1)],
            1,
            vec![TXOutput::new(&[3], 5)],
            10,
        );
        assert_eq!(tx.get_in_len(), 3);
        assert_eq!(tx.get_inputs().len(), 2);
        assert!(tx.has_valid_id());
        assert_eq!(tx.output_total(), 5);
    }
}
