//! Utility functions and helpers
//!
//! Cryptographic primitives, canonical hashing encodings and the bincode
//! storage encoding used throughout the ledger.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    current_timestamp, decode_key, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    encode_key, new_key_pair, public_key_from_pkcs8, sha256_digest,
};

pub use serialization::{deserialize, serialize, CanonicalEncode};
