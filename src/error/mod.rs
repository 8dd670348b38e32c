//! Error handling for the ledger
//!
//! `BlockchainError` is the crate-wide error. Merkle, transaction and chain
//! validation each have their own closed enum carrying the diagnostic fields
//! of the failure, wrapped by `BlockchainError` so `?` works everywhere.

use data_encoding::HEXLOWER;
use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Broad category of a failure, used when reporting a rejection to a submitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Computed hash does not match the declared identity
    Identity,
    /// Timestamp too far in the future or not after its inputs
    Temporal,
    /// Duplicates, unknown references, insufficient funds, length mismatches
    Consistency,
    /// Malformed Merkle content
    Structural,
    /// Signature verification failure
    Authorization,
    /// Storage, network, serialization or configuration trouble
    Infrastructure,
}

/// Structural errors raised while rebuilding a serialized Merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    /// No items to commit
    Empty,
    /// Serialized content has fewer than two rows
    TooFewRows { rows: usize },
    /// A row does not have `ceil(previous / 2)` entries
    RowSize {
        row: usize,
        expected: usize,
        actual: usize,
    },
    /// A leaf entry carries no value, or an inner entry carries one
    MisplacedValue { row: usize, position: usize },
    /// A node's parent hash is absent or not in the next row
    MissingParent { row: usize, hash: Vec<u8> },
    /// A node's sibling hash is absent or not its pair partner
    MissingSibling { row: usize, hash: Vec<u8> },
    /// A promoted entry does not repeat the node it was promoted from
    BrokenPromotion { row: usize },
    /// A row references fewer distinct parents than the next row holds
    ParentCount {
        row: usize,
        distinct: usize,
        expected: usize,
    },
    /// The same hash appears on two different nodes
    DuplicateHash { row: usize, hash: Vec<u8> },
}

impl fmt::Display for MerkleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MerkleError::Empty => write!(f, "cannot build a Merkle tree from no items"),
            MerkleError::TooFewRows { rows } => write!(f, "tree has {rows} rows, need at least 2"),
            MerkleError::RowSize {
                row,
                expected,
                actual,
            } => write!(f, "row {row} has {actual} nodes, expected {expected}"),
            MerkleError::MisplacedValue { row, position } => {
                write!(f, "unexpected or missing value at row {row} position {position}")
            }
            MerkleError::MissingParent { row, hash } => {
                write!(f, "parent of {} in row {row} not found", HEXLOWER.encode(hash))
            }
            MerkleError::MissingSibling { row, hash } => {
                write!(f, "sibling of {} in row {row} not found", HEXLOWER.encode(hash))
            }
            MerkleError::BrokenPromotion { row } => {
                write!(f, "last node of row {row} is not the promoted node")
            }
            MerkleError::ParentCount {
                row,
                distinct,
                expected,
            } => write!(
                f,
                "row {row} references {distinct} distinct parents, next row has {expected}"
            ),
            MerkleError::DuplicateHash { row, hash } => {
                write!(f, "duplicate hash {} in row {row}", HEXLOWER.encode(hash))
            }
        }
    }
}

impl std::error::Error for MerkleError {}

/// Transaction validation failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    IdentityMismatch { declared: Vec<u8>, computed: Vec<u8> },
    Duplicate { id: Vec<u8> },
    FutureTimestamp { timestamp: i64, limit: i64 },
    InputLenMismatch { declared: u32, actual: usize },
    OutputLenMismatch { declared: u32, actual: usize },
    UnknownPrevious { id: Vec<u8> },
    OutputIndexOutOfRange { id: Vec<u8>, index: u32, outputs: usize },
    NotAfterPrevious { previous: i64, timestamp: i64 },
    BadSignature { input: usize },
    InsufficientFunds { inputs: u64, outputs: u64 },
    AlreadySpent { id: Vec<u8>, index: u32 },
    PendingConflict { id: Vec<u8>, index: u32 },
    UnexpectedCoinbase,
    CoinbaseReward { allowed: u64, claimed: u64 },
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::IdentityMismatch { declared, computed } => write!(
                f,
                "transaction id {} does not match content hash {}",
                HEXLOWER.encode(declared),
                HEXLOWER.encode(computed)
            ),
            TxError::Duplicate { id } => {
                write!(f, "transaction {} already exists", HEXLOWER.encode(id))
            }
            TxError::FutureTimestamp { timestamp, limit } => {
                write!(f, "timestamp {timestamp} is beyond the allowed {limit}")
            }
            TxError::InputLenMismatch { declared, actual } => {
                write!(f, "declared {declared} inputs, found {actual}")
            }
            TxError::OutputLenMismatch { declared, actual } => {
                write!(f, "declared {declared} outputs, found {actual}")
            }
            TxError::UnknownPrevious { id } => {
                write!(f, "previous transaction {} not found", HEXLOWER.encode(id))
            }
            TxError::OutputIndexOutOfRange { id, index, outputs } => write!(
                f,
                "output {index} of {} out of range ({outputs} outputs)",
                HEXLOWER.encode(id)
            ),
            TxError::NotAfterPrevious {
                previous,
                timestamp,
            } => write!(
                f,
                "timestamp {timestamp} is not after previous transaction at {previous}"
            ),
            TxError::BadSignature { input } => write!(f, "signature of input {input} is invalid"),
            TxError::InsufficientFunds { inputs, outputs } => {
                write!(f, "insufficient funds: inputs {inputs}, outputs {outputs}")
            }
            TxError::AlreadySpent { id, index } => {
                write!(f, "output {}:{index} already spent", HEXLOWER.encode(id))
            }
            TxError::PendingConflict { id, index } => write!(
                f,
                "output {}:{index} is already claimed by a pending transaction",
                HEXLOWER.encode(id)
            ),
            TxError::UnexpectedCoinbase => write!(f, "coinbase transaction not allowed here"),
            TxError::CoinbaseReward { allowed, claimed } => {
                write!(f, "coinbase claims {claimed}, allowed {allowed}")
            }
        }
    }
}

impl std::error::Error for TxError {}

/// Block and fork-choice failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    HashMismatch { declared: Vec<u8>, computed: Vec<u8> },
    DuplicateBlock { hash: Vec<u8> },
    UnknownParent { hash: Vec<u8> },
    BadHeight { expected: u64, actual: u64 },
    FutureTimestamp { timestamp: i64, limit: i64 },
    BeforeParent { parent: i64, timestamp: i64 },
    UnexpectedDifficulty,
    UnexpectedInterval { expected: i64, actual: i64 },
    InsufficientWork,
    RootMismatch,
    InvalidContent,
    MissingCoinbase,
    InvalidBranch { reason: String },
    MissingBlock { hash: Vec<u8> },
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::HashMismatch { declared, computed } => write!(
                f,
                "block hash {} does not match header hash {}",
                HEXLOWER.encode(declared),
                HEXLOWER.encode(computed)
            ),
            ChainError::DuplicateBlock { hash } => {
                write!(f, "block {} already known", HEXLOWER.encode(hash))
            }
            ChainError::UnknownParent { hash } => {
                write!(f, "parent block {} not found", HEXLOWER.encode(hash))
            }
            ChainError::BadHeight { expected, actual } => {
                write!(f, "block height {actual}, expected {expected}")
            }
            ChainError::FutureTimestamp { timestamp, limit } => {
                write!(f, "block timestamp {timestamp} is beyond the allowed {limit}")
            }
            ChainError::BeforeParent { parent, timestamp } => {
                write!(f, "block timestamp {timestamp} precedes parent at {parent}")
            }
            ChainError::UnexpectedDifficulty => {
                write!(f, "difficulty target does not follow the adjustment rule")
            }
            ChainError::UnexpectedInterval { expected, actual } => {
                write!(f, "interval total {actual}, expected {expected}")
            }
            ChainError::InsufficientWork => write!(f, "block hash does not meet its target"),
            ChainError::RootMismatch => write!(f, "root hash does not match block content"),
            ChainError::InvalidContent => write!(f, "block content fails Merkle validation"),
            ChainError::MissingCoinbase => write!(f, "first transaction must be the only coinbase"),
            ChainError::InvalidBranch { reason } => write!(f, "branch rejected: {reason}"),
            ChainError::MissingBlock { hash } => {
                write!(f, "stored block {} is missing", HEXLOWER.encode(hash))
            }
        }
    }
}

impl std::error::Error for ChainError {}

/// Crate-wide error type
#[derive(Debug, Clone, PartialEq)]
pub enum BlockchainError {
    /// Database-related errors
    Database(String),
    /// Cryptographic operation errors
    Crypto(String),
    /// Network communication errors
    Network(String),
    /// Configuration errors
    Config(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Mining errors
    Mining(String),
    /// Merkle structure errors
    Merkle(MerkleError),
    /// Transaction validation errors
    Transaction(TxError),
    /// Block and chain errors
    Chain(ChainError),
}

impl BlockchainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlockchainError::Merkle(_) => ErrorKind::Structural,
            BlockchainError::Transaction(err) => match err {
                TxError::IdentityMismatch { .. } => ErrorKind::Identity,
                TxError::FutureTimestamp { .. } | TxError::NotAfterPrevious { .. } => {
                    ErrorKind::Temporal
                }
                TxError::BadSignature { .. } => ErrorKind::Authorization,
                _ => ErrorKind::Consistency,
            },
            BlockchainError::Chain(err) => match err {
                ChainError::HashMismatch { .. } => ErrorKind::Identity,
                ChainError::FutureTimestamp { .. } | ChainError::BeforeParent { .. } => {
                    ErrorKind::Temporal
                }
                ChainError::RootMismatch | ChainError::InvalidContent => ErrorKind::Structural,
                _ => ErrorKind::Consistency,
            },
            _ => ErrorKind::Infrastructure,
        }
    }
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Database(msg) => write!(f, "Database error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::Mining(msg) => write!(f, "Mining error: {msg}"),
            BlockchainError::Merkle(err) => write!(f, "Merkle error: {err}"),
            BlockchainError::Transaction(err) => write!(f, "Transaction error: {err}"),
            BlockchainError::Chain(err) => write!(f, "Invalid block: {err}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<MerkleError> for BlockchainError {
    fn from(err: MerkleError) -> Self {
        BlockchainError::Merkle(err)
    }
}

impl From<TxError> for BlockchainError {
    fn from(err: TxError) -> Self {
        BlockchainError::Transaction(err)
    }
}

impl From<ChainError> for BlockchainError {
    fn from(err: ChainError) -> Self {
        BlockchainError::Chain(err)
    }
}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}
