//! Configuration management
//!
//! `Config` holds the process-level values read from the environment (node
//! address, data directory, miner key). `NodeSettings` holds the consensus
//! and gossip parameters, optionally loaded from a TOML file.

pub mod settings;

pub use settings::{Config, ConsensusSettings, GossipSettings, NodeSettings, GLOBAL_CONFIG};
