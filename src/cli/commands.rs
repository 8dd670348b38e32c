use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "proof-ledger")]
pub struct Opt {
    #[arg(long = "config", global = true, help = "TOML file with consensus and gossip settings")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "newkey", about = "Generate a new signing key")]
    NewKey,
    #[command(name = "createchain", about = "Create a new chain")]
    CreateChain {
        #[arg(help = "Hex public key that receives the genesis reward")]
        owner: String,
    },
    #[command(name = "balance", about = "Get the balance of a public key")]
    Balance {
        #[arg(help = "Hex public key")]
        owner: String,
    },
    #[command(name = "printchain", about = "Print all blocks of the main chain")]
    Printchain,
    #[command(name = "send", about = "Sign and submit a transfer")]
    Send {
        #[arg(long = "key", help = "Hex PKCS#8 signing key of the sender")]
        key: String,
        #[arg(long = "to", help = "Hex public key of the recipient")]
        to: String,
        #[arg(long = "amount", help = "Amount to send")]
        amount: u64,
        #[arg(long = "fee", default_value_t = 0, help = "Fee left to the miner")]
        fee: u64,
        #[arg(long = "mine", help = "Mine a block with it on this node right away")]
        mine: bool,
        #[arg(long = "node", help = "Node to submit to instead of the central node")]
        node: Option<String>,
    },
    #[command(name = "startnode", about = "Start a node")]
    StartNode {
        #[arg(long = "miner", help = "Enable mining and send rewards to this hex public key")]
        miner: Option<String>,
        #[arg(long = "peer", help = "Peer to sync from and gossip to")]
        peers: Vec<String>,
    },
}
