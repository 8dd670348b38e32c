// This is my main entry point for the ledger CLI
// Every command opens the node's store under the data directory from GLOBAL_CONFIG
use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, info, warn, LevelFilter};
use proof_ledger::core::monetary::conversions::format_satoshis;
use proof_ledger::utils::{
    current_timestamp, decode_key, encode_key, new_key_pair, public_key_from_pkcs8,
};
use proof_ledger::{
    BroadcastQueue, Blockchain, Command, GossipBroadcaster, KvStore, Node, NodeSettings, Nodes, Opt,
    Server, SledStore, TXOutput, TcpTransport, Transaction, Transport, TxPacket, CENTRAL_NODE,
    GLOBAL_CONFIG,
};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    // Info by default, RUST_LOG still wins
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn load_settings(path: Option<&Path>) -> proof_ledger::Result<NodeSettings> {
    match path {
        Some(path) => NodeSettings::load(path),
        None => Ok(NodeSettings::default()),
    }
}

fn open_store() -> proof_ledger::Result<Arc<SledStore>> {
    let db_path = GLOBAL_CONFIG.node_db_path();
    Ok(Arc::new(SledStore::open(Path::new(&db_path))?))
}

fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings(opt.config.as_deref())?;
    match opt.command {
        Command::NewKey => {
            let pkcs8 = new_key_pair()?;
            let public = public_key_from_pkcs8(&pkcs8)?;
            println!("Private key: {}", encode_key(&pkcs8));
            println!("Public key: {}", encode_key(&public));
        }
        Command::CreateChain { owner } => {
            let owner = decode_key(&owner)?;
            let store = open_store()?;
            let chain = Blockchain::create(store.clone(), settings, &owner)?;
            store.close()?;
            println!("Done! Tip: {}", HEXLOWER.encode(&chain.current_main_chain_tip()));
        }
        Command::Balance { owner } => {
            let owner_key = decode_key(&owner)?;
            let chain = Blockchain::open(open_store()?, settings)?;
            let balance = chain.balance_of(&owner_key);
            println!("Balance of {owner}: {balance} ({})", format_satoshis(balance));
        }
        Command::Printchain => {
            let chain = Blockchain::open(open_store()?, settings)?;
            for block in chain.iterator() {
                let block = block?;
                println!("Height: {}", block.get_height());
                println!("Prev block hash: {}", HEXLOWER.encode(block.get_prev_hash()));
                println!("Cur block hash: {}", HEXLOWER.encode(block.get_hash()));
                println!("Timestamp: {}", block.get_timestamp());
                for tx in block.transactions() {
                    println!("- Transaction {}", HEXLOWER.encode(tx.get_id()));
                    for input in tx.get_inputs() {
                        println!(
                            "-- Input {}:{}",
                            HEXLOWER.encode(input.get_prev_tx()),
                            input.get_index()
                        );
                    }
                    for output in tx.get_outputs() {
                        println!(
                            "-- Output value = {}, to = {}",
                            output.get_value(),
                            HEXLOWER.encode(output.get_owner())
                        );
                    }
                }
                println!()
            }
        }
        Command::Send {
            key,
            to,
            amount,
            fee,
            mine,
            node,
        } => {
            if amount == 0 {
                return Err("Amount must be positive".into());
            }
            let pkcs8 = decode_key(&key)?;
            let from = public_key_from_pkcs8(&pkcs8)?;
            let to = decode_key(&to)?;
            let needed = amount.checked_add(fee).ok_or("Amount plus fee overflows")?;

            let store = open_store()?;
            let chain = Blockchain::open(store.clone(), settings)?;
            let (available, points) = chain.find_spendable_outputs(&from, needed)?;
            if available < needed {
                return Err(
                    format!("Insufficient funds: {available} available, {needed} needed").into(),
                );
            }
            let mut outputs = vec![TXOutput::new(&to, amount)];
            if available > needed {
                outputs.push(TXOutput::new(&from, available - needed));
            }
            let tx = Transaction::new_signed(&pkcs8, &points, outputs, current_timestamp()?)?;

            if mine {
                chain.accept_transaction(tx)?;
                let block = chain.mine_block(&from)?;
                store.close()?;
                println!("Mined block {}", HEXLOWER.encode(block.get_hash()));
            } else {
                let addr = node.unwrap_or_else(|| CENTRAL_NODE.to_string());
                let timeout = Duration::from_millis(chain.get_settings().gossip.rpc_timeout_ms);
                let transport = TcpTransport::new(&GLOBAL_CONFIG.get_node_addr(), timeout);
                let packet = TxPacket {
                    transaction: tx,
                    peers: vec![],
                };
                if !transport.send_tx(&addr, &packet)? {
                    return Err(format!("Node {addr} rejected the transaction").into());
                }
            }
            println!("Success!")
        }
        Command::StartNode { miner, peers } => {
            let local_addr = GLOBAL_CONFIG.get_node_addr();
            if let Some(miner) = miner {
                decode_key(&miner)?;
                println!("Mining is on. Rewards go to: {miner}");
                GLOBAL_CONFIG.set_miner_key(miner);
            }

            let chain = Arc::new(Blockchain::open(open_store()?, settings.clone())?);
            let nodes = Arc::new(Nodes::new());
            nodes.add_addrs(peers.iter().filter(|peer| **peer != local_addr).cloned());
            let transport = Arc::new(TcpTransport::new(
                &local_addr,
                Duration::from_millis(settings.gossip.rpc_timeout_ms),
            ));

            for peer in nodes.get_nodes().iter().map(Node::get_addr) {
                match chain.sync_with_peer(transport.as_ref(), &peer) {
                    Ok(count) => info!("Synced {count} blocks from {peer}"),
                    Err(e) => warn!("Failed to sync from {peer}: {e}"),
                }
            }

            let broadcaster = Arc::new(GossipBroadcaster::new(
                &local_addr,
                Arc::clone(&nodes),
                transport,
                settings.gossip.clone(),
            ));
            chain.set_broadcaster(BroadcastQueue::start(
                broadcaster,
                settings.gossip.broadcast_workers,
                settings.gossip.queue_capacity,
            ))?;

            let server = Server::new(chain, nodes, &local_addr);
            server.run().map_err(|e| format!("Server error: {e}"))?
        }
    }
    Ok(())
}
