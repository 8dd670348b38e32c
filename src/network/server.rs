use crate::config::GLOBAL_CONFIG;
use crate::core::Blockchain;
use crate::error::{BlockchainError, Result};
use crate::network::{Nodes, Package, TxPacket};
use crate::utils::decode_key;
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const CENTRAL_NODE: &str = "127.0.0.1:2001";
pub const TRANSACTION_THRESHOLD: usize = 10;
const TCP_READ_TIMEOUT: u64 = 5000;

/// Listener side of the node: accepts gossiped transactions and serves blocks
pub struct Server {
    blockchain: Arc<Blockchain>,
    nodes: Arc<Nodes>,
    local_addr: String,
    miner: Option<Arc<Vec<u8>>>,
    // set while a connection thread is mining, so blocks are mined one at a time
    mining: Arc<AtomicBool>,
}

impl Server {
    /// Mining is on when GLOBAL_CONFIG holds a miner key
    pub fn new(blockchain: Arc<Blockchain>, nodes: Arc<Nodes>, local_addr: &str) -> Self {
        let miner = GLOBAL_CONFIG
            .get_miner_key()
            .and_then(|key| match decode_key(&key) {
                Ok(miner) => Some(miner),
                Err(e) => {
                    error!("Invalid miner key, mining is off: {e}");
                    None
                }
            });
        Self {
            blockchain,
            nodes,
            local_addr: local_addr.to_string(),
            miner: miner.map(Arc::new),
            mining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send mining rewards to `miner`, or stop mining with `None`
    pub fn with_miner(mut self, miner: Option<Vec<u8>>) -> Self {
        self.miner = miner.map(Arc::new);
        self
    }

    /// Bind the local address and serve until the process exits
    pub fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.local_addr).map_err(|e| {
            BlockchainError::Network(format!("Failed to bind to {}: {e}", self.local_addr))
        })?;
        info!("Server listening on {}", self.local_addr);
        self.serve(listener);
        Ok(())
    }

    /// Handle every connection of `listener` on its own thread
    pub fn serve(&self, listener: TcpListener) {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let connection = Connection {
                        blockchain: Arc::clone(&self.blockchain),
                        nodes: Arc::clone(&self.nodes),
                        local_addr: self.local_addr.clone(),
                        miner: self.miner.clone(),
                        mining: Arc::clone(&self.mining),
                    };
                    thread::spawn(move || {
                        let peer = stream
                            .peer_addr()
                            .map(|addr| addr.to_string())
                            .unwrap_or_else(|_| "unknown peer".to_string());
                        if let Err(e) = connection.handle(stream) {
                            error!("Error handling connection from {peer}: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
    }

    fn process_message(
        blockchain: &Blockchain,
        nodes: &Nodes,
        local_addr: &str,
        pkg: Package,
    ) -> Package {
        match pkg {
            Package::Tx { addr_from, packet } => {
                Self::handle_tx_message(blockchain, nodes, local_addr, &addr_from, packet)
            }
            Package::GetBlocks {
                addr_from,
                known_tips,
            } => {
                debug!("GetBlocks from {addr_from} with {} known tips", known_tips.len());
                match Self::encode_blocks(blockchain, &known_tips) {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!("Failed to collect blocks for {addr_from}: {e}");
                        Package::Error {
                            message: e.to_string(),
                        }
                    }
                }
            }
            other => Package::Error {
                message: format!("unexpected request {other:?}"),
            },
        }
    }

    fn handle_tx_message(
        blockchain: &Blockchain,
        nodes: &Nodes,
        local_addr: &str,
        addr_from: &str,
        packet: TxPacket,
    ) -> Package {
        // every forwarder on the way is a peer worth knowing
        let learned = nodes.add_addrs(
            packet
                .peers
                .iter()
                .filter(|addr| addr.as_str() != local_addr)
                .cloned(),
        );
        if learned > 0 {
            info!("Learned {learned} peers from {addr_from}");
        }

        let txid = HEXLOWER.encode(packet.transaction.get_id());
        let accepted = match blockchain.accept_transaction(packet.transaction) {
            Ok(fee) => {
                info!("Accepted transaction {txid} from {addr_from} with fee {fee}");
                true
            }
            Err(e) => {
                debug!("Rejected transaction {txid} from {addr_from}: {e}");
                false
            }
        };
        Package::TxAck { accepted }
    }

    fn encode_blocks(blockchain: &Blockchain, known_tips: &[Vec<u8>]) -> Result<Package> {
        let (blocks, length) = blockchain.get_blocks(known_tips)?;
        let blocks = blocks
            .iter()
            .map(|block| block.serialize())
            .collect::<Result<Vec<Vec<u8>>>>()?;
        Ok(Package::Blocks { blocks, length })
    }
}

// What one connection thread needs from the server
struct Connection {
    blockchain: Arc<Blockchain>,
    nodes: Arc<Nodes>,
    local_addr: String,
    miner: Option<Arc<Vec<u8>>>,
    mining: Arc<AtomicBool>,
}

impl Connection {
    // I reply first and mine afterwards, so the sender never waits on proof of work
    fn handle(&self, stream: TcpStream) -> Result<()> {
        stream
            .set_read_timeout(Some(Duration::from_millis(TCP_READ_TIMEOUT)))
            .map_err(|e| BlockchainError::Network(format!("Failed to set read timeout: {e}")))?;

        let request = Package::receive(&stream)?;
        let reply =
            Server::process_message(&self.blockchain, &self.nodes, &self.local_addr, request);
        reply.send(&stream)?;
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            warn!("Failed to shut down connection: {e}");
        }

        if matches!(reply, Package::TxAck { accepted: true })
            && self.blockchain.get_mempool().len() >= TRANSACTION_THRESHOLD
        {
            self.try_mine_block();
        }
        Ok(())
    }

    fn try_mine_block(&self) {
        let Some(miner) = &self.miner else {
            return;
        };
        if self
            .mining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Another connection is already mining");
            return;
        }
        match self.blockchain.mine_block(miner) {
            Ok(block) => info!("New block {} is mined!", HEXLOWER.encode(block.get_hash())),
            Err(e) => warn!("Failed to mine block: {e}"),
        }
        self.mining.store(false, Ordering::Release);
    }
}
