// Request/reply plumbing between nodes
// Every exchange is one JSON Package written by the caller and one Package
// written back by the server, after which the connection is closed

use crate::core::{Block, Transaction};
use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// A transaction on its way through the gossip network, with the addresses
/// of the nodes that forwarded it, most recent first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPacket {
    pub transaction: Transaction,
    pub peers: Vec<String>,
}

pub trait Transport: Send + Sync {
    /// Deliver a transaction; Ok(false) when the peer answered but rejected it
    fn send_tx(&self, addr: &str, packet: &TxPacket) -> Result<bool>;

    /// Ask a peer for the main-chain blocks after the best of `known_tips`.
    /// Returns the blocks, lowest first, and the peer's main-chain length.
    fn get_blocks(&self, addr: &str, known_tips: &[Vec<u8>]) -> Result<(Vec<Block>, u64)>;
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Package {
    Tx {
        addr_from: String,
        packet: TxPacket,
    },
    TxAck {
        accepted: bool,
    },
    GetBlocks {
        addr_from: String,
        known_tips: Vec<Vec<u8>>,
    },
    Blocks {
        blocks: Vec<Vec<u8>>,
        length: u64,
    },
    Error {
        message: String,
    },
}

impl Package {
    /// Write one package to the stream
    pub fn send(&self, stream: &TcpStream) -> Result<()> {
        let mut writer = stream;
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one package from the stream
    pub fn receive(stream: &TcpStream) -> Result<Package> {
        let reader = BufReader::new(stream);
        Deserializer::from_reader(reader)
            .into_iter::<Package>()
            .next()
            .ok_or_else(|| {
                BlockchainError::Network("Connection closed before a reply".to_string())
            })?
            .map_err(|e| BlockchainError::Network(format!("Failed to deserialize package: {e}")))
    }
}

/// `Transport` over plain TCP with a fixed per-request timeout
#[derive(Debug, Clone)]
pub struct TcpTransport {
    local_addr: String,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(local_addr: &str, timeout: Duration) -> TcpTransport {
        TcpTransport {
            local_addr: local_addr.to_string(),
            timeout,
        }
    }

    fn request(&self, addr: &str, package: &Package) -> Result<Package> {
        let socket_addr: SocketAddr = addr
            .parse()
            .map_err(|e| BlockchainError::Network(format!("Invalid peer address {addr}: {e}")))?;
        let stream = TcpStream::connect_timeout(&socket_addr, self.timeout)
            .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        package.send(&stream)?;
        stream.shutdown(Shutdown::Write)?;

        match Package::receive(&stream)? {
            Package::Error { message } => Err(BlockchainError::Network(format!(
                "Peer {addr} refused the request: {message}"
            ))),
            reply => Ok(reply),
        }
    }
}

impl Transport for TcpTransport {
    fn send_tx(&self, addr: &str, packet: &TxPacket) -> Result<bool> {
        let package = Package::Tx {
            addr_from: self.local_addr.clone(),
            packet: packet.clone(),
        };
        match self.request(addr, &package)? {
            Package::TxAck { accepted } => Ok(accepted),
            other => Err(BlockchainError::Network(format!(
                "Unexpected reply to Tx from {addr}: {other:?}"
            ))),
        }
    }

    fn get_blocks(&self, addr: &str, known_tips: &[Vec<u8>]) -> Result<(Vec<Block>, u64)> {
        let package = Package::GetBlocks {
            addr_from: self.local_addr.clone(),
            known_tips: known_tips.to_vec(),
        };
        match self.request(addr, &package)? {
            Package::Blocks { blocks, length } => {
                let blocks = blocks
                    .iter()
                    .map(|bytes| Block::deserialize(bytes))
                    .collect::<Result<Vec<Block>>>()?;
                Ok((blocks, length))
            }
            other => Err(BlockchainError::Network(format!(
                "Unexpected reply to GetBlocks from {addr}: {other:?}"
            ))),
        }
    }
}
