//! Peer-to-peer networking
//!
//! A peer registry, transaction gossip over a bounded worker queue, and a
//! request/reply TCP transport with its listener.

pub mod gossip;
pub mod node;
pub mod server;
pub mod transport;

pub use gossip::{BroadcastQueue, BroadcastReport, GossipBroadcaster};
pub use node::{Node, Nodes};
pub use server::{Server, CENTRAL_NODE, TRANSACTION_THRESHOLD};
pub use transport::{Package, TcpTransport, Transport, TxPacket};
