use log::warn;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

/// A known peer and how often sending to it has failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    addr: String,
    failed: u32,
}

impl Node {
    fn new(addr: String) -> Node {
        Node { addr, failed: 0 }
    }

    pub fn get_addr(&self) -> String {
        self.addr.clone()
    }
}

/// Peer registry keyed by address
///
/// Failure counters only ever grow; a peer leaves the registry once its
/// count passes the eviction threshold.
pub struct Nodes {
    inner: RwLock<HashMap<String, Node>>,
}

impl Default for Nodes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nodes {
    pub fn new() -> Nodes {
        Nodes {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register a peer; false when the address is malformed or already known
    pub fn add_node(&self, addr: String) -> bool {
        if addr.parse::<SocketAddr>().is_err() {
            warn!("Ignoring malformed peer address {addr}");
            return false;
        }
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on nodes - this should never happen");
        if inner.contains_key(&addr) {
            return false;
        }
        inner.insert(addr.clone(), Node::new(addr));
        true
    }

    /// Register every valid, unknown address; returns how many were added
    pub fn add_addrs<I, S>(&self, addrs: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        addrs
            .into_iter()
            .map(Into::into)
            .filter(|addr: &String| self.add_node(addr.clone()))
            .count()
    }

    /// Bump the failure counter of a peer, returning the new count
    pub fn record_failure(&self, addr: &str) -> Option<u32> {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on nodes - this should never happen");
        let node = inner.get_mut(addr)?;
        node.failed = node.failed.saturating_add(1);
        Some(node.failed)
    }

    pub fn failure_count(&self, addr: &str) -> Option<u32> {
        self.inner
            .read()
            .expect("Failed to acquire read lock on nodes - this should never happen")
            .get(addr)
            .map(|node| node.failed)
    }

    /// Remove every peer whose failure count exceeds `max_failed_count`
    pub fn evict_failed(&self, max_failed_count: u32) -> Vec<String> {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on nodes - this should never happen");
        let evicted: Vec<String> = inner
            .values()
            .filter(|node| node.failed > max_failed_count)
            .map(|node| node.addr.clone())
            .collect();
        for addr in &evicted {
            inner.remove(addr);
            warn!("Evicted peer {addr} after repeated failures");
        }
        evicted
    }

    /// Point-in-time copy of every known address
    pub fn get_addrs(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("Failed to acquire read lock on nodes - this should never happen")
            .keys()
            .cloned()
            .collect()
    }

    pub fn get_nodes(&self) -> Vec<Node> {
        self.inner
            .read()
            .expect("Failed to acquire read lock on nodes - this should never happen")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("Failed to acquire read lock on nodes - this should never happen")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .expect("Failed to acquire read lock on nodes - this should never happen")
            .is_empty()
    }

    pub fn node_is_known(&self, addr: &str) -> bool {
        self.inner
            .read()
            .expect("Failed to acquire read lock on nodes - this should never happen")
            .contains_key(addr)
    }
}
