//! Transaction gossip
//!
//! `GossipBroadcaster` forwards a transaction to a random subset of known
//! peers and keeps their failure counters. `BroadcastQueue` decouples the
//! broadcast from transaction acceptance: submissions go into a bounded
//! channel drained by a fixed pool of worker threads.

use crate::config::GossipSettings;
use crate::core::Transaction;
use crate::network::{Nodes, Transport, TxPacket};
use data_encoding::HEXLOWER;
use log::{error, info, warn};
use rand::seq::SliceRandom;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Outcome of one broadcast pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub accepted: usize,
    pub failed: Vec<String>,
    pub evicted: Vec<String>,
}

pub struct GossipBroadcaster {
    local_addr: String,
    nodes: Arc<Nodes>,
    transport: Arc<dyn Transport>,
    settings: GossipSettings,
}

impl GossipBroadcaster {
    pub fn new(
        local_addr: &str,
        nodes: Arc<Nodes>,
        transport: Arc<dyn Transport>,
        settings: GossipSettings,
    ) -> GossipBroadcaster {
        GossipBroadcaster {
            local_addr: local_addr.to_string(),
            nodes,
            transport,
            settings,
        }
    }

    pub fn get_nodes(&self) -> &Arc<Nodes> {
        &self.nodes
    }

    /// A random subset of at most `max_broadcast_nodes` distinct peers
    pub fn pick_peers(&self) -> Vec<String> {
        // the read lock is released once get_addrs returns
        let mut addrs = self.nodes.get_addrs();
        addrs.retain(|addr| *addr != self.local_addr);
        let mut rng = rand::thread_rng();
        addrs
            .choose_multiple(&mut rng, self.settings.max_broadcast_nodes)
            .cloned()
            .collect()
    }

    /// Send `tx` to a random subset of peers in parallel, count the failures
    /// and evict peers past the threshold
    pub fn send_tx(&self, tx: &Transaction) -> BroadcastReport {
        let targets = self.pick_peers();
        let mut peers = Vec::with_capacity(targets.len() + 1);
        peers.push(self.local_addr.clone());
        peers.extend(targets.iter().cloned());
        let packet = TxPacket {
            transaction: tx.clone(),
            peers,
        };

        let outcomes: Vec<(String, bool, bool)> = thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|addr| {
                    let packet = &packet;
                    let transport = &self.transport;
                    scope.spawn(move || match transport.send_tx(addr, packet) {
                        Ok(accepted) => (addr.clone(), true, accepted),
                        Err(e) => {
                            warn!("Failed to send transaction to {addr}: {e}");
                            (addr.clone(), false, false)
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(targets.iter())
                .map(|(handle, addr)| match handle.join() {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!("Broadcast worker for {addr} panicked");
                        (addr.clone(), false, false)
                    }
                })
                .collect()
        });

        let mut report = BroadcastReport {
            attempted: outcomes.len(),
            ..BroadcastReport::default()
        };
        for (addr, reached, accepted) in outcomes {
            if !reached {
                self.nodes.record_failure(&addr);
                report.failed.push(addr);
            } else if accepted {
                report.accepted += 1;
            }
        }
        report.evicted = self.nodes.evict_failed(self.settings.max_failed_count);

        info!(
            "Broadcast {} to {} peers: {} accepted, {} failed, {} evicted",
            HEXLOWER.encode(tx.get_id()),
            report.attempted,
            report.accepted,
            report.failed.len(),
            report.evicted.len()
        );
        report
    }
}

/// Bounded queue of transactions waiting to be broadcast
pub struct BroadcastQueue {
    sender: Option<SyncSender<Transaction>>,
    workers: Vec<JoinHandle<()>>,
}

impl BroadcastQueue {
    pub fn start(
        broadcaster: Arc<GossipBroadcaster>,
        workers: usize,
        capacity: usize,
    ) -> BroadcastQueue {
        let (sender, receiver) = sync_channel::<Transaction>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..workers.max(1))
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let broadcaster = Arc::clone(&broadcaster);
                thread::spawn(move || Self::work(id, &receiver, &broadcaster))
            })
            .collect();
        BroadcastQueue {
            sender: Some(sender),
            workers,
        }
    }

    fn work(id: usize, receiver: &Mutex<Receiver<Transaction>>, broadcaster: &GossipBroadcaster) {
        loop {
            let next = match receiver.lock() {
                Ok(guard) => guard.recv(),
                Err(_) => {
                    error!("Broadcast worker {id}: queue lock poisoned");
                    return;
                }
            };
            match next {
                Ok(tx) => {
                    broadcaster.send_tx(&tx);
                }
                // every sender is gone
                Err(_) => return,
            }
        }
    }

    /// Queue `tx` for broadcast without blocking; false when it was dropped
    pub fn enqueue(&self, tx: Transaction) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(tx) {
            Ok(()) => true,
            Err(TrySendError::Full(tx)) => {
                warn!(
                    "Broadcast queue full, dropping transaction {}",
                    HEXLOWER.encode(tx.get_id())
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("Broadcast workers are gone");
                false
            }
        }
    }
}

impl Drop for BroadcastQueue {
    fn drop(&mut self) {
        // closing the channel lets the workers finish what is queued and exit
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Broadcast worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Block;
    use crate::error::{BlockchainError, Result};
    use std::collections::HashSet;
    use std::sync::Barrier;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        failing: HashSet<String>,
    }

    impl Transport for Recording {
        fn send_tx(&self, addr: &str, packet: &TxPacket) -> Result<bool> {
            self.calls
                .lock()
                .unwrap()
                .push((addr.to_string(), packet.peers.clone()));
            if self.failing.contains(addr) {
                return Err(BlockchainError::Network("unreachable".to_string()));
            }
            Ok(true)
        }

        fn get_blocks(&self, _addr: &str, _known: &[Vec<u8>]) -> Result<(Vec<Block>, u64)> {
            Ok((vec![], 0))
        }
    }

    fn broadcaster(transport: Arc<Recording>, peers: usize) -> GossipBroadcaster {
        let nodes = Arc::new(Nodes::new());
        nodes.add_addrs((0..peers).map(|i| format!("127.0.0.1:{}", 4000 + i)));
        GossipBroadcaster::new("127.0.0.1:2001", nodes, transport, GossipSettings::default())
    }

    #[test]
    fn test_local_address_is_never_picked() {
        let transport = Arc::new(Recording::default());
        let gossip = broadcaster(transport, 3);
        gossip.get_nodes().add_node("127.0.0.1:2001".to_string());
        for _ in 0..10 {
            assert!(!gossip.pick_peers().contains(&"127.0.0.1:2001".to_string()));
        }
    }

    #[test]
    fn test_send_tx_counts_failures() {
        let mut recording = Recording::default();
        recording.failing.insert("127.0.0.1:4001".to_string());
        let transport = Arc::new(recording);
        let gossip = broadcaster(transport.clone(), 2);

        let report = gossip.send_tx(&Transaction::new_coinbase(&[1], 1, 0));
        assert_eq!(report.attempted, 2);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.failed, vec!["127.0.0.1:4001".to_string()]);
        assert_eq!(gossip.get_nodes().failure_count("127.0.0.1:4001"), Some(1));
        assert_eq!(gossip.get_nodes().failure_count("127.0.0.1:4000"), Some(0));
    }

    struct Gate {
        barrier: Barrier,
        sent: Mutex<usize>,
    }

    impl Transport for Gate {
        fn send_tx(&self, _addr: &str, _packet: &TxPacket) -> Result<bool> {
            self.barrier.wait();
            *self.sent.lock().unwrap() += 1;
            Ok(true)
        }

        fn get_blocks(&self, _addr: &str, _known: &[Vec<u8>]) -> Result<(Vec<Block>, u64)> {
            Ok((vec![], 0))
        }
    }

    #[test]
    fn test_queue_drops_when_full() {
        let gate = Arc::new(Gate {
            barrier: Barrier::new(2),
            sent: Mutex::new(0),
        });
        let nodes = Arc::new(Nodes::new());
        nodes.add_node("127.0.0.1:4000".to_string());
        let gossip = Arc::new(GossipBroadcaster::new(
            "127.0.0.1:2001",
            nodes,
            gate.clone(),
            GossipSettings::default(),
        ));
        let queue = BroadcastQueue::start(gossip, 1, 1);

        // the worker takes the first one and blocks on the gate
        assert!(queue.enqueue(Transaction::new_coinbase(&[1], 1, 0)));
        let mut accepted = 1;
        // one slot in the channel; at least one of these has to be dropped
        for stamp in 1..4 {
            if queue.enqueue(Transaction::new_coinbase(&[1], 1, stamp)) {
                accepted += 1;
            }
        }
        assert!(accepted < 4);
        for _ in 0..accepted {
            gate.barrier.wait();
        }
        drop(queue);
        assert_eq!(*gate.sent.lock().unwrap(), accepted);
    }
}
