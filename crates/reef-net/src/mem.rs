//! In-process transport for protocol tests.
//!
//! A [`MemNetwork`] connects any number of [`MemWire`]s by address.
//! Delivery is in-order per sender but otherwise mimics an unreliable
//! transport: a wire can be told to deliver every message twice
//! (exercising the duplicate-request path) and nodes can leave, making
//! them unreachable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use reef_types::NodeAddr;
use tokio::sync::mpsc;

use crate::error::NetError;
use crate::message::{Envelope, Message};
use crate::{Inbound, InboundSender, Wire};

/// Hub connecting in-process wires by address.
pub struct MemNetwork {
    peers: Mutex<HashMap<NodeAddr, InboundSender>>,
}

impl MemNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a node at `addr`, returning its wire and inbound channel.
    pub fn join(self: &Arc<Self>, addr: NodeAddr) -> (Arc<MemWire>, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers
            .lock()
            .expect("peers lock poisoned")
            .insert(addr, tx);
        let wire = Arc::new(MemWire {
            addr,
            net: self.clone(),
            duplicate: AtomicBool::new(false),
        });
        (wire, rx)
    }

    /// Detach a node; messages to it now fail as unreachable.
    pub fn leave(&self, addr: NodeAddr) {
        self.peers
            .lock()
            .expect("peers lock poisoned")
            .remove(&addr);
    }

    fn deliver(&self, to: NodeAddr, envelope: Envelope) -> Result<(), NetError> {
        let peers = self.peers.lock().expect("peers lock poisoned");
        let tx = peers.get(&to).ok_or(NetError::Unreachable(to))?;
        tx.send(envelope).map_err(|_| NetError::Unreachable(to))
    }
}

/// In-process implementation of [`Wire`].
pub struct MemWire {
    addr: NodeAddr,
    net: Arc<MemNetwork>,
    duplicate: AtomicBool,
}

impl MemWire {
    /// When enabled, every sent message is delivered twice — simulating
    /// the retransmissions of an unreliable transport.
    pub fn set_duplicate_delivery(&self, on: bool) {
        self.duplicate.store(on, Ordering::Relaxed);
    }
}

#[async_trait::async_trait]
impl Wire for MemWire {
    fn local_addr(&self) -> NodeAddr {
        self.addr
    }

    async fn send(&self, to: NodeAddr, msg: Message) -> Result<(), NetError> {
        let envelope = Envelope {
            from: self.addr,
            msg,
        };
        if self.duplicate.load(Ordering::Relaxed) {
            // Best-effort second copy, like a spurious retransmission.
            let _ = self.net.deliver(to, envelope.clone());
        }
        self.net.deliver(to, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> NodeAddr {
        NodeAddr::new(std::net::Ipv4Addr::new(127, 0, 0, last), 4820)
    }

    #[tokio::test]
    async fn test_delivery_between_nodes() {
        let net = MemNetwork::new();
        let (a, _a_rx) = net.join(addr(1));
        let (_b, mut b_rx) = net.join(addr(2));

        a.send(addr(2), Message::TaskAckAck { task: 3 }).await.unwrap();
        let envelope = b_rx.recv().await.unwrap();
        assert_eq!(envelope.from, addr(1));
        assert_eq!(envelope.msg, Message::TaskAckAck { task: 3 });
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let net = MemNetwork::new();
        let (a, _a_rx) = net.join(addr(1));
        let result = a.send(addr(9), Message::TaskAckAck { task: 0 }).await;
        assert!(matches!(result, Err(NetError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_leave_makes_node_unreachable() {
        let net = MemNetwork::new();
        let (a, _a_rx) = net.join(addr(1));
        let (_b, _b_rx) = net.join(addr(2));

        net.leave(addr(2));
        let result = a.send(addr(2), Message::TaskAckAck { task: 0 }).await;
        assert!(matches!(result, Err(NetError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let net = MemNetwork::new();
        let (a, _a_rx) = net.join(addr(1));
        let (_b, mut b_rx) = net.join(addr(2));

        a.set_duplicate_delivery(true);
        a.send(addr(2), Message::TaskAckAck { task: 5 }).await.unwrap();

        let first = b_rx.recv().await.unwrap();
        let second = b_rx.recv().await.unwrap();
        assert_eq!(first, second, "message delivered exactly twice");
    }
}
