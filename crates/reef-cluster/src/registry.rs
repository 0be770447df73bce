//! Interned node identities.
//!
//! Every endpoint ever observed by this process is represented by exactly
//! one [`Node`], created on first contact and never destroyed. Interning
//! means later lookups return the same `Arc`, so identity comparisons can
//! use [`Arc::ptr_eq`] instead of comparing addresses.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use reef_types::{Heartbeat, NodeAddr};
use tracing::debug;

use crate::ledger::TaskLedger;

/// Current wall clock in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A node in the Reef cluster — a worker with CPUs, memory and a slice of
/// the shared address space. One of these is the local node; the rest are
/// peers.
///
/// The dense `index` is assigned at intern time, unique within this
/// process and skipping zero. It is used as a bit position in per-value
/// replica bitmaps and as a slot in per-node tables. Indices are
/// per-process; different nodes do not agree on them.
///
/// The heartbeat slots are plain atomics: a received heartbeat overwrites
/// the latest-known snapshot without taking a lock.
pub struct Node {
    addr: NodeAddr,
    index: u32,
    last_heard_ms: AtomicU64,
    beat_view_id: AtomicU64,
    beat_keys: AtomicU64,
    beat_free_mem: AtomicU64,
    /// Remote tasks this peer has asked us to run.
    ledger: TaskLedger,
    /// Ids for tasks we send to this peer, unique per (us, peer) pair.
    next_task: AtomicU64,
}

impl Node {
    fn new(addr: NodeAddr, index: u32) -> Self {
        Self {
            addr,
            index,
            last_heard_ms: AtomicU64::new(unix_millis()),
            beat_view_id: AtomicU64::new(0),
            beat_keys: AtomicU64::new(0),
            beat_free_mem: AtomicU64::new(0),
            ledger: TaskLedger::new(),
            next_task: AtomicU64::new(1),
        }
    }

    /// This node's endpoint address.
    pub fn addr(&self) -> NodeAddr {
        self.addr
    }

    /// The dense unique index assigned at intern time (never 0).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Overwrite the health snapshot with a freshly received heartbeat.
    pub fn observe_heartbeat(&self, beat: &Heartbeat) {
        self.beat_view_id.store(beat.view_id, Ordering::Relaxed);
        self.beat_keys.store(beat.keys, Ordering::Relaxed);
        self.beat_free_mem.store(beat.free_mem, Ordering::Relaxed);
        self.last_heard_ms.store(unix_millis(), Ordering::Relaxed);
    }

    /// The latest-known health snapshot.
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            view_id: self.beat_view_id.load(Ordering::Relaxed),
            keys: self.beat_keys.load(Ordering::Relaxed),
            free_mem: self.beat_free_mem.load(Ordering::Relaxed),
            sent_at_ms: self.last_heard_ms.load(Ordering::Relaxed),
        }
    }

    /// The cluster view id this node last reported.
    pub fn reported_view_id(&self) -> u64 {
        self.beat_view_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_reported_view(&self, view_id: u64) {
        self.beat_view_id.store(view_id, Ordering::Relaxed);
    }

    /// Milliseconds since the Unix epoch when we last heard from this node.
    pub fn last_heard_ms(&self) -> u64 {
        self.last_heard_ms.load(Ordering::Relaxed)
    }

    /// Whether this node has been silent longer than `max_silence_ms`.
    pub fn is_stale(&self, now_ms: u64, max_silence_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heard_ms()) > max_silence_ms
    }

    /// Table of remote tasks this peer has asked us to run.
    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    /// Allocate the next task id for a request we send to this peer.
    /// Ids start at 1 and are unique for the lifetime of the process.
    pub fn next_task_id(&self) -> u64 {
        self.next_task.fetch_add(1, Ordering::Relaxed)
    }

    /// This peer rebooted: its task history with us is void. Duplicate
    /// messages arriving after this belong to a new logical session.
    pub fn mark_rebooted(&self) {
        self.ledger.clear();
        debug!(node = %self.addr, "cleared task history for rebooted peer");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({}#{})", self.addr, self.index)
    }
}

/// Intern table mapping every address ever seen to its canonical [`Node`].
///
/// `intern` is idempotent and safe under concurrent calls: exactly one
/// `Node` is ever created per distinct address, and callers racing to
/// create one all observe the same `Arc`.
pub struct NodeRegistry {
    nodes: DashMap<NodeAddr, Arc<Node>>,
    by_index: DashMap<u32, Arc<Node>>,
    next_index: AtomicU32,
}

impl NodeRegistry {
    /// Create an empty registry. Index assignment starts at 1; zero is
    /// never handed out.
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            by_index: DashMap::new(),
            next_index: AtomicU32::new(1),
        }
    }

    /// Return the canonical node for `addr`, creating it on first contact.
    pub fn intern(&self, addr: NodeAddr) -> Arc<Node> {
        if let Some(node) = self.nodes.get(&addr) {
            return node.clone();
        }
        let node = self
            .nodes
            .entry(addr)
            .or_insert_with(|| {
                let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                debug!(node = %addr, index, "interned new node");
                Arc::new(Node::new(addr, index))
            })
            .clone();
        self.by_index
            .entry(node.index())
            .or_insert_with(|| node.clone());
        node
    }

    /// Look up a node by address without creating it.
    pub fn get(&self, addr: NodeAddr) -> Option<Arc<Node>> {
        self.nodes.get(&addr).map(|n| n.clone())
    }

    /// Look up a node by its dense unique index.
    pub fn by_index(&self, index: u32) -> Option<Arc<Node>> {
        self.by_index.get(&index).map(|n| n.clone())
    }

    /// Number of distinct nodes ever interned.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node has been interned yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot of all interned nodes.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> NodeAddr {
        NodeAddr::new(std::net::Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn test_intern_is_idempotent() {
        let registry = NodeRegistry::new();
        let a = registry.intern(addr(5, 7000));
        let b = registry.intern(addr(5, 7000));
        assert!(Arc::ptr_eq(&a, &b), "same address must intern to same node");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_intern_assigns_dense_indices_skipping_zero() {
        let registry = NodeRegistry::new();
        let a = registry.intern(addr(1, 7000));
        let b = registry.intern(addr(2, 7000));
        let c = registry.intern(addr(2, 7001));
        assert_eq!(a.index(), 1);
        assert_eq!(b.index(), 2);
        assert_eq!(c.index(), 3);
    }

    #[test]
    fn test_concurrent_intern_same_address() {
        let registry = Arc::new(NodeRegistry::new());
        let target = addr(5, 7000);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.intern(target))
            })
            .collect();

        let nodes: Vec<Arc<Node>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for node in &nodes[1..] {
            assert!(
                Arc::ptr_eq(&nodes[0], node),
                "all racing callers must observe the identical node"
            );
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(nodes[0].index(), 1, "exactly one index assigned");
    }

    #[test]
    fn test_concurrent_intern_distinct_addresses() {
        let registry = Arc::new(NodeRegistry::new());

        let handles: Vec<_> = (0..16u8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.intern(addr(i, 7000)))
            })
            .collect();

        let mut indices: Vec<u32> = handles
            .into_iter()
            .map(|h| h.join().unwrap().index())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 16, "every distinct address gets its own index");
        assert!(!indices.contains(&0), "index 0 is never handed out");
    }

    #[test]
    fn test_by_index_lookup() {
        let registry = NodeRegistry::new();
        let node = registry.intern(addr(9, 4820));
        let found = registry.by_index(node.index()).unwrap();
        assert!(Arc::ptr_eq(&node, &found));
        assert!(registry.by_index(99).is_none());
    }

    #[test]
    fn test_heartbeat_overwrite() {
        let registry = NodeRegistry::new();
        let node = registry.intern(addr(1, 7000));

        node.observe_heartbeat(&Heartbeat {
            view_id: 4,
            keys: 100,
            free_mem: 1 << 20,
            sent_at_ms: 0,
        });
        assert_eq!(node.reported_view_id(), 4);
        assert_eq!(node.heartbeat().keys, 100);

        node.observe_heartbeat(&Heartbeat {
            view_id: 5,
            keys: 50,
            free_mem: 1 << 21,
            sent_at_ms: 0,
        });
        assert_eq!(node.reported_view_id(), 5);
        assert_eq!(node.heartbeat().keys, 50);
    }

    #[test]
    fn test_staleness() {
        let registry = NodeRegistry::new();
        let node = registry.intern(addr(1, 7000));
        let now = node.last_heard_ms();
        assert!(!node.is_stale(now + 1_000, 5_000));
        assert!(node.is_stale(now + 10_000, 5_000));
    }

    #[test]
    fn test_task_ids_start_at_one_and_increase() {
        let registry = NodeRegistry::new();
        let node = registry.intern(addr(1, 7000));
        assert_eq!(node.next_task_id(), 1);
        assert_eq!(node.next_task_id(), 2);
        assert_eq!(node.next_task_id(), 3);
    }
}
