//! Cluster view and deterministic key placement.
//!
//! A [`ClusterView`] is an immutable snapshot of the member set plus a
//! precomputed placement ring; its id changes every time the set changes.
//! [`Cluster`] is the explicit context object that owns the current view
//! and the local node identity — it is constructed at process start and
//! threaded through every component, which also makes it possible to run
//! several independent simulated clusters in one test process.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use reef_types::{Key, NodeAddr};
use tokio::sync::watch;
use tracing::info;

use crate::registry::{Node, NodeRegistry};

/// Ring positions per member. More slots smooth the key distribution when
/// the member set is small.
pub const RING_SLOTS: u16 = 16;

/// An immutable snapshot of cluster membership.
///
/// Placement is a pure function of the snapshot: for a fixed view, the
/// same key always maps to the same home node, so all nodes holding the
/// same view agree on the arbiter for every key.
pub struct ClusterView {
    id: u64,
    /// Members sorted by address — the canonical order.
    members: Vec<Arc<Node>>,
    /// Ring position -> index into `members`.
    ring: BTreeMap<u64, usize>,
}

impl ClusterView {
    /// Build a view from a member set. Members are deduplicated and sorted
    /// by address; the ring is derived from addresses only, so two views
    /// built from the same set place keys identically.
    pub fn new(id: u64, mut members: Vec<Arc<Node>>) -> Self {
        members.sort_by_key(|m| m.addr());
        members.dedup_by_key(|m| m.addr());

        let mut ring = BTreeMap::new();
        for (i, member) in members.iter().enumerate() {
            for slot in 0..RING_SLOTS {
                ring.insert(member_position(member.addr(), slot), i);
            }
        }

        Self { id, members, ring }
    }

    /// The membership id of this view.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Members in canonical (address) order.
    pub fn members(&self) -> &[Arc<Node>] {
        &self.members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the view has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `node` is part of this view's member set.
    pub fn contains(&self, node: &Node) -> bool {
        self.members
            .binary_search_by_key(&node.addr(), |m| m.addr())
            .is_ok()
    }

    /// Whether `node` is a *current* member: in the set, and its last
    /// reported heartbeat agrees with this view's id.
    pub fn is_member(&self, node: &Node) -> bool {
        self.contains(node) && node.reported_view_id() == self.id
    }

    /// The home node arbitrating reads and writes for `key`.
    ///
    /// Walks clockwise on the ring from the key's position to the first
    /// member slot, wrapping around. Returns `None` only for an empty view.
    pub fn home_of(&self, key: &Key) -> Option<&Arc<Node>> {
        if self.ring.is_empty() {
            return None;
        }
        let pos = key.position();
        let idx = self
            .ring
            .range(pos..)
            .chain(self.ring.range(..pos))
            .next()
            .map(|(_, i)| *i)
            .expect("non-empty ring");
        Some(&self.members[idx])
    }
}

impl std::fmt::Debug for ClusterView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterView")
            .field("id", &self.id)
            .field("members", &self.members.len())
            .finish()
    }
}

/// Compute a member's ring position for one slot:
/// `blake3(addr_octets ++ port_be ++ slot_le)` truncated to u64.
fn member_position(addr: NodeAddr, slot: u16) -> u64 {
    let mut input = [0u8; 8];
    input[..4].copy_from_slice(&addr.ip().octets());
    input[4..6].copy_from_slice(&addr.port().to_be_bytes());
    input[6..8].copy_from_slice(&slot.to_le_bytes());
    let hash = blake3::hash(&input);
    let bytes: [u8; 8] = hash.as_bytes()[..8].try_into().expect("8 bytes");
    u64::from_le_bytes(bytes)
}

/// The cluster context: local identity, intern registry, and the current
/// membership view.
///
/// Replaces what would otherwise be process-wide globals; every component
/// that needs node identity or membership holds an `Arc<Cluster>`.
pub struct Cluster {
    local: Arc<Node>,
    registry: NodeRegistry,
    view: RwLock<Arc<ClusterView>>,
    view_tx: watch::Sender<u64>,
}

impl Cluster {
    /// Create a cluster context for a node listening at `local_addr`.
    /// The initial view (id 1) contains only the local node.
    pub fn new(local_addr: NodeAddr) -> Arc<Self> {
        let registry = NodeRegistry::new();
        let local = registry.intern(local_addr);
        let view = Arc::new(ClusterView::new(1, vec![local.clone()]));
        local.set_reported_view(view.id());
        let (view_tx, _) = watch::channel(view.id());
        Arc::new(Self {
            local,
            registry,
            view: RwLock::new(view),
            view_tx,
        })
    }

    /// The local node's canonical handle.
    pub fn local(&self) -> &Arc<Node> {
        &self.local
    }

    /// The intern registry for this cluster.
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// The current membership view.
    pub fn view(&self) -> Arc<ClusterView> {
        self.view.read().expect("view lock poisoned").clone()
    }

    /// Install a new member set, bumping the view id. The local node is
    /// always part of its own cluster and is added if missing.
    pub fn install_members(&self, mut members: Vec<Arc<Node>>) -> Arc<ClusterView> {
        if !members.iter().any(|m| Arc::ptr_eq(m, &self.local)) {
            members.push(self.local.clone());
        }
        let mut slot = self.view.write().expect("view lock poisoned");
        let next = Arc::new(ClusterView::new(slot.id() + 1, members));
        *slot = next.clone();
        drop(slot);

        self.local.set_reported_view(next.id());
        let _ = self.view_tx.send(next.id());
        info!(view_id = next.id(), members = next.len(), "installed cluster view");
        next
    }

    /// Subscribe to view-id changes.
    pub fn watch_view(&self) -> watch::Receiver<u64> {
        self.view_tx.subscribe()
    }

    /// Whether the local node is the home for `key` under the current view.
    pub fn is_home(&self, key: &Key) -> bool {
        match self.view().home_of(key) {
            Some(home) => Arc::ptr_eq(home, &self.local),
            None => false,
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> NodeAddr {
        NodeAddr::new(std::net::Ipv4Addr::new(10, 0, 0, last), 4820)
    }

    fn view_of(registry: &NodeRegistry, id: u64, lasts: &[u8]) -> ClusterView {
        let members = lasts.iter().map(|l| registry.intern(addr(*l))).collect();
        ClusterView::new(id, members)
    }

    #[test]
    fn test_home_is_deterministic_for_fixed_view() {
        let registry = NodeRegistry::new();
        let view = view_of(&registry, 1, &[1, 2, 3]);
        for i in 0..100u32 {
            let key = Key::new(i.to_le_bytes().to_vec());
            let a = view.home_of(&key).unwrap();
            let b = view.home_of(&key).unwrap();
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn test_identically_built_views_agree() {
        // Two nodes building views from the same member set must pick the
        // same home for every key, regardless of insertion order.
        let registry = NodeRegistry::new();
        let v1 = view_of(&registry, 7, &[1, 2, 3]);
        let v2 = view_of(&registry, 7, &[3, 1, 2]);
        for i in 0..200u32 {
            let key = Key::new(i.to_le_bytes().to_vec());
            assert_eq!(
                v1.home_of(&key).unwrap().addr(),
                v2.home_of(&key).unwrap().addr(),
                "placement must not depend on member order"
            );
        }
    }

    #[test]
    fn test_single_member_homes_everything() {
        let registry = NodeRegistry::new();
        let view = view_of(&registry, 1, &[9]);
        for i in 0..50u32 {
            let key = Key::new(i.to_le_bytes().to_vec());
            assert_eq!(view.home_of(&key).unwrap().addr(), addr(9));
        }
    }

    #[test]
    fn test_empty_view_has_no_home() {
        let view = ClusterView::new(1, Vec::new());
        assert!(view.home_of(&Key::from("k")).is_none());
        assert!(view.is_empty());
    }

    #[test]
    fn test_distribution_roughly_balanced() {
        let registry = NodeRegistry::new();
        let view = view_of(&registry, 1, &[1, 2]);
        let total = 10_000;
        let mut first = 0usize;
        for i in 0..total {
            let key = Key::new((i as u32).to_le_bytes().to_vec());
            if view.home_of(&key).unwrap().addr() == addr(1) {
                first += 1;
            }
        }
        let ratio = first as f64 / total as f64;
        assert!(
            (0.3..=0.7).contains(&ratio),
            "distribution too skewed: {first}/{total} ({ratio:.2})"
        );
    }

    #[test]
    fn test_removing_a_member_only_moves_its_keys() {
        let registry = NodeRegistry::new();
        let before = view_of(&registry, 1, &[1, 2, 3]);
        let after = view_of(&registry, 2, &[1, 3]);

        for i in 0..2_000u32 {
            let key = Key::new(i.to_le_bytes().to_vec());
            let old_home = before.home_of(&key).unwrap().addr();
            let new_home = after.home_of(&key).unwrap().addr();
            if old_home != addr(2) {
                assert_eq!(
                    old_home, new_home,
                    "key {key} was not homed on the removed node but moved anyway"
                );
            }
        }
    }

    #[test]
    fn test_is_member_requires_matching_view_id() {
        let registry = NodeRegistry::new();
        let node = registry.intern(addr(1));
        let view = ClusterView::new(4, vec![node.clone()]);

        node.set_reported_view(3);
        assert!(view.contains(&node));
        assert!(!view.is_member(&node), "stale view id is not membership");

        node.set_reported_view(4);
        assert!(view.is_member(&node));
    }

    #[test]
    fn test_install_members_bumps_id_and_keeps_local() {
        let cluster = Cluster::new(addr(1));
        assert_eq!(cluster.view().id(), 1);
        assert_eq!(cluster.view().len(), 1);

        let peer = cluster.registry().intern(addr(2));
        let view = cluster.install_members(vec![peer]);
        assert_eq!(view.id(), 2);
        assert_eq!(view.len(), 2, "local node is always included");
        assert!(view.contains(cluster.local()));
        assert!(view.is_member(cluster.local()));
    }

    #[test]
    fn test_watch_view_observes_changes() {
        let cluster = Cluster::new(addr(1));
        let rx = cluster.watch_view();
        assert_eq!(*rx.borrow(), 1);

        let peer = cluster.registry().intern(addr(2));
        cluster.install_members(vec![peer]);
        assert_eq!(*rx.borrow(), 2);
    }

    #[test]
    fn test_dedup_same_address() {
        let registry = NodeRegistry::new();
        let view = view_of(&registry, 1, &[1, 1, 2]);
        assert_eq!(view.len(), 2);
    }
}
