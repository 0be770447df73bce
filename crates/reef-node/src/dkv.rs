//! The distributed key/value façade.
//!
//! Every operation is routed by the key's home under the current view:
//! the home serves locally through the arbitration store; any other node
//! forwards through the remote-call layer and keeps a cached replica.
//!
//! Ordering model (intentionally weaker than sequential consistency):
//! reads and writes issued by the same caller to the same key are never
//! reordered relative to each other; writes to different keys may be
//! observed in different orders on different nodes. Once a write's
//! invalidations are all acknowledged, no subsequent read anywhere
//! observes the pre-write value.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use reef_cluster::{Cluster, Node};
use reef_compute::{JobContext, JobError};
use reef_kv::{HomeStore, Value, WriteGate, holder_indices};
use reef_net::{Message, RemoteOp, Wire};
use reef_store::BackendSet;
use reef_types::{BackendKind, Key, NodeAddr};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::NodeError;
use crate::remote::{OpOutput, RemoteCalls, decode_reply};

/// The distributed key/value store as seen from one node.
pub struct Dkv {
    cluster: Arc<Cluster>,
    /// Values homed at this node.
    home: HomeStore,
    backends: BackendSet,
    calls: Arc<RemoteCalls>,
    wire: Arc<dyn Wire>,
    /// Cached copies of values homed elsewhere.
    replicas: DashMap<Key, Bytes>,
    /// In-flight forwarded writes, one gate per key.
    gates: DashMap<Key, Arc<WriteGate>>,
    /// Waiters for invalidation acknowledgements, keyed by (peer, key).
    invalidations: DashMap<(NodeAddr, Key), Vec<oneshot::Sender<()>>>,
    /// Reads served to remote requesters, ended when their ack-of-ack
    /// arrives. Keyed by (requester, task id).
    served_reads: DashMap<(NodeAddr, u64), (Arc<Value>, u32)>,
    /// Backend tag for values created on this node.
    spill_backend: BackendKind,
    /// Values at least this large are spilled right after publishing.
    spill_threshold: Option<usize>,
    retry_interval: Duration,
}

impl Dkv {
    /// Create the store for one node.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: Arc<Cluster>,
        backends: BackendSet,
        calls: Arc<RemoteCalls>,
        wire: Arc<dyn Wire>,
        spill_backend: BackendKind,
        spill_threshold: Option<usize>,
        retry_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            home: HomeStore::new(),
            backends,
            calls,
            wire,
            replicas: DashMap::new(),
            gates: DashMap::new(),
            invalidations: DashMap::new(),
            served_reads: DashMap::new(),
            spill_backend,
            spill_threshold,
            retry_interval,
        })
    }

    /// Number of keys homed at this node (reported in heartbeats).
    pub fn home_len(&self) -> usize {
        self.home.len()
    }

    // -------------------------------------------------------------------
    // Client operations
    // -------------------------------------------------------------------

    /// Read a value.
    ///
    /// On the home node this is a direct map access — the reader
    /// protocol tracks *remote* cache holders. Elsewhere, a cached
    /// replica is served if present; otherwise the value is fetched from
    /// the home, which records this node as a holder, and cached.
    pub async fn get(&self, key: &Key) -> Result<Option<Bytes>, NodeError> {
        let view = self.cluster.view();
        let Some(home) = view.home_of(key) else {
            return Err(NodeError::EmptyCluster);
        };

        if Arc::ptr_eq(home, self.cluster.local()) {
            return match self.home.get(key) {
                Some(value) => Ok(Some(value.bytes(key, &self.backends).await?)),
                None => Ok(None),
            };
        }

        if let Some(cached) = self.replicas.get(key) {
            return Ok(Some(cached.clone()));
        }

        let home = home.clone();
        let (task, reply) = self
            .calls
            .call(&home, RemoteOp::Get { key: key.clone() })
            .await?;
        // Install the replica before acknowledging, so the home's read
        // accounting still covers us while the copy lands.
        let result = match decode_reply(&reply) {
            Ok(OpOutput::Value(bytes)) => {
                if let Some(b) = &bytes {
                    self.replicas.insert(key.clone(), b.clone());
                }
                Ok(bytes)
            }
            Ok(_) => Err(NodeError::UnexpectedReply),
            Err(e) => Err(e),
        };
        self.calls.acknowledge(home.addr(), task).await;
        result
    }

    /// Write a value. Returns once the write is visible cluster-wide:
    /// on the home that means every cache holder has acknowledged its
    /// invalidation; elsewhere it means the home has acknowledged the
    /// forwarded write.
    pub async fn put(self: &Arc<Self>, key: &Key, bytes: Bytes) -> Result<(), NodeError> {
        let view = self.cluster.view();
        let Some(home) = view.home_of(key) else {
            return Err(NodeError::EmptyCluster);
        };

        if Arc::ptr_eq(home, self.cluster.local()) {
            let value = Arc::new(Value::new(bytes, self.spill_backend));
            return self.publish_local(key, Some(value), None).await;
        }

        let home = home.clone();
        // Program order: this node sees its own write immediately.
        self.replicas.insert(key.clone(), bytes.clone());
        self.forward_write(
            key,
            RemoteOp::Put {
                key: key.clone(),
                bytes,
            },
            home,
        )
        .await
    }

    /// Delete a key, with the same publish-and-invalidate protocol as a
    /// write.
    pub async fn remove(self: &Arc<Self>, key: &Key) -> Result<(), NodeError> {
        let view = self.cluster.view();
        let Some(home) = view.home_of(key) else {
            return Err(NodeError::EmptyCluster);
        };

        if Arc::ptr_eq(home, self.cluster.local()) {
            return self.publish_local(key, None, None).await;
        }

        let home = home.clone();
        self.replicas.remove(key);
        self.forward_write(key, RemoteOp::Remove { key: key.clone() }, home)
            .await
    }

    // -------------------------------------------------------------------
    // Home-side protocol
    // -------------------------------------------------------------------

    /// Publish a new value (or absence) for a key this node homes.
    ///
    /// The mapping is swapped first, so readers retrying past the lock
    /// observe the fresh value. The prior value is then locked — waiting
    /// for its active readers to drain — and every recorded holder
    /// except the write's originator is sent an invalidation. The write
    /// does not return until all invalidations are acknowledged.
    async fn publish_local(
        self: &Arc<Self>,
        key: &Key,
        value: Option<Arc<Value>>,
        originator: Option<u32>,
    ) -> Result<(), NodeError> {
        let prior = match &value {
            Some(v) => self.home.publish(key.clone(), v.clone()),
            None => self.home.remove(key),
        };

        if let Some(old) = prior {
            let bitmap = old.state().begin_write().await;
            let mut pending = Vec::new();
            for index in holder_indices(bitmap) {
                if originator == Some(index) {
                    continue;
                }
                let Some(peer) = self.cluster.registry().by_index(index) else {
                    continue;
                };
                pending.push(tokio::spawn(self.invalidate_holder(peer, key.clone())));
            }
            for task in pending {
                task.await.expect("invalidation task panicked");
            }
            if value.is_none() {
                old.purge(key, &self.backends).await?;
            }
        }

        if let Some(v) = &value {
            if let Some(threshold) = self.spill_threshold {
                if v.len() >= threshold {
                    v.spill(key, &self.backends).await?;
                }
            }
        }
        Ok(())
    }

    /// Send invalidations for one holder until it acknowledges.
    fn invalidate_holder(
        self: &Arc<Self>,
        peer: Arc<Node>,
        key: Key,
    ) -> impl Future<Output = ()> + Send + 'static {
        let this = self.clone();
        async move {
            let (tx, mut rx) = oneshot::channel();
            this.invalidations
                .entry((peer.addr(), key.clone()))
                .or_default()
                .push(tx);
            loop {
                let _ = this
                    .wire
                    .send(peer.addr(), Message::Invalidate { key: key.clone() })
                    .await;
                match tokio::time::timeout(this.retry_interval, &mut rx).await {
                    // Acked — or superseded by a later publish of the
                    // same key to the same peer, which drops the same
                    // cached copy.
                    Ok(_) => return,
                    Err(_) => {
                        trace!(peer = %peer.addr(), %key, "invalidation unacked, retransmitting");
                    }
                }
            }
        }
    }

    /// An invalidation acknowledgement arrived.
    pub fn on_invalidate_ack(&self, from: NodeAddr, key: &Key) {
        if let Some((_, waiters)) = self.invalidations.remove(&(from, key.clone())) {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    /// A peer published a new value for this key; our cached copy is
    /// stale.
    pub fn drop_replica(&self, key: &Key) {
        if self.replicas.remove(key).is_some() {
            debug!(%key, "dropped invalidated replica");
        }
    }

    // -------------------------------------------------------------------
    // Serving remote requesters (home side)
    // -------------------------------------------------------------------

    /// Serve a read for a remote requester, admitting it through the
    /// replica word. The active-read slot is held until the requester's
    /// ack-of-ack arrives ([`end_served_read`](Self::end_served_read)).
    pub async fn serve_get(
        &self,
        requester: &Arc<Node>,
        task: u64,
        key: &Key,
    ) -> Result<Option<Bytes>, NodeError> {
        match self.home.admit_reader(key, requester.index()).await? {
            None => Ok(None),
            Some(value) => {
                let bytes = match value.bytes(key, &self.backends).await {
                    Ok(b) => b,
                    Err(e) => {
                        value.state().end_read(requester.index());
                        return Err(e.into());
                    }
                };
                self.served_reads
                    .insert((requester.addr(), task), (value, requester.index()));
                Ok(Some(bytes))
            }
        }
    }

    /// Serve a forwarded write. The new value records the originator as
    /// its one known cache holder, and the originator is excluded from
    /// the invalidation fan-out.
    pub async fn serve_put(
        self: &Arc<Self>,
        requester: &Arc<Node>,
        key: Key,
        bytes: Bytes,
    ) -> Result<(), NodeError> {
        let value = Arc::new(Value::with_holder(
            bytes,
            self.spill_backend,
            requester.index(),
        )?);
        self.publish_local(&key, Some(value), Some(requester.index()))
            .await
    }

    /// Serve a forwarded delete.
    pub async fn serve_remove(
        self: &Arc<Self>,
        requester: &Arc<Node>,
        key: Key,
    ) -> Result<(), NodeError> {
        self.publish_local(&key, None, Some(requester.index())).await
    }

    /// The requester confirmed receipt of a read result; release its
    /// active-read slot.
    pub fn end_served_read(&self, requester: NodeAddr, task: u64) {
        if let Some((_, (value, index))) = self.served_reads.remove(&(requester, task)) {
            value.state().end_read(index);
        }
    }

    /// A peer rebooted: release every read slot it was holding, letting
    /// blocked writes proceed.
    pub fn drop_served_reads_for(&self, requester: NodeAddr) {
        let stale: Vec<(NodeAddr, u64)> = self
            .served_reads
            .iter()
            .filter(|entry| entry.key().0 == requester)
            .map(|entry| *entry.key())
            .collect();
        for key in stale {
            if let Some((_, (value, index))) = self.served_reads.remove(&key) {
                value.state().end_read(index);
            }
        }
    }

    // -------------------------------------------------------------------
    // Forwarded writes (non-home side)
    // -------------------------------------------------------------------

    /// Forward a write to the home, ordered behind any write this node
    /// already has in flight for the same key.
    async fn forward_write(
        self: &Arc<Self>,
        key: &Key,
        op: RemoteOp,
        home: Arc<Node>,
    ) -> Result<(), NodeError> {
        let gate = self.acquire_gate(key).await;
        let result = async {
            let (task, reply) = self.calls.call(&home, op).await?;
            let output = decode_reply(&reply);
            self.calls.acknowledge(home.addr(), task).await;
            match output? {
                OpOutput::Unit => Ok(()),
                _ => Err(NodeError::UnexpectedReply),
            }
        }
        .await;
        // Open the gate even on failure, or later writers hang forever.
        gate.complete();
        self.gates.remove_if(key, |_, g| Arc::ptr_eq(g, &gate));
        result
    }

    /// Install this write's gate for a key, blocking behind any write
    /// already in flight.
    async fn acquire_gate(&self, key: &Key) -> Arc<WriteGate> {
        loop {
            match self.gates.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    let gate = Arc::new(WriteGate::new());
                    slot.insert(gate.clone());
                    return gate;
                }
                Entry::Occupied(slot) => {
                    let prior = slot.get().clone();
                    drop(slot);
                    prior.wait_done().await;
                    self.gates.remove_if(key, |_, g| Arc::ptr_eq(g, &prior));
                }
            }
        }
    }
}

impl std::fmt::Debug for Dkv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dkv")
            .field("local", self.cluster.local())
            .field("homed_keys", &self.home.len())
            .field("replicas", &self.replicas.len())
            .finish_non_exhaustive()
    }
}

/// The job-facing view of the store.
pub struct DkvContext {
    dkv: Arc<Dkv>,
}

impl DkvContext {
    /// Wrap the store for use by jobs.
    pub fn new(dkv: Arc<Dkv>) -> Self {
        Self { dkv }
    }
}

#[async_trait::async_trait]
impl JobContext for DkvContext {
    async fn read(&self, key: &Key) -> Result<Option<Bytes>, JobError> {
        self.dkv
            .get(key)
            .await
            .map_err(|e| JobError::Access(e.to_string()))
    }

    async fn write(&self, key: &Key, bytes: Bytes) -> Result<(), JobError> {
        self.dkv
            .put(key, bytes)
            .await
            .map_err(|e| JobError::Access(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use reef_net::MemNetwork;
    use reef_store::MemoryStore;

    use super::*;

    fn addr(last: u8) -> NodeAddr {
        NodeAddr::new(Ipv4Addr::new(10, 0, 0, last), 4820)
    }

    /// A single-node store: every key is homed locally.
    fn local_dkv(spill_threshold: Option<usize>) -> Arc<Dkv> {
        let net = MemNetwork::new();
        let (wire, _inbound) = net.join(addr(1));
        let cluster = Cluster::new(addr(1));
        let backends =
            BackendSet::new().with(BackendKind::Memory, Arc::new(MemoryStore::unbounded()));
        let calls = RemoteCalls::new(wire.clone(), Duration::from_millis(50));
        Dkv::new(
            cluster,
            backends,
            calls,
            wire,
            BackendKind::Memory,
            spill_threshold,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_local_put_get_remove() {
        let dkv = local_dkv(None);
        let key = Key::from("k");

        assert_eq!(dkv.get(&key).await.unwrap(), None);
        dkv.put(&key, Bytes::from_static(b"v1")).await.unwrap();
        assert_eq!(dkv.get(&key).await.unwrap(), Some(Bytes::from_static(b"v1")));

        dkv.put(&key, Bytes::from_static(b"v2")).await.unwrap();
        assert_eq!(dkv.get(&key).await.unwrap(), Some(Bytes::from_static(b"v2")));

        dkv.remove(&key).await.unwrap();
        assert_eq!(dkv.get(&key).await.unwrap(), None);
        assert_eq!(dkv.home_len(), 0);
    }

    #[tokio::test]
    async fn test_remove_missing_key_is_ok() {
        let dkv = local_dkv(None);
        dkv.remove(&Key::from("never written")).await.unwrap();
    }

    #[tokio::test]
    async fn test_spill_threshold_offloads_large_values() {
        let dkv = local_dkv(Some(16));
        let key = Key::from("big");
        let payload = Bytes::from(vec![7u8; 64]);

        dkv.put(&key, payload.clone()).await.unwrap();
        let value = dkv.home.get(&key).unwrap();
        assert!(value.resident().is_none(), "large value should be spilled");
        assert!(value.is_persisted());

        // A read reloads transparently from the backend.
        assert_eq!(dkv.get(&key).await.unwrap(), Some(payload));
    }

    #[tokio::test]
    async fn test_small_values_stay_resident() {
        let dkv = local_dkv(Some(1024));
        let key = Key::from("small");
        dkv.put(&key, Bytes::from_static(b"tiny")).await.unwrap();
        assert!(dkv.home.get(&key).unwrap().resident().is_some());
    }

    #[tokio::test]
    async fn test_serve_get_holds_read_until_ackack() {
        let dkv = local_dkv(None);
        let key = Key::from("k");
        dkv.put(&key, Bytes::from_static(b"v")).await.unwrap();

        let requester = dkv.cluster.registry().intern(addr(2));
        let bytes = dkv.serve_get(&requester, 7, &key).await.unwrap();
        assert_eq!(bytes, Some(Bytes::from_static(b"v")));

        let value = dkv.home.get(&key).unwrap();
        assert_eq!(value.state().reader_count(), 1);
        assert!(value.state().is_holder(requester.index()));

        dkv.end_served_read(requester.addr(), 7);
        assert_eq!(value.state().reader_count(), 0);
        assert!(
            value.state().is_holder(requester.index()),
            "the requester stays a cache holder after its read ends"
        );
    }

    #[tokio::test]
    async fn test_serve_get_missing_key() {
        let dkv = local_dkv(None);
        let requester = dkv.cluster.registry().intern(addr(2));
        let bytes = dkv.serve_get(&requester, 1, &Key::from("nope")).await.unwrap();
        assert_eq!(bytes, None);
    }

    #[tokio::test]
    async fn test_drop_served_reads_for_rebooted_peer() {
        let dkv = local_dkv(None);
        let key = Key::from("k");
        dkv.put(&key, Bytes::from_static(b"v")).await.unwrap();

        let requester = dkv.cluster.registry().intern(addr(2));
        dkv.serve_get(&requester, 1, &key).await.unwrap();
        dkv.serve_get(&requester, 2, &key).await.unwrap();
        let value = dkv.home.get(&key).unwrap();
        assert_eq!(value.state().reader_count(), 2);

        dkv.drop_served_reads_for(requester.addr());
        assert_eq!(
            value.state().reader_count(),
            0,
            "a reboot releases every slot the peer held"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_gate_serializes_same_key_writers() {
        let dkv = local_dkv(None);
        let key = Key::from("gated");

        let first = dkv.acquire_gate(&key).await;

        let second = {
            let dkv = dkv.clone();
            let key = key.clone();
            tokio::spawn(async move { dkv.acquire_gate(&key).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "second writer must wait for the first");

        first.complete();
        dkv.gates.remove_if(&key, |_, g| Arc::ptr_eq(g, &first));
        let second = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .expect("second writer should proceed")
            .unwrap();
        second.complete();
    }

    #[tokio::test]
    async fn test_capacity_fault_on_serve_for_high_index() {
        let dkv = local_dkv(None);
        // Intern enough nodes to push an index past the bitmap ceiling.
        let mut last = dkv.cluster.registry().intern(addr(2));
        for i in 3..=60u8 {
            last = dkv.cluster.registry().intern(addr(i));
        }
        assert!(last.index() >= reef_kv::MAX_TRACKED_NODES);

        let result = dkv
            .serve_put(&last, Key::from("k"), Bytes::from_static(b"v"))
            .await;
        assert!(
            matches!(result, Err(NodeError::Kv(reef_kv::KvError::TooManyNodes { .. }))),
            "indices past the bitmap width must fail fast, got {result:?}"
        );
    }
}
