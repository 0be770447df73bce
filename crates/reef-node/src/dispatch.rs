//! Inbound message dispatch.
//!
//! One dispatcher per node drains the transport's inbound channel.
//! Task requests are gated through the sender's ledger — the first
//! sighting executes in its own task, duplicates are answered from the
//! stored result — so at-least-once delivery yields at-most-once effect.

use std::sync::Arc;

use reef_cluster::{Cluster, Node, Recorded};
use reef_compute::{JobError, JobRegistry, run_local};
use reef_net::{Envelope, Message, RemoteOp, Wire};
use reef_types::{Heartbeat, NodeAddr, RebootCause};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::dkv::{Dkv, DkvContext};
use crate::error::NodeError;
use crate::remote::{OpOutput, RemoteCalls, encode_reply};

/// Handles every inbound envelope for one node.
pub struct Dispatcher {
    cluster: Arc<Cluster>,
    dkv: Arc<Dkv>,
    jobs: Arc<JobRegistry>,
    calls: Arc<RemoteCalls>,
    wire: Arc<dyn Wire>,
    fatal_tx: watch::Sender<Option<RebootCause>>,
}

impl Dispatcher {
    /// Create a dispatcher over the node's components.
    pub fn new(
        cluster: Arc<Cluster>,
        dkv: Arc<Dkv>,
        jobs: Arc<JobRegistry>,
        calls: Arc<RemoteCalls>,
        wire: Arc<dyn Wire>,
    ) -> Arc<Self> {
        let (fatal_tx, _) = watch::channel(None);
        Arc::new(Self {
            cluster,
            dkv,
            jobs,
            calls,
            wire,
            fatal_tx,
        })
    }

    /// Observe fatal peer notices. Fires with the cause when the process
    /// must terminate.
    pub fn fatal(&self) -> watch::Receiver<Option<RebootCause>> {
        self.fatal_tx.subscribe()
    }

    /// Handle one inbound envelope.
    pub async fn handle(self: &Arc<Self>, envelope: Envelope) -> Result<(), NodeError> {
        let peer = self.cluster.registry().intern(envelope.from);
        match envelope.msg {
            Message::Heartbeat { beat, members } => self.on_heartbeat(&peer, beat, members),
            Message::TaskRequest { task, op } => self.on_task_request(peer, task, op).await?,
            Message::TaskAck { task, result } => {
                if !self.calls.complete(peer.addr(), task, result) {
                    debug!(peer = %peer.addr(), task, "ack for a call no longer waiting");
                }
            }
            Message::TaskAckAck { task } => {
                peer.ledger().forget(task);
                self.dkv.end_served_read(peer.addr(), task);
            }
            Message::Invalidate { key } => {
                self.dkv.drop_replica(&key);
                self.wire
                    .send(peer.addr(), Message::InvalidateAck { key })
                    .await?;
            }
            Message::InvalidateAck { key } => {
                self.dkv.on_invalidate_ack(peer.addr(), &key);
            }
            Message::RebootNotice(cause) => self.on_reboot(&peer, cause),
        }
        Ok(())
    }

    /// Gate a task request through the peer's ledger.
    async fn on_task_request(
        self: &Arc<Self>,
        peer: Arc<Node>,
        task: u64,
        op: RemoteOp,
    ) -> Result<(), NodeError> {
        match peer.ledger().record(task) {
            Recorded::New => {
                // Execute in its own task so slow operations don't stall
                // the dispatch pump.
                let this = self.clone();
                tokio::spawn(async move {
                    let reply = match this.execute(&peer, task, op).await {
                        Ok(output) => Ok(output),
                        Err(e) => Err(e.to_string()),
                    };
                    let encoded = match encode_reply(&reply) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(task, "failed to encode reply: {e}");
                            return;
                        }
                    };
                    peer.ledger().record_result(task, encoded.clone());
                    if let Err(e) = this
                        .wire
                        .send(peer.addr(), Message::TaskAck {
                            task,
                            result: encoded,
                        })
                        .await
                    {
                        debug!(peer = %peer.addr(), task, "ack send failed, peer will retransmit: {e}");
                    }
                });
            }
            Recorded::InFlight => {
                // Still running; the ack follows when it finishes.
                debug!(peer = %peer.addr(), task, "duplicate request for in-flight task");
            }
            Recorded::Done(result) => {
                // The requester missed our ack — resend the stored
                // result instead of redoing the work.
                debug!(peer = %peer.addr(), task, "duplicate request, resending result");
                self.wire
                    .send(peer.addr(), Message::TaskAck { task, result })
                    .await?;
            }
        }
        Ok(())
    }

    /// Execute one remote operation on behalf of a peer.
    async fn execute(
        self: &Arc<Self>,
        peer: &Arc<Node>,
        task: u64,
        op: RemoteOp,
    ) -> Result<OpOutput, NodeError> {
        match op {
            RemoteOp::Get { key } => {
                Ok(OpOutput::Value(self.dkv.serve_get(peer, task, &key).await?))
            }
            RemoteOp::Put { key, bytes } => {
                self.dkv.serve_put(peer, key, bytes).await?;
                Ok(OpOutput::Unit)
            }
            RemoteOp::Remove { key } => {
                self.dkv.serve_remove(peer, key).await?;
                Ok(OpOutput::Unit)
            }
            RemoteOp::RunJob { name, keys } => {
                let job = self
                    .jobs
                    .get(&name)
                    .ok_or_else(|| JobError::Unknown(name.clone()))?;
                let ctx = Arc::new(DkvContext::new(self.dkv.clone()));
                let partial = run_local(job, ctx, keys).await?;
                Ok(OpOutput::Partial(partial))
            }
        }
    }

    /// Absorb a heartbeat: overwrite the peer's snapshot, intern any
    /// members it mentions, and admit the sender to the view if new.
    fn on_heartbeat(&self, peer: &Arc<Node>, beat: Heartbeat, members: Vec<NodeAddr>) {
        peer.observe_heartbeat(&beat);
        for addr in members {
            if addr != self.cluster.local().addr() {
                self.cluster.registry().intern(addr);
            }
        }

        let view = self.cluster.view();
        if !view.contains(peer) {
            let mut next = view.members().to_vec();
            next.push(peer.clone());
            self.cluster.install_members(next);
        }
    }

    /// A reboot notice. `Reboot` voids the peer's task history; every
    /// other cause is a kill signal for this process.
    fn on_reboot(&self, peer: &Arc<Node>, cause: RebootCause) {
        if cause.is_fatal() {
            error!(from = %peer.addr(), %cause, "fatal notice from peer, shutting down");
            let _ = self.fatal_tx.send(Some(cause));
        } else {
            debug!(from = %peer.addr(), "peer rebooted");
            peer.mark_rebooted();
            self.dkv.drop_served_reads_for(peer.addr());
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("local", self.cluster.local())
            .finish_non_exhaustive()
    }
}
