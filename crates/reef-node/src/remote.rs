//! Retrying remote calls with at-most-once effect.
//!
//! A call allocates a task id from the peer's counter, registers a
//! completion slot, and retransmits the request on an interval until the
//! acknowledgement arrives. The receiver's task ledger makes the retries
//! idempotent: duplicates are answered from the stored result.
//!
//! The wait is unbounded by design — protocol-level operations rely on
//! the liveness of the peer, not on deadlines.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use reef_cluster::Node;
use reef_net::{Message, RemoteOp, Wire};
use reef_types::NodeAddr;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::NodeError;

/// The result payload of a completed remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpOutput {
    /// The operation completed with nothing to return (put, remove).
    Unit,
    /// A read's value, or `None` if the key is unmapped.
    Value(Option<Bytes>),
    /// A job's merged partial result over the receiver's key span.
    Partial(Vec<u8>),
}

/// Encode an operation outcome for a task acknowledgement.
pub(crate) fn encode_reply(reply: &Result<OpOutput, String>) -> Result<Bytes, NodeError> {
    postcard::to_allocvec(reply)
        .map(Bytes::from)
        .map_err(|e| NodeError::Codec(e.to_string()))
}

/// Decode a task acknowledgement payload, surfacing remote failures.
pub(crate) fn decode_reply(bytes: &[u8]) -> Result<OpOutput, NodeError> {
    let reply: Result<OpOutput, String> =
        postcard::from_bytes(bytes).map_err(|e| NodeError::Codec(e.to_string()))?;
    reply.map_err(NodeError::Remote)
}

/// Outgoing remote-call tracking: pending completions keyed by
/// (peer, task id).
pub struct RemoteCalls {
    wire: Arc<dyn Wire>,
    pending: DashMap<(NodeAddr, u64), oneshot::Sender<Bytes>>,
    retry_interval: Duration,
}

impl RemoteCalls {
    /// Create the call layer over a transport.
    pub fn new(wire: Arc<dyn Wire>, retry_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            wire,
            pending: DashMap::new(),
            retry_interval,
        })
    }

    /// Send `op` to `peer` and wait for its result, retransmitting until
    /// acknowledged.
    ///
    /// Returns the task id along with the raw reply: the caller finishes
    /// processing the result (e.g. installing a fetched value in its
    /// cache) and then calls [`acknowledge`](Self::acknowledge), so the
    /// executor's read accounting covers the whole window.
    pub async fn call(&self, peer: &Arc<Node>, op: RemoteOp) -> Result<(u64, Bytes), NodeError> {
        let task = peer.next_task_id();
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert((peer.addr(), task), tx);

        loop {
            if let Err(e) = self
                .wire
                .send(peer.addr(), Message::TaskRequest { task, op: op.clone() })
                .await
            {
                debug!(peer = %peer.addr(), task, "request send failed, will retry: {e}");
            }
            match tokio::time::timeout(self.retry_interval, &mut rx).await {
                Ok(Ok(result)) => return Ok((task, result)),
                Ok(Err(_)) => return Err(NodeError::CallAborted),
                Err(_) => {
                    debug!(peer = %peer.addr(), task, "no ack yet, retransmitting");
                }
            }
        }
    }

    /// Tell the executor we received its result so it can stop tracking
    /// the task. Best-effort: a lost ack-of-the-ack only delays cleanup.
    pub async fn acknowledge(&self, peer: NodeAddr, task: u64) {
        let _ = self.wire.send(peer, Message::TaskAckAck { task }).await;
    }

    /// Complete a pending call with the acknowledged result. Returns
    /// false for duplicates and for acks whose call is no longer waiting.
    pub fn complete(&self, from: NodeAddr, task: u64, result: Bytes) -> bool {
        match self.pending.remove(&(from, task)) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_roundtrip() {
        let outputs = vec![
            OpOutput::Unit,
            OpOutput::Value(Some(Bytes::from_static(b"v"))),
            OpOutput::Value(None),
            OpOutput::Partial(vec![1, 2, 3]),
        ];
        for output in outputs {
            let encoded = encode_reply(&Ok(output.clone())).unwrap();
            let decoded = decode_reply(&encoded).unwrap();
            assert_eq!(output, decoded);
        }
    }

    #[test]
    fn test_remote_failure_surfaces_as_error() {
        let encoded = encode_reply(&Err("it broke".to_string())).unwrap();
        match decode_reply(&encoded) {
            Err(NodeError::Remote(msg)) => assert_eq!(msg, "it broke"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_reply_is_codec_error() {
        assert!(matches!(
            decode_reply(&[0xff, 0xff, 0xff]),
            Err(NodeError::Codec(_))
        ));
    }
}
