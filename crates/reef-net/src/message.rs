//! Protocol messages exchanged between Reef nodes.
//!
//! Every frame on the wire is an [`Envelope`]: the sender's address plus
//! one [`Message`]. Remote work travels as a [`RemoteOp`] inside a
//! `TaskRequest` and is tracked by the receiver's task ledger, so a
//! retransmitted request is answered from the stored result instead of
//! being executed twice.

use bytes::Bytes;
use reef_types::{Heartbeat, Key, NodeAddr, RebootCause};
use serde::{Deserialize, Serialize};

/// A remote operation carried by a task request.
///
/// This is the closed set of things one node can ask another to do; the
/// dispatcher matches on the kind, there is no open-ended dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteOp {
    /// Write a value. Executed on the key's home node, which arbitrates
    /// the publish and fans out invalidations.
    Put {
        /// The key being written.
        key: Key,
        /// The new payload.
        bytes: Bytes,
    },

    /// Read a value from its home node. The home records the requester
    /// as a cache holder while the read is in flight.
    Get {
        /// The key being read.
        key: Key,
    },

    /// Delete a key on its home node.
    Remove {
        /// The key being removed.
        key: Key,
    },

    /// Run a registered job over a span of keys homed at the receiver,
    /// returning the job's merged partial result.
    RunJob {
        /// Registered job name; both sides must know it.
        name: String,
        /// The key span to fold.
        keys: Vec<Key>,
    },
}

/// Protocol messages exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Periodic liveness and health snapshot. Carries the sender's
    /// current member list so peers discover each other transitively.
    Heartbeat {
        /// The sender's health snapshot.
        beat: Heartbeat,
        /// Addresses the sender currently considers members.
        members: Vec<NodeAddr>,
    },

    /// Ask the receiver to perform a remote operation. Retransmitted
    /// until a [`Message::TaskAck`] arrives; the task id makes the
    /// retries idempotent.
    TaskRequest {
        /// Task id, scoped to the (sender, receiver) pair.
        task: u64,
        /// The work to perform.
        op: RemoteOp,
    },

    /// The result of a completed task. Resent verbatim for duplicate
    /// requests until the requester acknowledges receipt.
    TaskAck {
        /// Task id being answered.
        task: u64,
        /// Encoded operation result.
        result: Bytes,
    },

    /// The requester has received the result; the executor may stop
    /// tracking the task.
    TaskAckAck {
        /// Task id whose result was received.
        task: u64,
    },

    /// The sender published a new value for this key; the receiver's
    /// cached copy is stale and must be dropped.
    Invalidate {
        /// The stale key.
        key: Key,
    },

    /// The receiver has dropped its cached copy.
    InvalidateAck {
        /// The invalidated key.
        key: Key,
    },

    /// The sender rebooted or is killing the cluster (see
    /// [`RebootCause`]). Non-reboot causes are fatal to the receiver.
    RebootNotice(RebootCause),
}

/// A framed message with its sender's address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Listen address of the sending node.
    pub from: NodeAddr,
    /// The message.
    pub msg: Message,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> NodeAddr {
        "10.0.0.1:4820".parse().unwrap()
    }

    #[test]
    fn test_envelope_roundtrip_postcard() {
        let envelopes = vec![
            Envelope {
                from: addr(),
                msg: Message::Heartbeat {
                    beat: Heartbeat {
                        view_id: 2,
                        keys: 10,
                        free_mem: 1 << 28,
                        sent_at_ms: 123,
                    },
                    members: vec![addr()],
                },
            },
            Envelope {
                from: addr(),
                msg: Message::TaskRequest {
                    task: 7,
                    op: RemoteOp::Put {
                        key: Key::from("k"),
                        bytes: Bytes::from_static(b"v"),
                    },
                },
            },
            Envelope {
                from: addr(),
                msg: Message::TaskAck {
                    task: 7,
                    result: Bytes::from_static(b"ok"),
                },
            },
            Envelope {
                from: addr(),
                msg: Message::TaskAckAck { task: 7 },
            },
            Envelope {
                from: addr(),
                msg: Message::Invalidate {
                    key: Key::from("stale"),
                },
            },
            Envelope {
                from: addr(),
                msg: Message::RebootNotice(RebootCause::VersionMismatch),
            },
        ];

        for envelope in &envelopes {
            let encoded = postcard::to_allocvec(envelope).unwrap();
            let decoded: Envelope = postcard::from_bytes(&encoded).unwrap();
            assert_eq!(envelope, &decoded);
        }
    }

    #[test]
    fn test_remote_op_roundtrip_postcard() {
        let ops = vec![
            RemoteOp::Get {
                key: Key::from("a"),
            },
            RemoteOp::Remove {
                key: Key::from("b"),
            },
            RemoteOp::RunJob {
                name: "count".to_string(),
                keys: vec![Key::from("x"), Key::from("y")],
            },
        ];
        for op in &ops {
            let encoded = postcard::to_allocvec(op).unwrap();
            let decoded: RemoteOp = postcard::from_bytes(&encoded).unwrap();
            assert_eq!(op, &decoded);
        }
    }
}
