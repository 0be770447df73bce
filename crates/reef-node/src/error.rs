//! Error types for the node runtime.

/// Errors surfaced by runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Network transport error.
    #[error("network error: {0}")]
    Net(#[from] reef_net::NetError),

    /// Key/value arbitration or backend error.
    #[error("key/value error: {0}")]
    Kv(#[from] reef_kv::KvError),

    /// Distributed job error.
    #[error("job error: {0}")]
    Job(#[from] reef_compute::JobError),

    /// No cluster view with members exists yet.
    #[error("cluster has no members")]
    EmptyCluster,

    /// The remote side reported a failure executing our operation.
    #[error("remote operation failed: {0}")]
    Remote(String),

    /// A reply arrived whose shape does not match the operation.
    #[error("unexpected reply for operation")]
    UnexpectedReply,

    /// Failed to encode or decode an operation reply.
    #[error("reply encoding failed: {0}")]
    Codec(String),

    /// A pending remote call was abandoned before completing.
    #[error("remote call aborted")]
    CallAborted,
}
