//! Error types for the network layer.

use reef_types::NodeAddr;

/// Errors that can occur sending or receiving messages.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to encode or decode a message.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An inbound frame exceeded the size limit.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared frame length.
        len: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// The peer is not reachable on this transport.
    #[error("peer unreachable: {0}")]
    Unreachable(NodeAddr),

    /// Timed out establishing a connection.
    #[error("connect timeout to {0}")]
    ConnectTimeout(NodeAddr),
}
