//! Wire protocol and transports for inter-node communication.
//!
//! Messages are postcard-encoded and framed with a 4-byte big-endian
//! length prefix. The [`Wire`] trait abstracts the transport: [`TcpWire`]
//! is the real TCP implementation with pooled outbound connections;
//! [`MemNetwork`]/[`MemWire`] is an in-process transport for protocol
//! tests, including duplicate-delivery injection.

mod codec;
mod error;
mod mem;
mod message;
mod tcp;

pub use codec::{MAX_FRAME_SIZE, encode_frame, read_frame};
pub use error::NetError;
pub use mem::{MemNetwork, MemWire};
pub use message::{Envelope, Message, RemoteOp};
pub use tcp::TcpWire;

use tokio::sync::mpsc;

/// A transport that can send messages to peers.
///
/// Inbound traffic is not part of the trait: each transport hands decoded
/// [`Envelope`]s to the channel it was created with, and the runtime
/// drains that channel.
#[async_trait::async_trait]
pub trait Wire: Send + Sync {
    /// The address this transport sends from (and listens on).
    fn local_addr(&self) -> reef_types::NodeAddr;

    /// Send one message to a peer. Delivery is best-effort; callers that
    /// need a reply retransmit until they get one.
    async fn send(&self, to: reef_types::NodeAddr, msg: Message) -> Result<(), NetError>;
}

/// Channel type carrying decoded inbound messages to the runtime.
pub type Inbound = mpsc::UnboundedReceiver<Envelope>;
/// Sender half handed to a transport at creation.
pub type InboundSender = mpsc::UnboundedSender<Envelope>;
