//! TCP transport.
//!
//! One listener accepts inbound connections; a dedicated reader task per
//! connection decodes frames and hands them to the runtime's inbound
//! channel. Outbound connections are pooled per peer and used for
//! writing only — replies arrive through the peer's own outbound
//! connection to our listener, correlated by the envelope's `from`
//! address.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use reef_types::NodeAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{encode_frame, read_frame};
use crate::error::NetError;
use crate::message::{Envelope, Message};
use crate::{InboundSender, Wire};

/// How long to wait for an outbound connection to establish.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound connections silent for longer than this are closed; the peer
/// reconnects on its next send.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// TCP implementation of [`Wire`].
pub struct TcpWire {
    local: NodeAddr,
    /// Pooled outbound write halves, keyed by peer address.
    ///
    /// A `Mutex` (not `RwLock`) so concurrent senders to a new peer
    /// cannot each open a connection and overwrite each other's pool
    /// entry.
    pool: Mutex<HashMap<NodeAddr, OwnedWriteHalf>>,
    accept_task: JoinHandle<()>,
}

impl TcpWire {
    /// Bind a listener at `local` and start accepting.
    ///
    /// Port 0 binds an ephemeral port; the resolved address is reported
    /// by [`Wire::local_addr`]. Decoded inbound frames are handed to
    /// `inbound`.
    pub async fn bind(local: NodeAddr, inbound: InboundSender) -> Result<Arc<Self>, NetError> {
        let listener = TcpListener::bind(local.socket_addr()).await?;
        let bound = listener.local_addr()?;
        let ip = match bound.ip() {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
        };
        let local = NodeAddr::new(ip, bound.port());

        let accept_task = tokio::spawn(Self::accept_loop(listener, inbound));

        Ok(Arc::new(Self {
            local,
            pool: Mutex::new(HashMap::new()),
            accept_task,
        }))
    }

    async fn accept_loop(listener: TcpListener, inbound: InboundSender) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    tokio::spawn(Self::read_loop(stream, inbound.clone()));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
        }
    }

    async fn read_loop(stream: TcpStream, inbound: InboundSender) {
        let (mut reader, _writer) = stream.into_split();
        loop {
            match tokio::time::timeout(READ_IDLE_TIMEOUT, read_frame(&mut reader)).await {
                Ok(Ok(envelope)) => {
                    if inbound.send(envelope).is_err() {
                        // Runtime is gone; stop reading.
                        return;
                    }
                }
                Ok(Err(e)) => {
                    debug!("connection closed: {e}");
                    return;
                }
                Err(_) => {
                    debug!("closing idle connection");
                    return;
                }
            }
        }
    }

    /// Write a frame to the pooled connection for `to`, connecting if
    /// needed. A stale pooled connection gets one reconnect attempt.
    async fn write_frame(&self, to: NodeAddr, frame: &[u8]) -> Result<(), NetError> {
        let mut pool = self.pool.lock().await;

        if let Some(conn) = pool.get_mut(&to) {
            match conn.write_all(frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(peer = %to, "pooled connection failed ({e}), reconnecting");
                    pool.remove(&to);
                }
            }
        }

        // Connect while holding the pool lock so racing senders share
        // one connection instead of overwriting each other.
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(to.socket_addr()))
            .await
            .map_err(|_| NetError::ConnectTimeout(to))??;
        stream.set_nodelay(true)?;
        let (_reader, mut writer) = stream.into_split();
        writer.write_all(frame).await?;
        pool.insert(to, writer);
        Ok(())
    }

    /// Stop accepting and drop the listener. In-flight reader tasks end
    /// when their connections close.
    pub fn close(&self) {
        self.accept_task.abort();
    }
}

impl Drop for TcpWire {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait::async_trait]
impl Wire for TcpWire {
    fn local_addr(&self) -> NodeAddr {
        self.local
    }

    async fn send(&self, to: NodeAddr, msg: Message) -> Result<(), NetError> {
        let envelope = Envelope {
            from: self.local,
            msg,
        };
        let frame = encode_frame(&envelope)?;
        self.write_frame(to, &frame).await
    }
}

#[cfg(test)]
mod tests {
    use reef_types::Heartbeat;
    use tokio::sync::mpsc;

    use super::*;

    async fn wire() -> (Arc<TcpWire>, crate::Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let local = NodeAddr::new(Ipv4Addr::LOCALHOST, 0);
        (TcpWire::bind(local, tx).await.unwrap(), rx)
    }

    #[tokio::test]
    async fn test_bind_resolves_ephemeral_port() {
        let (wire, _rx) = wire().await;
        assert_ne!(wire.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, _a_rx) = wire().await;
        let (b, mut b_rx) = wire().await;

        let beat = Heartbeat {
            view_id: 9,
            keys: 1,
            free_mem: 0,
            sent_at_ms: 42,
        };
        let msg = Message::Heartbeat {
            beat,
            members: vec![a.local_addr()],
        };
        a.send(b.local_addr(), msg.clone()).await.unwrap();

        let envelope = b_rx.recv().await.unwrap();
        assert_eq!(envelope.from, a.local_addr());
        assert_eq!(envelope.msg, msg);
    }

    #[tokio::test]
    async fn test_pooled_connection_reused_for_many_sends() {
        let (a, _a_rx) = wire().await;
        let (b, mut b_rx) = wire().await;

        for i in 0..10u64 {
            a.send(b.local_addr(), Message::TaskAckAck { task: i })
                .await
                .unwrap();
        }
        for i in 0..10u64 {
            let envelope = b_rx.recv().await.unwrap();
            assert_eq!(envelope.msg, Message::TaskAckAck { task: i });
        }
    }

    #[tokio::test]
    async fn test_send_to_unreachable_peer_fails() {
        let (a, _a_rx) = wire().await;
        // A port nobody listens on.
        let nowhere = NodeAddr::new(Ipv4Addr::LOCALHOST, 1);
        let result = a.send(nowhere, Message::TaskAckAck { task: 0 }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bidirectional_traffic() {
        let (a, mut a_rx) = wire().await;
        let (b, mut b_rx) = wire().await;

        a.send(b.local_addr(), Message::TaskAckAck { task: 1 })
            .await
            .unwrap();
        let seen = b_rx.recv().await.unwrap();
        assert_eq!(seen.from, a.local_addr());

        // Reply over b's own outbound connection, addressed by `from`.
        b.send(seen.from, Message::TaskAckAck { task: 2 }).await.unwrap();
        let reply = a_rx.recv().await.unwrap();
        assert_eq!(reply.from, b.local_addr());
        assert_eq!(reply.msg, Message::TaskAckAck { task: 2 });
    }
}
