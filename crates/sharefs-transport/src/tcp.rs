//! TCP peer links

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::warn;

use crate::codec::{announced_length, frame_length};
use crate::error::{Result, TransportError};
use crate::link::PeerLink;
use crate::protocol::HEADER_SIZE;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// How long a send waits for socket buffer space before reporting congestion.
    pub congestion_wait_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            congestion_wait_ms: 10,
            nodelay: true,
        }
    }
}

/// TCP transport; creates links
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Establishes a TCP connection to the specified address.
    pub async fn connect(&self, addr: &str) -> Result<TcpLink> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                },
                _ => TransportError::IoError(e),
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        tracing::debug!(addr = addr, "TCP connected");
        Ok(TcpLink::from_stream(stream, &self.config))
    }

    /// Binds to the specified address and returns a listener for incoming connections.
    pub async fn listen(&self, addr: &str) -> Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(TransportError::IoError)
    }

    /// Accepts an incoming TCP connection from the listener.
    pub async fn accept(&self, listener: &tokio::net::TcpListener) -> Result<TcpLink> {
        let (stream, _) = listener.accept().await.map_err(TransportError::IoError)?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        Ok(TcpLink::from_stream(stream, &self.config))
    }
}

/// A single TCP connection with concurrent read/write support
pub struct TcpLink {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<Option<OwnedWriteHalf>>,
    peer_addr: String,
    congestion_wait: Duration,
}

impl TcpLink {
    pub(crate) fn from_stream(stream: tokio::net::TcpStream, config: &TcpTransportConfig) -> Self {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        Self {
            read: Mutex::new(read),
            write: Mutex::new(Some(write)),
            peer_addr,
            congestion_wait: Duration::from_millis(config.congestion_wait_ms),
        }
    }
}

#[async_trait]
impl PeerLink for TcpLink {
    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.write.lock().await;
        let write = guard.as_mut().ok_or(TransportError::NotConnected)?;
        match tokio::time::timeout(self.congestion_wait, write.writable()).await {
            Err(_) => return Err(TransportError::Congested),
            Ok(ready) => ready.map_err(TransportError::from_io)?,
        }
        write.write_all(frame).await.map_err(TransportError::from_io)?;
        write.flush().await.map_err(TransportError::from_io)?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Bytes> {
        let mut read = self.read.lock().await;
        let mut header = [0u8; HEADER_SIZE];
        read.read_exact(&mut header)
            .await
            .map_err(TransportError::from_io)?;
        let total = match announced_length(&header) {
            Ok(total) => total,
            Err(e) => {
                // Without a byte order the next frame boundary is unknown.
                warn!(peer = %self.peer_addr, error = %e, "frame boundary lost, dropping connection");
                return Err(TransportError::ConnectionReset);
            }
        };
        let mut frame = vec![0u8; total];
        frame[..HEADER_SIZE].copy_from_slice(&header);
        if total > HEADER_SIZE {
            read.read_exact(&mut frame[HEADER_SIZE..])
                .await
                .map_err(TransportError::from_io)?;
        }
        // Checked once the body is consumed, so a rejected frame leaves the
        // stream at the next header.
        frame_length(&header)?;
        Ok(Bytes::from(frame))
    }

    fn peer_addr(&self) -> String {
        self.peer_addr.clone()
    }

    async fn close(&self) {
        if let Some(mut write) = self.write.lock().await.take() {
            let _ = write.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};
    use crate::error::ProtocolError;
    use crate::message::{MountPayload, Payload, WireMessage};
    use crate::protocol::{Command, MountOp, Originator};

    #[tokio::test]
    async fn test_send_recv_frame() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let link = transport.accept(&listener).await.unwrap();
            let frame = link.recv_frame().await.unwrap();
            let msg = decode(&frame).unwrap();
            assert_eq!(msg.command(), Command::Mount(MountOp::Init));
            let reply = WireMessage::reply_to(&msg.header, msg.header.destination, msg.payload);
            link.send_frame(&encode(&reply).unwrap()).await.unwrap();
        });

        let client_transport = TcpTransport::new(TcpTransportConfig::default());
        let link = client_transport.connect(&addr).await.unwrap();
        let msg = WireMessage::new(
            Command::Mount(MountOp::Init),
            Originator::Client,
            Payload::Mount(MountPayload::default()),
        );
        link.send_frame(&encode(&msg).unwrap()).await.unwrap();
        let reply = decode(&link.recv_frame().await.unwrap()).unwrap();
        assert!(reply.header.is_reply());

        server.await.unwrap();
    }

    async fn connected_pair() -> (TcpLink, TcpLink) {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { transport.accept(&listener).await.unwrap() });
        let link = TcpTransport::new(TcpTransportConfig::default())
            .connect(&addr)
            .await
            .unwrap();
        (link, accept.await.unwrap())
    }

    fn init_frame() -> Bytes {
        let msg = WireMessage::new(
            Command::Mount(MountOp::Init),
            Originator::Client,
            Payload::Mount(MountPayload::default()),
        );
        encode(&msg).unwrap()
    }

    #[tokio::test]
    async fn test_bad_magic_frame_is_skipped() {
        let (link, peer) = connected_pair().await;
        let good = init_frame();
        let mut bad = good.to_vec();
        bad[0] ^= 0xFF;
        link.send_frame(&bad).await.unwrap();
        link.send_frame(&good).await.unwrap();

        assert!(matches!(
            peer.recv_frame().await,
            Err(TransportError::Protocol(ProtocolError::InvalidMagic { .. }))
        ));
        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(frame, good);
        assert_eq!(decode(&frame).unwrap().command(), Command::Mount(MountOp::Init));
    }

    #[tokio::test]
    async fn test_bad_byte_order_tag_drops_connection() {
        let (link, peer) = connected_pair().await;
        let mut bad = init_frame().to_vec();
        bad[crate::protocol::BYTE_ORDER_OFFSET] = 0x7F;
        link.send_frame(&bad).await.unwrap();
        assert!(matches!(
            peer.recv_frame().await,
            Err(TransportError::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { transport.accept(&listener).await.unwrap() });

        let link = TcpTransport::new(TcpTransportConfig::default())
            .connect(&addr)
            .await
            .unwrap();
        let _peer = accept.await.unwrap();
        link.close().await;
        assert!(matches!(
            link.send_frame(b"x").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_recv_after_peer_close() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { transport.accept(&listener).await.unwrap() });

        let link = TcpTransport::new(TcpTransportConfig::default())
            .connect(&addr)
            .await
            .unwrap();
        let peer = accept.await.unwrap();
        drop(peer);
        assert!(matches!(
            link.recv_frame().await,
            Err(TransportError::ConnectionReset)
        ));
    }
}
