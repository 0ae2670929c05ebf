//! Connection abstraction shared by the TCP and simulated links.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// One bidirectional, framed connection to a peer.
///
/// `send_frame` makes exactly one attempt; callers own the retry policy.
/// A send that cannot make progress because the socket is congested fails
/// with [`crate::TransportError::Congested`] before any byte is written, so
/// retrying never duplicates part of a frame.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Writes one encoded frame.
    async fn send_frame(&self, frame: &[u8]) -> Result<()>;

    /// Reads one complete frame (header plus payload).
    async fn recv_frame(&self) -> Result<Bytes>;

    /// Remote address, for logging.
    fn peer_addr(&self) -> String;

    /// Closes the link; pending and future operations fail.
    async fn close(&self);
}
