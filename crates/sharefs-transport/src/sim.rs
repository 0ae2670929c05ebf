//! In-memory peer links for testing without sockets.
//!
//! A [`SimLink`] pair behaves like a connected socket pair: frames sent on one
//! end arrive in order on the other. Faults can be injected per end so the
//! retry and disconnect paths can be exercised deterministically.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{Result, TransportError};
use crate::link::PeerLink;

/// Fault injected on the sending side of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SimFault {
    /// Sends succeed.
    None = 0,
    /// Every send reports congestion.
    Congested = 1,
    /// Every send reports a reset connection.
    Reset = 2,
}

impl From<u8> for SimFault {
    fn from(value: u8) -> Self {
        match value {
            1 => SimFault::Congested,
            2 => SimFault::Reset,
            _ => SimFault::None,
        }
    }
}

/// One end of an in-memory link pair.
pub struct SimLink {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    fault: AtomicU8,
    congested_sends: AtomicU32,
    send_attempts: AtomicU32,
    closed: watch::Sender<bool>,
}

impl SimLink {
    /// Creates a connected pair named after its two ends.
    pub fn pair(a: &str, b: &str) -> (SimLink, SimLink) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let left = SimLink::new(format!("sim:{a}->{b}"), tx_ab, rx_ba);
        let right = SimLink::new(format!("sim:{b}->{a}"), tx_ba, rx_ab);
        (left, right)
    }

    fn new(
        name: String,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            name,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            fault: AtomicU8::new(SimFault::None as u8),
            congested_sends: AtomicU32::new(0),
            send_attempts: AtomicU32::new(0),
            closed: watch::Sender::new(false),
        }
    }

    /// Injects a persistent fault on this end's sends.
    pub fn inject(&self, fault: SimFault) {
        self.fault.store(fault as u8, Ordering::SeqCst);
    }

    /// Makes the next `count` sends report congestion, then recover.
    pub fn congest_next(&self, count: u32) {
        self.congested_sends.store(count, Ordering::SeqCst);
    }

    /// Number of send attempts made on this end.
    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    fn take_congested(&self) -> bool {
        self.congested_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PeerLink for SimLink {
    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        match SimFault::from(self.fault.load(Ordering::SeqCst)) {
            SimFault::Congested => return Err(TransportError::Congested),
            SimFault::Reset => return Err(TransportError::ConnectionReset),
            SimFault::None => {}
        }
        if self.take_congested() {
            return Err(TransportError::Congested);
        }
        let tx = self.tx.lock().await;
        let tx = tx.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(Bytes::copy_from_slice(frame))
            .map_err(|_| TransportError::ConnectionReset)
    }

    async fn recv_frame(&self) -> Result<Bytes> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => frame.ok_or(TransportError::ConnectionReset),
            _ = closed.wait_for(|c| *c) => Err(TransportError::NotConnected),
        }
    }

    fn peer_addr(&self) -> String {
        self.name.clone()
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.tx.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = SimLink::pair("a", "b");
        a.send_frame(b"one").await.unwrap();
        a.send_frame(b"two").await.unwrap();
        assert_eq!(&b.recv_frame().await.unwrap()[..], b"one");
        assert_eq!(&b.recv_frame().await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_injected_congestion() {
        let (a, _b) = SimLink::pair("a", "b");
        a.inject(SimFault::Congested);
        assert!(matches!(
            a.send_frame(b"x").await,
            Err(TransportError::Congested)
        ));
        a.inject(SimFault::None);
        a.congest_next(2);
        assert!(a.send_frame(b"x").await.is_err());
        assert!(a.send_frame(b"x").await.is_err());
        assert!(a.send_frame(b"x").await.is_ok());
        assert_eq!(a.send_attempts(), 4);
    }

    #[tokio::test]
    async fn test_close_ends_peer_receive() {
        let (a, b) = SimLink::pair("a", "b");
        a.close().await;
        assert!(matches!(
            b.recv_frame().await,
            Err(TransportError::ConnectionReset)
        ));
        assert!(matches!(
            a.send_frame(b"x").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let (a, _b) = SimLink::pair("a", "b");
        let a = std::sync::Arc::new(a);
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.recv_frame().await })
        };
        tokio::task::yield_now().await;
        a.close().await;
        assert!(matches!(
            reader.await.unwrap(),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_drop_resets_peer() {
        let (a, b) = SimLink::pair("a", "b");
        drop(b);
        assert!(matches!(
            a.send_frame(b"x").await,
            Err(TransportError::ConnectionReset)
        ));
    }
}
