//! Transport session: per-peer ordered sends with bounded retry, replies and
//! request/reply correlation.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sharefs_transport::{
    codec, Payload, PeerLink, SendOutcome, SendRetry, SendRetryConfig, TransportError, WaitFlag,
    WireMessage,
};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::registry::ClientRegistry;
use crate::session::{ClientSession, SessionFlags};
use crate::types::{Epoch, MetaError, PeerOrdinal, ReplyContext};

/// Stamps, frames and delivers messages to peers.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ClientRegistry>,
    retry: SendRetry,
    local: PeerOrdinal,
    fs_id: u32,
    fs_generation: u32,
    epoch: Arc<Epoch>,
    request_timeout: Duration,
    pending: DashMap<(PeerOrdinal, u32), oneshot::Sender<WireMessage>>,
}

/// Identity stamped on every outgoing header.
#[derive(Debug, Clone, Copy)]
pub struct LocalIdentity {
    /// Local ordinal.
    pub ordinal: PeerOrdinal,
    /// Filesystem identity.
    pub fs_id: u32,
    /// Filesystem generation.
    pub fs_generation: u32,
}

impl Messenger {
    /// Creates a messenger over `registry`.
    pub fn new(
        registry: Arc<ClientRegistry>,
        identity: LocalIdentity,
        epoch: Arc<Epoch>,
        retry: SendRetryConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                retry: SendRetry::new(retry),
                local: identity.ordinal,
                fs_id: identity.fs_id,
                fs_generation: identity.fs_generation,
                epoch,
                request_timeout,
                pending: DashMap::new(),
            }),
        }
    }

    /// Local ordinal.
    pub fn local(&self) -> PeerOrdinal {
        self.inner.local
    }

    /// Fills in the header fields owned by the sender.
    pub fn stamp(&self, msg: &mut WireMessage, destination: PeerOrdinal, ack: u32) {
        let header = &mut msg.header;
        header.origin = self.inner.local;
        header.destination = destination;
        header.fs_id = self.inner.fs_id;
        header.fs_generation = self.inner.fs_generation;
        header.coord_generation = self.inner.epoch.current();
        header.ack = ack;
    }

    /// Sends `msg` to `ordinal`. Requests get the next sequence number;
    /// replies keep the sequence of the request they answer.
    ///
    /// Congestion is retried within the budget; when it runs out the peer is
    /// flagged `SOCK_BLOCKED` and `PeerBlocked` is returned. A reset-class
    /// failure clears the session and returns `NotConnected`.
    pub async fn send(&self, ordinal: PeerOrdinal, msg: WireMessage) -> Result<u32, MetaError> {
        self.transmit(ordinal, msg, None).await
    }

    /// Sends a reply; the header must come from [`WireMessage::reply_to`].
    pub async fn reply(&self, ordinal: PeerOrdinal, msg: WireMessage) -> Result<(), MetaError> {
        debug_assert!(msg.header.is_reply());
        self.transmit(ordinal, msg, None).await.map(|_| ())
    }

    /// Sends a request and waits for its reply.
    ///
    /// A reply carrying an error code is turned back into the matching
    /// [`MetaError`]. No reply within the request timeout is `WouldBlock`.
    pub async fn request(
        &self,
        ordinal: PeerOrdinal,
        mut msg: WireMessage,
    ) -> Result<WireMessage, MetaError> {
        msg.header.wait_flag = WaitFlag::Wait;
        let resource = msg.payload.resource().unwrap_or_default();
        let sent_generation = self.inner.epoch.current();
        let (tx, rx) = oneshot::channel();
        let seqno = self.transmit(ordinal, msg, Some(tx)).await?;

        let reply = match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(MetaError::NotConnected(ordinal)),
            Err(_) => {
                self.inner.pending.remove(&(ordinal, seqno));
                debug!(ordinal = %ordinal, seqno, "request timed out");
                return Err(MetaError::WouldBlock(resource));
            }
        };
        if reply.header.error != 0 {
            let ctx = ReplyContext {
                local: self.inner.local,
                peer: ordinal,
                resource,
                sent_generation,
                reply_generation: reply.header.coord_generation,
            };
            return Err(MetaError::from_wire(reply.header.error, &ctx));
        }
        Ok(reply)
    }

    async fn transmit(
        &self,
        ordinal: PeerOrdinal,
        mut msg: WireMessage,
        waiter: Option<oneshot::Sender<WireMessage>>,
    ) -> Result<u32, MetaError> {
        let registry = &self.inner.registry;
        let session = registry
            .get(ordinal, false)
            .ok_or(MetaError::NotConnected(ordinal))?;

        let guard = session.write_lock().lock().await;
        let link = session.link().ok_or(MetaError::NotConnected(ordinal))?;
        let reply = msg.header.is_reply();
        if !reply {
            msg.header.seqno = session.next_sequence();
            msg.header.flags.reset_seqno = msg.header.seqno == 1;
        }
        let seqno = msg.header.seqno;
        let command = msg.command();
        self.stamp(&mut msg, ordinal, session.last_received());
        let frame = codec::encode(&msg)?;

        if let Some(tx) = waiter {
            self.inner.pending.insert((ordinal, seqno), tx);
        }
        let blocked = session.flags().contains(SessionFlags::SOCK_BLOCKED);
        let link = &link;
        let frame = &frame;
        let outcome = self
            .inner
            .retry
            .run(blocked, move || link.send_frame(frame))
            .await;

        match outcome {
            SendOutcome::Delivered { attempts } => {
                if !reply && msg.header.wait_flag != WaitFlag::OneWay {
                    session.record_sent(seqno, command);
                }
                if attempts > 1 {
                    debug!(ordinal = %ordinal, %command, attempts, "delivered after retry");
                }
                Ok(seqno)
            }
            SendOutcome::Exhausted { attempts } => {
                drop(guard);
                self.inner.pending.remove(&(ordinal, seqno));
                registry.mark_sock_blocked(ordinal);
                Err(MetaError::PeerBlocked { ordinal, attempts })
            }
            SendOutcome::Failed { error, attempts } => {
                drop(guard);
                self.inner.pending.remove(&(ordinal, seqno));
                match error {
                    TransportError::Protocol(e) => Err(MetaError::Protocol(e)),
                    error => {
                        warn!(ordinal = %ordinal, %command, attempts, %error, "send failed, clearing session");
                        registry.clear(ordinal).await;
                        self.fail_pending(ordinal);
                        Err(MetaError::NotConnected(ordinal))
                    }
                }
            }
        }
    }

    /// Sends `msg` to every connected peer except `exclude` and the local
    /// node. Failures are collected per peer.
    pub async fn broadcast(
        &self,
        msg: &WireMessage,
        exclude: Option<PeerOrdinal>,
    ) -> Vec<(PeerOrdinal, MetaError)> {
        let targets: Vec<PeerOrdinal> = self
            .inner
            .registry
            .connected()
            .iter()
            .map(|s| s.ordinal())
            .filter(|o| Some(*o) != exclude && *o != self.inner.local)
            .collect();

        let mut set = JoinSet::new();
        for ordinal in targets {
            let messenger = self.clone();
            let msg = msg.clone();
            set.spawn(async move { (ordinal, messenger.send(ordinal, msg).await) });
        }

        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((ordinal, Err(e))) => {
                    debug!(ordinal = %ordinal, error = %e, "broadcast delivery failed");
                    failures.push((ordinal, e));
                }
                Err(e) => warn!(error = %e, "broadcast task failed"),
            }
        }
        failures
    }

    /// Reads one message from a peer and records the contact.
    pub async fn receive(&self, session: &ClientSession) -> Result<WireMessage, MetaError> {
        let ordinal = session.ordinal();
        let link = session.link().ok_or(MetaError::NotConnected(ordinal))?;
        let frame = link.recv_frame().await.map_err(|e| match e {
            TransportError::Protocol(p) => MetaError::Protocol(p),
            _ => MetaError::NotConnected(ordinal),
        })?;
        let msg = codec::decode(&frame)?;
        let registry = &self.inner.registry;
        registry.touch(ordinal, if msg.header.is_reply() { 0 } else { msg.header.seqno });
        registry.acknowledge(ordinal, msg.header.ack);
        Ok(msg)
    }

    /// Hands a reply to its waiting request. Returns the message back if it
    /// is not a reply so the caller can dispatch it.
    pub fn complete(&self, ordinal: PeerOrdinal, msg: WireMessage) -> Option<WireMessage> {
        if !msg.header.is_reply() {
            return Some(msg);
        }
        match self.inner.pending.remove(&(ordinal, msg.header.seqno)) {
            Some((_, tx)) => {
                let _ = tx.send(msg);
            }
            None => debug!(ordinal = %ordinal, seqno = msg.header.seqno, command = %msg.command(), "unmatched reply"),
        }
        None
    }

    /// Fails every request waiting on `ordinal`.
    pub fn fail_pending(&self, ordinal: PeerOrdinal) {
        self.inner.pending.retain(|(o, _), _| *o != ordinal);
    }

    /// Requests currently waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}

/// Error reply for `request`.
pub fn error_reply(request: &WireMessage, local: PeerOrdinal, error: &MetaError) -> WireMessage {
    let mut reply = WireMessage::reply_to(
        &request.header,
        local,
        Payload::empty_for(request.command()),
    );
    if let (Payload::Lease(p), Some(resource)) =
        (&mut reply.payload, request.payload.resource())
    {
        p.resource = resource;
    }
    reply.header.error = error.wire_code();
    reply
}
