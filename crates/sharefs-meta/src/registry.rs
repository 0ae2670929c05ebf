//! Client registry: the concurrency-safe map from ordinal to session.
//!
//! Slots are never removed while the instance is mounted, so flags such as
//! `OFF` survive disconnects. Accessors take the map lock only long enough to
//! find or insert a slot; closing links and aborting readers happen after it
//! is released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sharefs_transport::{ByteOrder, PeerLink};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::session::{ClientSession, PeerTags, SessionFlags};
use crate::types::{MetaError, PeerInfo, PeerOrdinal};

/// Administrative state requested for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminState {
    /// Allow the peer to connect.
    On,
    /// Disable the peer once it unmounts or its grace period ends.
    Off,
}

fn same_link(a: &Arc<dyn PeerLink>, b: &Arc<dyn PeerLink>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Sparse, growable table of peer sessions.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: RwLock<BTreeMap<PeerOrdinal, Arc<ClientSession>>>,
    live: AtomicUsize,
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a connection for `ordinal`.
    ///
    /// Fails with `AlreadyConnected` if a live link exists and with
    /// `HostDisabled` if the ordinal is administratively off.
    pub fn add_client(
        &self,
        ordinal: PeerOrdinal,
        name: &str,
        tags: PeerTags,
        link: Arc<dyn PeerLink>,
    ) -> Result<Arc<ClientSession>, MetaError> {
        if ordinal.is_coordinator_alias() {
            return Err(MetaError::InvalidOrdinal(ordinal.as_u32()));
        }
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .entry(ordinal)
            .or_insert_with(|| Arc::new(ClientSession::new(ordinal)))
            .clone();
        if session.is_connected() {
            return Err(MetaError::AlreadyConnected(ordinal));
        }
        if session.flags().contains(SessionFlags::OFF) {
            return Err(MetaError::HostDisabled(ordinal));
        }
        session.reset_sequence();
        session.install(name, tags, link);
        session.remove_flags(SessionFlags::TRANSIENT);
        drop(sessions);

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        info!(ordinal = %ordinal, name, live, "client connected");
        Ok(session)
    }

    /// Looks up a session, creating an empty slot if asked to.
    pub fn get(&self, ordinal: PeerOrdinal, create: bool) -> Option<Arc<ClientSession>> {
        if let Some(session) = self.sessions.read().unwrap().get(&ordinal) {
            return Some(session.clone());
        }
        if !create || ordinal.is_coordinator_alias() {
            return None;
        }
        let mut sessions = self.sessions.write().unwrap();
        Some(
            sessions
                .entry(ordinal)
                .or_insert_with(|| Arc::new(ClientSession::new(ordinal)))
                .clone(),
        )
    }

    /// Drops the connection of `ordinal` and resets its transient state.
    ///
    /// Returns true if a link was installed.
    pub async fn clear(&self, ordinal: PeerOrdinal) -> bool {
        let Some(session) = self.get(ordinal, false) else {
            return false;
        };
        self.detach(&session).await
    }

    /// Like [`clear`](Self::clear) but only if `link` is still the installed
    /// connection. Used by readers so a stale reader cannot drop a newer link.
    pub async fn clear_link(&self, ordinal: PeerOrdinal, link: &Arc<dyn PeerLink>) -> bool {
        let Some(session) = self.get(ordinal, false) else {
            return false;
        };
        match session.link() {
            Some(current) if same_link(&current, link) => self.detach(&session).await,
            _ => false,
        }
    }

    async fn detach(&self, session: &ClientSession) -> bool {
        let link = session.take_link();
        session.remove_flags(SessionFlags::SOCK_BLOCKED);
        session.set_mounted(false);
        session.set_resynced(false);
        match link {
            Some(link) => {
                let live = self
                    .live
                    .fetch_sub(1, Ordering::SeqCst)
                    .saturating_sub(1);
                info!(ordinal = %session.ordinal(), live, "client cleared");
                link.close().await;
                true
            }
            None => false,
        }
    }

    /// Requests an administrative state change.
    ///
    /// `Off` only marks the peer `OFF_PENDING`; the sweep completes it.
    pub fn set_admin_state(&self, ordinal: PeerOrdinal, state: AdminState) -> Result<(), MetaError> {
        let session = self
            .get(ordinal, true)
            .ok_or(MetaError::InvalidOrdinal(ordinal.as_u32()))?;
        match state {
            AdminState::Off => {
                if session.flags().contains(SessionFlags::OFF) {
                    return Ok(());
                }
                session.reset_off_ticks();
                session.insert_flags(SessionFlags::OFF_PENDING);
                info!(ordinal = %ordinal, "host off pending");
            }
            AdminState::On => {
                session.remove_flags(SessionFlags::OFF | SessionFlags::OFF_PENDING);
                info!(ordinal = %ordinal, "host on");
            }
        }
        Ok(())
    }

    /// Advances every `OFF_PENDING` peer by one tick.
    ///
    /// A peer that has unmounted or used up `timeout_ticks` becomes `OFF`, its
    /// reader is aborted and its link cleared. Returns the peers forced off.
    pub async fn sweep_off_pending(&self, timeout_ticks: u32) -> Vec<PeerOrdinal> {
        let pending: Vec<Arc<ClientSession>> = self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.flags().contains(SessionFlags::OFF_PENDING))
            .cloned()
            .collect();

        let mut forced = Vec::new();
        for session in pending {
            let ticks = session.tick_off_pending();
            let unmounted = !session.is_mounted();
            if ticks < timeout_ticks && !unmounted {
                continue;
            }
            session.insert_flags(SessionFlags::OFF);
            session.remove_flags(SessionFlags::OFF_PENDING);
            let reader = session.abort_reader();
            self.detach(&session).await;
            if unmounted {
                info!(ordinal = %session.ordinal(), reader, "host off after unmount");
            } else {
                warn!(ordinal = %session.ordinal(), ticks, reader, "host forced off after timeout");
            }
            forced.push(session.ordinal());
        }
        forced
    }

    /// Flags a peer whose sends keep hitting congestion.
    pub fn mark_sock_blocked(&self, ordinal: PeerOrdinal) {
        if let Some(session) = self.get(ordinal, false) {
            let before = session.insert_flags(SessionFlags::SOCK_BLOCKED);
            if !before.contains(SessionFlags::SOCK_BLOCKED) {
                warn!(ordinal = %ordinal, "stop sending, socket blocked");
            }
        }
    }

    /// Records traffic from a peer and clears `SOCK_BLOCKED`.
    pub fn touch(&self, ordinal: PeerOrdinal, seqno: u32) {
        if let Some(session) = self.get(ordinal, false) {
            session.note_received(seqno);
            let before = session.remove_flags(SessionFlags::SOCK_BLOCKED);
            if before.contains(SessionFlags::SOCK_BLOCKED) {
                info!(ordinal = %ordinal, "resume sending");
            }
        }
    }

    /// Trims a peer's outstanding queue to its acknowledgement.
    pub fn acknowledge(&self, ordinal: PeerOrdinal, ack: u32) -> usize {
        self.get(ordinal, false)
            .map(|s| s.acknowledge(ack))
            .unwrap_or(0)
    }

    /// Declares a peer unreachable.
    pub fn mark_inop(&self, ordinal: PeerOrdinal) {
        if let Some(session) = self.get(ordinal, true) {
            session.insert_flags(SessionFlags::INOP);
        }
    }

    /// Records a peer's mount status.
    pub fn set_mounted(&self, ordinal: PeerOrdinal, mounted: bool) {
        if let Some(session) = self.get(ordinal, false) {
            session.set_mounted(mounted);
            debug!(ordinal = %ordinal, mounted, "mount status");
        }
    }

    /// Marks a peer as having answered the current resync pass.
    pub fn set_resynced(&self, ordinal: PeerOrdinal) {
        if let Some(session) = self.get(ordinal, false) {
            session.set_resynced(true);
        }
    }

    /// Starts a resync pass: clears `INOP` and the resynced marks.
    pub fn begin_resync(&self) {
        for session in self.sessions.read().unwrap().values() {
            session.remove_flags(SessionFlags::INOP);
            session.set_resynced(false);
        }
    }

    /// True when every connected peer has resynced.
    pub fn all_resynced(&self) -> bool {
        self.connected().iter().all(|s| s.is_resynced())
    }

    /// Registers the reader task of a peer, aborting any previous one.
    pub fn set_reader(&self, ordinal: PeerOrdinal, handle: AbortHandle) {
        match self.get(ordinal, false) {
            Some(session) => session.set_reader(handle),
            None => handle.abort(),
        }
    }

    /// Session with the given host name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<ClientSession>> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// True if `ordinal` has a live link.
    pub fn is_connected(&self, ordinal: PeerOrdinal) -> bool {
        self.get(ordinal, false)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    /// Snapshot of the connected sessions.
    pub fn connected(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.is_connected())
            .cloned()
            .collect()
    }

    /// Number of live connections.
    pub fn live_clients(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Reporting snapshot of every known peer.
    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .map(|s| s.info())
            .collect()
    }

    /// Validates a failover target: connected, mounted, same byte order.
    pub fn check_candidate(&self, name: &str) -> Result<PeerOrdinal, MetaError> {
        let not_ready = || MetaError::CandidateNotReady(name.to_string());
        let session = self.find_by_name(name).ok_or_else(not_ready)?;
        let flags = session.flags();
        if !session.is_connected()
            || !session.is_mounted()
            || flags.intersects(SessionFlags::OFF | SessionFlags::OFF_PENDING | SessionFlags::INOP)
        {
            debug!(name, connected = session.is_connected(), mounted = session.is_mounted(), %flags, "candidate rejected");
            return Err(not_ready());
        }
        if session.tags().byte_order != ByteOrder::native() {
            debug!(name, "candidate speaks a different byte order");
            return Err(not_ready());
        }
        Ok(session.ordinal())
    }
}
