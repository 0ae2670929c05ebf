//! Per-peer session state held by the client registry.
//!
//! A session outlives its connection: when a peer disconnects the link is
//! dropped but the slot, its name and its administrative flags stay so a
//! disabled host stays disabled across reconnects.

use std::collections::VecDeque;
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use sharefs_transport::{ByteOrder, Command, PeerLink};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::types::{PeerInfo, PeerOrdinal};

/// Health flags of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags(u8);

impl SessionFlags {
    /// No flags.
    pub const NONE: SessionFlags = SessionFlags(0);
    /// Administratively disabled.
    pub const OFF: SessionFlags = SessionFlags(0x01);
    /// Disable requested, waiting for the peer to unmount.
    pub const OFF_PENDING: SessionFlags = SessionFlags(0x02);
    /// Sends recently failed with congestion.
    pub const SOCK_BLOCKED: SessionFlags = SessionFlags(0x04);
    /// Declared unreachable.
    pub const INOP: SessionFlags = SessionFlags(0x08);

    /// Flags cleared whenever a connection is dropped or re-established.
    pub const TRANSIENT: SessionFlags = SessionFlags(0x04 | 0x08);

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// True if every flag in `other` is set.
    pub fn contains(self, other: SessionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any flag in `other` is set.
    pub fn intersects(self, other: SessionFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Flag names, for reporting.
    pub fn names(self) -> Vec<String> {
        [
            (Self::OFF, "off"),
            (Self::OFF_PENDING, "off_pending"),
            (Self::SOCK_BLOCKED, "sock_blocked"),
            (Self::INOP, "inop"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name.to_string())
        .collect()
    }
}

impl BitOr for SessionFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        SessionFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for SessionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Capability and byte-order tags negotiated at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTags {
    /// Byte order the peer writes.
    pub byte_order: ByteOrder,
    /// Capability bits advertised by the peer.
    pub capabilities: u32,
}

impl Default for PeerTags {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::native(),
            capabilities: 0,
        }
    }
}

/// A message sent to the peer and not yet acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outstanding {
    /// Sequence number.
    pub seqno: u32,
    /// Command sent.
    pub command: Command,
    /// When it was sent.
    pub sent_at: Instant,
}

/// True if sequence `a` comes after `b`, allowing for wrap-around.
pub fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// State for one peer.
pub struct ClientSession {
    ordinal: PeerOrdinal,
    name: RwLock<String>,
    tags: RwLock<PeerTags>,
    link: RwLock<Option<Arc<dyn PeerLink>>>,
    write_lock: tokio::sync::Mutex<()>,
    outstanding: Mutex<VecDeque<Outstanding>>,
    next_seq: AtomicU32,
    min_acked: AtomicU32,
    last_received: AtomicU32,
    flags: AtomicU8,
    mounted: AtomicBool,
    resynced: AtomicBool,
    off_ticks: AtomicU32,
    last_contact: Mutex<Option<Instant>>,
    reader: Mutex<Option<AbortHandle>>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("ordinal", &self.ordinal)
            .field("name", &self.name())
            .field("connected", &self.is_connected())
            .field("flags", &self.flags())
            .finish()
    }
}

impl ClientSession {
    pub(crate) fn new(ordinal: PeerOrdinal) -> Self {
        Self {
            ordinal,
            name: RwLock::new(String::new()),
            tags: RwLock::new(PeerTags::default()),
            link: RwLock::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            outstanding: Mutex::new(VecDeque::new()),
            next_seq: AtomicU32::new(1),
            min_acked: AtomicU32::new(0),
            last_received: AtomicU32::new(0),
            flags: AtomicU8::new(0),
            mounted: AtomicBool::new(false),
            resynced: AtomicBool::new(false),
            off_ticks: AtomicU32::new(0),
            last_contact: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// Peer ordinal.
    pub fn ordinal(&self) -> PeerOrdinal {
        self.ordinal
    }

    /// Host name.
    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    /// Negotiated tags.
    pub fn tags(&self) -> PeerTags {
        *self.tags.read().unwrap()
    }

    /// Installed link, if connected.
    pub fn link(&self) -> Option<Arc<dyn PeerLink>> {
        self.link.read().unwrap().clone()
    }

    /// True if a link is installed.
    pub fn is_connected(&self) -> bool {
        self.link.read().unwrap().is_some()
    }

    /// Current flags.
    pub fn flags(&self) -> SessionFlags {
        SessionFlags(self.flags.load(Ordering::SeqCst))
    }

    /// True if the peer reports the filesystem mounted.
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// True once the peer has answered the current resync pass.
    pub fn is_resynced(&self) -> bool {
        self.resynced.load(Ordering::SeqCst)
    }

    /// Lowest sequence the peer has not acknowledged.
    pub fn min_acked(&self) -> u32 {
        self.min_acked.load(Ordering::SeqCst)
    }

    /// Highest sequence received from the peer; sent back as the ack.
    pub fn last_received(&self) -> u32 {
        self.last_received.load(Ordering::SeqCst)
    }

    /// Messages awaiting acknowledgement.
    pub fn outstanding(&self) -> Vec<Outstanding> {
        self.outstanding.lock().unwrap().iter().copied().collect()
    }

    /// Time since the last message from the peer.
    pub fn idle(&self) -> Option<std::time::Duration> {
        self.last_contact.lock().unwrap().map(|t| t.elapsed())
    }

    /// Serialises senders to this peer.
    pub(crate) fn write_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.write_lock
    }

    /// Allocates the next outbound sequence number.
    pub(crate) fn next_sequence(&self) -> u32 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if seq == 0 {
            self.next_seq.fetch_add(1, Ordering::SeqCst)
        } else {
            seq
        }
    }

    pub(crate) fn record_sent(&self, seqno: u32, command: Command) {
        self.outstanding.lock().unwrap().push_back(Outstanding {
            seqno,
            command,
            sent_at: Instant::now(),
        });
    }

    /// Drops outstanding messages up to and including `ack`.
    pub(crate) fn acknowledge(&self, ack: u32) -> usize {
        if ack == 0 {
            return 0;
        }
        let mut queue = self.outstanding.lock().unwrap();
        let before = queue.len();
        queue.retain(|m| seq_after(m.seqno, ack));
        self.min_acked.store(ack.wrapping_add(1), Ordering::SeqCst);
        before - queue.len()
    }

    pub(crate) fn note_received(&self, seqno: u32) {
        if seqno != 0 {
            self.last_received.store(seqno, Ordering::SeqCst);
        }
        *self.last_contact.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn reset_sequence(&self) {
        self.next_seq.store(1, Ordering::SeqCst);
        self.min_acked.store(0, Ordering::SeqCst);
        self.outstanding.lock().unwrap().clear();
    }

    pub(crate) fn install(&self, name: &str, tags: PeerTags, link: Arc<dyn PeerLink>) {
        *self.name.write().unwrap() = name.to_string();
        *self.tags.write().unwrap() = tags;
        *self.link.write().unwrap() = Some(link);
        *self.last_contact.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn take_link(&self) -> Option<Arc<dyn PeerLink>> {
        self.link.write().unwrap().take()
    }

    pub(crate) fn insert_flags(&self, flags: SessionFlags) -> SessionFlags {
        SessionFlags(self.flags.fetch_or(flags.0, Ordering::SeqCst))
    }

    pub(crate) fn remove_flags(&self, flags: SessionFlags) -> SessionFlags {
        SessionFlags(self.flags.fetch_and(!flags.0, Ordering::SeqCst))
    }

    pub(crate) fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::SeqCst);
    }

    pub(crate) fn set_resynced(&self, resynced: bool) {
        self.resynced.store(resynced, Ordering::SeqCst);
    }

    pub(crate) fn reset_off_ticks(&self) {
        self.off_ticks.store(0, Ordering::SeqCst);
    }

    pub(crate) fn tick_off_pending(&self) -> u32 {
        self.off_ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn set_reader(&self, handle: AbortHandle) {
        if let Some(old) = self.reader.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    pub(crate) fn abort_reader(&self) -> bool {
        match self.reader.lock().unwrap().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Reporting snapshot.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            ordinal: self.ordinal,
            name: self.name(),
            connected: self.is_connected(),
            mounted: self.is_mounted(),
            flags: self.flags().names(),
            byte_order: self.tags().byte_order,
            idle_ms: self.idle().map(|d| d.as_millis() as u64),
        }
    }
}
