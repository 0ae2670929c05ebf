use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use sharefs_transport::{ByteOrder, ProtocolError};
use thiserror::Error;

pub use sharefs_transport::{PeerOrdinal, ResourceId};

/// Role of the local node for one filesystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    /// Authoritative metadata coordinator.
    Server = 0,
    /// Ordinary peer.
    Client = 1,
}

impl From<u8> for Role {
    fn from(value: u8) -> Self {
        match value {
            0 => Role::Server,
            _ => Role::Client,
        }
    }
}

/// Coordinator hand-off phase of one filesystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    /// Normal service.
    Active = 0,
    /// New operations are held back while in-flight work drains.
    Freezing = 1,
    /// Fully drained; roles may change.
    Frozen = 2,
    /// New coordinator is re-establishing leases with its peers.
    Resyncing = 3,
}

impl From<u8> for Phase {
    fn from(value: u8) -> Self {
        match value {
            1 => Phase::Freezing,
            2 => Phase::Frozen,
            3 => Phase::Resyncing,
            _ => Phase::Active,
        }
    }
}

impl Phase {
    /// True while a hand-off is under way.
    pub fn is_frozen_or_freezing(self) -> bool {
        matches!(self, Phase::Freezing | Phase::Frozen)
    }
}

/// Coordinator generation shared by every component of one instance.
///
/// Incremented on every hand-off; never decreases.
#[derive(Debug, Default)]
pub struct Epoch(AtomicU32);

impl Epoch {
    /// Creates an epoch starting at `generation`.
    pub fn new(generation: u32) -> Self {
        Epoch(AtomicU32::new(generation))
    }

    /// Current generation.
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Moves to the next generation and returns it.
    pub fn advance(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Adopts `generation` if it is newer. Returns true if it was.
    pub fn observe(&self, generation: u32) -> bool {
        self.0.fetch_max(generation, Ordering::SeqCst) < generation
    }
}

/// Kinds of lease a peer can hold on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum LeaseKind {
    /// Cache and read data.
    Read = 0,
    /// Modify data.
    Write = 1,
    /// Extend the file.
    Append = 2,
    /// Shrink the file.
    Truncate = 3,
    /// Hold record locks.
    RecordLock = 4,
    /// Stage data back from archive.
    Stage = 5,
    /// Keep the file open.
    Open = 6,
    /// Map the file into memory.
    Mmap = 7,
}

impl LeaseKind {
    /// Every kind, in bit order.
    pub const ALL: [LeaseKind; 8] = [
        LeaseKind::Read,
        LeaseKind::Write,
        LeaseKind::Append,
        LeaseKind::Truncate,
        LeaseKind::RecordLock,
        LeaseKind::Stage,
        LeaseKind::Open,
        LeaseKind::Mmap,
    ];

    /// Bit index of this kind.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Kind with the given bit index.
    pub fn from_index(index: u16) -> Option<Self> {
        LeaseKind::ALL.get(index as usize).copied()
    }

    /// Single-bit mask of this kind.
    pub fn mask(self) -> LeaseMask {
        LeaseMask(1 << self as u16)
    }

    /// Expiring kinds lapse after their configured interval.
    pub fn is_expiring(self) -> bool {
        !LeaseMask::NON_EXPIRING.contains(self.mask())
    }

    /// Kinds that let the holder change resource contents.
    pub fn can_write(self) -> bool {
        matches!(
            self,
            LeaseKind::Write | LeaseKind::Append | LeaseKind::Truncate | LeaseKind::Stage
        )
    }

    /// Kinds that let the holder read cached contents.
    pub fn can_read(self) -> bool {
        matches!(
            self,
            LeaseKind::Read | LeaseKind::Write | LeaseKind::Append | LeaseKind::Mmap
        )
    }
}

impl fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeaseKind::Read => "read",
            LeaseKind::Write => "write",
            LeaseKind::Append => "append",
            LeaseKind::Truncate => "truncate",
            LeaseKind::RecordLock => "frlock",
            LeaseKind::Stage => "stage",
            LeaseKind::Open => "open",
            LeaseKind::Mmap => "mmap",
        };
        f.write_str(name)
    }
}

/// Set of lease kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseMask(u16);

impl LeaseMask {
    /// No leases.
    pub const EMPTY: LeaseMask = LeaseMask(0);
    /// Read lease.
    pub const READ: LeaseMask = LeaseMask(1 << 0);
    /// Write lease.
    pub const WRITE: LeaseMask = LeaseMask(1 << 1);
    /// Append lease.
    pub const APPEND: LeaseMask = LeaseMask(1 << 2);
    /// Truncate lease.
    pub const TRUNCATE: LeaseMask = LeaseMask(1 << 3);
    /// Record lock lease.
    pub const RECORD_LOCK: LeaseMask = LeaseMask(1 << 4);
    /// Stage lease.
    pub const STAGE: LeaseMask = LeaseMask(1 << 5);
    /// Open lease.
    pub const OPEN: LeaseMask = LeaseMask(1 << 6);
    /// Mmap lease.
    pub const MMAP: LeaseMask = LeaseMask(1 << 7);
    /// Leases held by at most one peer at a time.
    pub const EXCLUSIVE: LeaseMask = LeaseMask(Self::WRITE.0 | Self::APPEND.0);
    /// Leases that never lapse on their own.
    pub const NON_EXPIRING: LeaseMask =
        LeaseMask(Self::TRUNCATE.0 | Self::RECORD_LOCK.0 | Self::OPEN.0 | Self::MMAP.0);
    /// Every lease kind.
    pub const ALL: LeaseMask = LeaseMask(0xFF);

    /// Mask from raw bits; unknown bits are dropped.
    pub fn from_bits(bits: u16) -> Self {
        LeaseMask(bits & Self::ALL.0)
    }

    /// Raw bits.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// True if every kind in `other` is present.
    pub fn contains(self, other: LeaseMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any kind in `other` is present.
    pub fn intersects(self, other: LeaseMask) -> bool {
        self.0 & other.0 != 0
    }

    /// True if no kind is present.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// This mask minus `other`.
    pub fn without(self, other: LeaseMask) -> LeaseMask {
        LeaseMask(self.0 & !other.0)
    }

    /// Kinds present, in bit order.
    pub fn kinds(self) -> impl Iterator<Item = LeaseKind> {
        LeaseKind::ALL
            .into_iter()
            .filter(move |k| self.contains(k.mask()))
    }
}

impl From<LeaseKind> for LeaseMask {
    fn from(kind: LeaseKind) -> Self {
        kind.mask()
    }
}

impl BitOr for LeaseMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        LeaseMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for LeaseMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for LeaseMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        LeaseMask(self.0 & rhs.0)
    }
}

impl fmt::Display for LeaseMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<String> = self.kinds().map(|k| k.to_string()).collect();
        f.write_str(&names.join("|"))
    }
}

/// Instructions a client must carry out on its cached copy of a resource.
///
/// Bit values match the legacy protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectedActions(u16);

impl DirectedActions {
    /// Nothing to do.
    pub const NONE: DirectedActions = DirectedActions(0);
    /// Drop cached block-map entries beyond the stale offset.
    pub const STALE_INDIRECT: DirectedActions = DirectedActions(0x1);
    /// Bypass the cache for this resource.
    pub const DIRECTIO_ON: DirectedActions = DirectedActions(0x2);
    /// Flush dirty cached pages.
    pub const SYNC_PAGES: DirectedActions = DirectedActions(0x4);
    /// Drop cached pages.
    pub const INVAL_PAGES: DirectedActions = DirectedActions(0x8);
    /// Wait for a lease before proceeding.
    pub const WAIT_LEASE: DirectedActions = DirectedActions(0x10);
    /// Adopt the authoritative size.
    pub const SET_SIZE: DirectedActions = DirectedActions(0x40);
    /// Overwrite the local size unconditionally.
    pub const FORCE_SIZE: DirectedActions = DirectedActions(0x100);
    /// Switch to application based buffering.
    pub const ABR_ON: DirectedActions = DirectedActions(0x200);

    const NAMES: [(DirectedActions, &'static str); 8] = [
        (Self::STALE_INDIRECT, "stale_indirect"),
        (Self::DIRECTIO_ON, "directio_on"),
        (Self::SYNC_PAGES, "sync_pages"),
        (Self::INVAL_PAGES, "inval_pages"),
        (Self::WAIT_LEASE, "wait_lease"),
        (Self::SET_SIZE, "set_size"),
        (Self::FORCE_SIZE, "force_size"),
        (Self::ABR_ON, "abr_on"),
    ];

    /// Actions from raw bits.
    pub fn from_bits(bits: u16) -> Self {
        DirectedActions(bits)
    }

    /// Raw bits.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// True if every action in `other` is present.
    pub fn contains(self, other: DirectedActions) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no action is present.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DirectedActions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        DirectedActions(self.0 | rhs.0)
    }
}

impl BitOrAssign for DirectedActions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for DirectedActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

/// Snapshot of one peer, as reported to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer ordinal.
    pub ordinal: PeerOrdinal,
    /// Host name.
    pub name: String,
    /// A connection is installed.
    pub connected: bool,
    /// The peer reports the filesystem mounted.
    pub mounted: bool,
    /// Health flags, by name.
    pub flags: Vec<String>,
    /// Byte order the peer speaks.
    pub byte_order: ByteOrder,
    /// Milliseconds since the last message from the peer.
    pub idle_ms: Option<u64>,
}

/// Always-resident control resources re-read on promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlKind {
    /// The inode directory.
    InodeDirectory,
    /// The root directory.
    Root,
    /// Block allocation bitmap owner.
    BlockMap,
}

impl ControlKind {
    /// Every control resource, in the order they are re-read.
    pub const ALL: [ControlKind; 3] = [
        ControlKind::InodeDirectory,
        ControlKind::Root,
        ControlKind::BlockMap,
    ];

    /// Resource id of the control resource.
    pub fn resource(self) -> ResourceId {
        match self {
            ControlKind::InodeDirectory => ResourceId::new(1, 1),
            ControlKind::Root => ResourceId::new(2, 2),
            ControlKind::BlockMap => ResourceId::new(4, 4),
        }
    }

    /// Short name used in logs and file names.
    pub fn name(self) -> &'static str {
        match self {
            ControlKind::InodeDirectory => "inodes",
            ControlKind::Root => "root",
            ControlKind::BlockMap => "blockmap",
        }
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors from the coordination core.
#[derive(Debug, Error)]
pub enum MetaError {
    /// Malformed or unknown wire message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer has no usable connection.
    #[error("peer {0} not connected")]
    NotConnected(PeerOrdinal),

    /// Every send attempt to the peer hit congestion.
    #[error("peer {ordinal} blocked after {attempts} send attempts")]
    PeerBlocked {
        /// Peer ordinal.
        ordinal: PeerOrdinal,
        /// Attempts made.
        attempts: u32,
    },

    /// The lease cannot be granted yet; retry.
    #[error("lease on {0} is not available yet")]
    WouldBlock(ResourceId),

    /// A conflicting holder did not relinquish within the wait bound.
    #[error("conflicting holder of {0} did not relinquish in time")]
    PeerUnreachable(ResourceId),

    /// The message belongs to a superseded coordinator generation.
    #[error("stale generation {got}, current {current}")]
    StaleGeneration {
        /// Generation carried by the message.
        got: u32,
        /// Generation the receiver has seen.
        current: u32,
    },

    /// The failover target is not connected, mounted or byte-order compatible.
    #[error("failover candidate '{0}' is not ready")]
    CandidateNotReady(String),

    /// A live connection already exists for the ordinal.
    #[error("peer {0} is already connected")]
    AlreadyConnected(PeerOrdinal),

    /// The ordinal is administratively disabled.
    #[error("peer {0} is disabled")]
    HostDisabled(PeerOrdinal),

    /// A hand-off or resync is already running.
    #[error("coordinator hand-off already in progress")]
    AlreadyInProgress,

    /// The filesystem is not mounted locally.
    #[error("filesystem not mounted")]
    NotMounted,

    /// The operation must run on the coordinator.
    #[error("not the coordinator (coordinator is {coordinator})")]
    NotCoordinator {
        /// Current coordinator as known locally.
        coordinator: PeerOrdinal,
    },

    /// The operation requires the instance to be frozen.
    #[error("instance is not frozen")]
    NotFrozen,

    /// A control resource could not be read from the authoritative store.
    #[error("control block {kind} unreadable: {reason}")]
    ControlBlockUnreadable {
        /// Which control resource.
        kind: ControlKind,
        /// Underlying failure.
        reason: String,
    },

    /// The operation is served by a collaborator outside this core.
    #[error("unsupported operation {0}")]
    Unsupported(String),

    /// Ordinal out of range.
    #[error("invalid ordinal {0}")]
    InvalidOrdinal(u32),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The remote side answered with an error code this node does not map.
    #[error("remote error code {0}")]
    Remote(i32),

    /// Local I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MetaError {
    /// Conditions the file-operation layer retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetaError::WouldBlock(_)
                | MetaError::PeerUnreachable(_)
                | MetaError::PeerBlocked { .. }
                | MetaError::StaleGeneration { .. }
        )
    }

    /// Error code carried in reply headers.
    pub fn wire_code(&self) -> i32 {
        match self {
            MetaError::Protocol(_) => 71,
            MetaError::NotConnected(_) => 107,
            MetaError::PeerBlocked { .. } => 105,
            MetaError::WouldBlock(_) => 11,
            MetaError::PeerUnreachable(_) => 113,
            MetaError::StaleGeneration { .. } => 53,
            MetaError::CandidateNotReady(_) => 6,
            MetaError::AlreadyConnected(_) => 114,
            MetaError::HostDisabled(_) => 112,
            MetaError::AlreadyInProgress => 16,
            MetaError::NotMounted => 18,
            MetaError::NotCoordinator { .. } => 66,
            MetaError::NotFrozen => 22,
            MetaError::ControlBlockUnreadable { .. } => 5,
            MetaError::Unsupported(_) => 95,
            MetaError::InvalidOrdinal(_) => 34,
            MetaError::Config(_) => 22,
            MetaError::Remote(code) => *code,
            MetaError::Io(_) => 5,
        }
    }

    /// Rebuilds an error from a reply code.
    ///
    /// `ctx` supplies the details the code alone does not carry.
    pub fn from_wire(code: i32, ctx: &ReplyContext) -> Self {
        match code {
            11 => MetaError::WouldBlock(ctx.resource),
            113 => MetaError::PeerUnreachable(ctx.resource),
            105 => MetaError::PeerBlocked {
                ordinal: ctx.peer,
                attempts: 0,
            },
            53 => MetaError::StaleGeneration {
                got: ctx.sent_generation,
                current: ctx.reply_generation,
            },
            66 => MetaError::NotCoordinator {
                coordinator: ctx.peer,
            },
            114 => MetaError::AlreadyConnected(ctx.local),
            112 => MetaError::HostDisabled(ctx.local),
            16 => MetaError::AlreadyInProgress,
            18 => MetaError::NotMounted,
            95 => MetaError::Unsupported(format!("rejected by peer {}", ctx.peer)),
            other => MetaError::Remote(other),
        }
    }
}

/// Details used to rebuild an error from a reply code.
#[derive(Debug, Clone, Copy)]
pub struct ReplyContext {
    /// Local ordinal.
    pub local: PeerOrdinal,
    /// Peer that answered.
    pub peer: PeerOrdinal,
    /// Resource the request concerned.
    pub resource: ResourceId,
    /// Generation the request carried.
    pub sent_generation: u32,
    /// Generation the reply carried.
    pub reply_generation: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_mask_ops() {
        let mask = LeaseMask::READ | LeaseMask::WRITE;
        assert!(mask.contains(LeaseMask::READ));
        assert!(mask.intersects(LeaseMask::EXCLUSIVE));
        assert!(!mask.contains(LeaseMask::EXCLUSIVE));
        assert_eq!(mask.without(LeaseMask::READ), LeaseMask::WRITE);
        assert_eq!(
            mask.kinds().collect::<Vec<_>>(),
            vec![LeaseKind::Read, LeaseKind::Write]
        );
        assert_eq!(mask.to_string(), "read|write");
        assert_eq!(LeaseMask::from_bits(0xFF00), LeaseMask::EMPTY);
    }

    #[test]
    fn test_lease_kind_properties() {
        assert!(LeaseKind::Read.is_expiring());
        assert!(!LeaseKind::Truncate.is_expiring());
        assert!(!LeaseKind::Mmap.is_expiring());
        assert!(LeaseKind::Append.can_write());
        assert!(!LeaseKind::Read.can_write());
        assert!(LeaseKind::Mmap.can_read());
        assert_eq!(LeaseKind::from_index(5), Some(LeaseKind::Stage));
        assert_eq!(LeaseKind::from_index(8), None);
    }

    #[test]
    fn test_directed_actions_legacy_bits() {
        assert_eq!(DirectedActions::SYNC_PAGES.bits(), 0x4);
        assert_eq!(DirectedActions::FORCE_SIZE.bits(), 0x100);
        let actions = DirectedActions::SYNC_PAGES | DirectedActions::INVAL_PAGES;
        assert_eq!(actions.to_string(), "sync_pages|inval_pages");
        assert_eq!(DirectedActions::NONE.to_string(), "none");
    }

    #[test]
    fn test_epoch_monotonic() {
        let epoch = Epoch::new(3);
        assert_eq!(epoch.advance(), 4);
        assert!(!epoch.observe(2));
        assert_eq!(epoch.current(), 4);
        assert!(epoch.observe(9));
        assert_eq!(epoch.current(), 9);
    }

    #[test]
    fn test_phase_roundtrip() {
        for phase in [Phase::Active, Phase::Freezing, Phase::Frozen, Phase::Resyncing] {
            assert_eq!(Phase::from(phase as u8), phase);
        }
        assert!(Phase::Frozen.is_frozen_or_freezing());
        assert!(!Phase::Resyncing.is_frozen_or_freezing());
    }

    #[test]
    fn test_wire_code_roundtrip() {
        let ctx = ReplyContext {
            local: PeerOrdinal::new(3),
            peer: PeerOrdinal::new(1),
            resource: ResourceId::new(10, 1),
            sent_generation: 2,
            reply_generation: 3,
        };
        let err = MetaError::from_wire(MetaError::WouldBlock(ctx.resource).wire_code(), &ctx);
        assert!(matches!(err, MetaError::WouldBlock(r) if r == ctx.resource));
        let err = MetaError::from_wire(53, &ctx);
        assert!(matches!(
            err,
            MetaError::StaleGeneration { got: 2, current: 3 }
        ));
        assert!(err.is_retryable());
        assert!(matches!(MetaError::from_wire(999, &ctx), MetaError::Remote(999)));
    }

    #[test]
    fn test_error_display() {
        let err = MetaError::CandidateNotReady("c2".to_string());
        assert_eq!(err.to_string(), "failover candidate 'c2' is not ready");
        let err = MetaError::NotCoordinator {
            coordinator: PeerOrdinal::new(2),
        };
        assert_eq!(err.to_string(), "not the coordinator (coordinator is 2)");
    }
}
