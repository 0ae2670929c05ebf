//! Typed message payloads.
//!
//! Every command class carries one payload shape. Fields that hold names or
//! raw data are kept as byte regions so the codec never byte-swaps them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{Command, MessageHeader, Originator, PeerOrdinal};

/// Identity of a coordinated resource (an inode number plus its generation).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Inode number.
    pub ino: u32,
    /// Inode generation.
    pub gen: u32,
}

impl ResourceId {
    /// Creates a resource id.
    pub const fn new(ino: u32, gen: u32) -> Self {
        Self { ino, gen }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.ino, self.gen)
    }
}

/// Fixed-width, NUL padded name field.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedName<const N: usize>([u8; N]);

impl<const N: usize> FixedName<N> {
    /// Stores `name`, truncated to `N` bytes.
    pub fn new(name: &str) -> Self {
        let mut buf = [0u8; N];
        let bytes = name.as_bytes();
        let len = bytes.len().min(N);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self(buf)
    }

    /// Wraps raw bytes read off the wire.
    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    /// The name up to the first NUL, lossily decoded.
    pub fn as_str(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(N);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl<const N: usize> Default for FixedName<N> {
    fn default() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> fmt::Debug for FixedName<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// Size of host and filesystem name fields.
pub const NAME_LEN: usize = 32;

/// Size of the inline area used for short symlink targets.
pub const INLINE_LEN: usize = 64;

/// Size of the name component carried by NOTIFY messages.
pub const COMPONENT_LEN: usize = 64;

/// Mount status bit: the sender has the filesystem mounted.
pub const STATUS_MOUNTED: u32 = 0x1;

/// MOUNT payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPayload {
    /// Sender host name.
    pub host_name: FixedName<NAME_LEN>,
    /// Filesystem name.
    pub fs_name: FixedName<NAME_LEN>,
    /// Status bits ([`STATUS_MOUNTED`]).
    pub status: u32,
    /// Configuration flags of the sender.
    pub config: u32,
    /// Coordinator ordinal being announced.
    pub coordinator: u32,
    /// Highest ordinal in the cluster.
    pub max_ordinal: u32,
    /// Coordinator generation the announcement belongs to.
    pub generation: u32,
}

/// LEASE payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeasePayload {
    /// Leased resource.
    pub resource: ResourceId,
    /// Requested lease kind (bit index).
    pub kind: u16,
    /// Lease bit mask: released, reported or granted leases.
    pub mask: u16,
    /// Directed actions for the requester.
    pub actions: u16,
    /// Request flags.
    pub flags: u16,
    /// Byte offset the request covers.
    pub offset: u64,
    /// Byte length the request covers.
    pub length: u64,
    /// Authoritative resource size.
    pub size: u64,
    /// Offset beyond which cached block maps are stale.
    pub stale_offset: u64,
    /// Milliseconds until the granted lease expires, 0 for never.
    pub expires_ms: u32,
    /// Lease epoch of the grant.
    pub generation: u32,
}

/// INODE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodePayload {
    /// Target resource.
    pub resource: ResourceId,
    /// File mode bits.
    pub mode: u32,
    /// Inode flags.
    pub flags: u32,
    /// File size.
    pub size: u64,
    /// Modification sequence.
    pub write_seq: u64,
    /// Extent words.
    pub extents: [u32; 4],
    /// Length of the inline symlink target, 0 if none.
    pub inline_len: u16,
    /// Archive copy used for staging.
    pub stage_copy: u16,
    /// Inline area holding a short symlink target; never byte-swapped.
    pub inline_area: [u8; INLINE_LEN],
}

impl InodePayload {
    /// Stores a short symlink target inline. Returns `false` if it does not fit.
    pub fn set_symlink(&mut self, target: &[u8]) -> bool {
        if target.len() > INLINE_LEN {
            return false;
        }
        self.inline_area = [0u8; INLINE_LEN];
        self.inline_area[..target.len()].copy_from_slice(target);
        self.inline_len = target.len() as u16;
        true
    }

    /// The inline symlink target.
    pub fn symlink(&self) -> &[u8] {
        let len = (self.inline_len as usize).min(INLINE_LEN);
        &self.inline_area[..len]
    }
}

impl Default for InodePayload {
    fn default() -> Self {
        Self {
            resource: ResourceId::default(),
            mode: 0,
            flags: 0,
            size: 0,
            write_seq: 0,
            extents: [0; 4],
            inline_len: 0,
            stage_copy: 0,
            inline_area: [0; INLINE_LEN],
        }
    }
}

/// BLOCK payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockPayload {
    /// Target resource.
    pub resource: ResourceId,
    /// Block number.
    pub blkno: u64,
    /// Block size.
    pub bsize: u32,
    /// Block count.
    pub count: u32,
    /// Disk address.
    pub addr: u64,
    /// Raw data; only carried by operations whose layout has a data tail.
    pub data: Vec<u8>,
}

/// CALLOUT payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalloutPayload {
    /// Target resource.
    pub resource: ResourceId,
    /// Directed action bits.
    pub actions: u16,
    /// Leases concerned (e.g. the ones to relinquish).
    pub mask: u16,
    /// Archive copy that was staged.
    pub stage_copy: u16,
    /// Staging flags.
    pub stage_flags: u16,
    /// Authoritative size.
    pub size: u64,
    /// Offset beyond which cached block maps are stale.
    pub stale_offset: u64,
    /// Error code from staging.
    pub error: i32,
}

/// NOTIFY payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Target resource.
    pub resource: ResourceId,
    /// Leases concerned.
    pub mask: u16,
    /// Length of the name component.
    pub component_len: u16,
    /// Host concerned by host events.
    pub host: u32,
    /// Name component for name-cache purges; never byte-swapped.
    pub component: [u8; COMPONENT_LEN],
}

impl NotifyPayload {
    /// Stores a name component, truncated to the field width.
    pub fn set_component(&mut self, name: &[u8]) {
        let len = name.len().min(COMPONENT_LEN);
        self.component = [0u8; COMPONENT_LEN];
        self.component[..len].copy_from_slice(&name[..len]);
        self.component_len = len as u16;
    }

    /// The stored name component.
    pub fn component(&self) -> &[u8] {
        let len = (self.component_len as usize).min(COMPONENT_LEN);
        &self.component[..len]
    }
}

impl Default for NotifyPayload {
    fn default() -> Self {
        Self {
            resource: ResourceId::default(),
            mask: 0,
            component_len: 0,
            host: 0,
            component: [0; COMPONENT_LEN],
        }
    }
}

/// Payload of any message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// MOUNT class.
    Mount(MountPayload),
    /// LEASE class.
    Lease(LeasePayload),
    /// INODE class.
    Inode(InodePayload),
    /// BLOCK class.
    Block(BlockPayload),
    /// CALLOUT class.
    Callout(CalloutPayload),
    /// NOTIFY class.
    Notify(NotifyPayload),
}

impl Payload {
    /// A zeroed payload of the shape `command` carries.
    pub fn empty_for(command: Command) -> Self {
        match command {
            Command::Mount(_) => Payload::Mount(MountPayload::default()),
            Command::Lease(_) => Payload::Lease(LeasePayload::default()),
            Command::Inode(_) => Payload::Inode(InodePayload::default()),
            Command::Block(_) => Payload::Block(BlockPayload::default()),
            Command::Callout(_) => Payload::Callout(CalloutPayload::default()),
            Command::Notify(_) => Payload::Notify(NotifyPayload::default()),
        }
    }

    /// True if this payload shape belongs to `command`'s class.
    pub fn matches(&self, command: Command) -> bool {
        matches!(
            (self, command),
            (Payload::Mount(_), Command::Mount(_))
                | (Payload::Lease(_), Command::Lease(_))
                | (Payload::Inode(_), Command::Inode(_))
                | (Payload::Block(_), Command::Block(_))
                | (Payload::Callout(_), Command::Callout(_))
                | (Payload::Notify(_), Command::Notify(_))
        )
    }

    /// Resource the payload refers to, if any.
    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            Payload::Mount(_) => None,
            Payload::Lease(p) => Some(p.resource),
            Payload::Inode(p) => Some(p.resource),
            Payload::Block(p) => Some(p.resource),
            Payload::Callout(p) => Some(p.resource),
            Payload::Notify(p) => Some(p.resource),
        }
    }
}

/// A complete message: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Header.
    pub header: MessageHeader,
    /// Payload.
    pub payload: Payload,
}

impl WireMessage {
    /// Builds a request with the given payload.
    pub fn new(command: Command, originator: Originator, payload: Payload) -> Self {
        Self {
            header: MessageHeader::new(command, originator),
            payload,
        }
    }

    /// Builds the reply to `request`, reusing its sequence number.
    pub fn reply_to(request: &MessageHeader, local: PeerOrdinal, payload: Payload) -> Self {
        let originator = match request.originator {
            Originator::Server => Originator::Client,
            Originator::Client => Originator::Server,
        };
        let mut header = MessageHeader::new(request.command, originator);
        header.flags.reply = true;
        header.seqno = request.seqno;
        header.origin = local;
        header.destination = request.origin;
        header.wait_flag = request.wait_flag;
        Self { header, payload }
    }

    /// Command of this message.
    pub fn command(&self) -> Command {
        self.header.command
    }
}
