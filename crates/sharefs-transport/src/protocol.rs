//! Wire protocol definitions shared by every peer of a shared filesystem.
//!
//! Every message is a fixed 48-byte header followed by a command-specific
//! payload. The header records the sender's byte order so a receiver on a
//! machine of the other endianness can normalise it (see [`crate::codec`]).
//! Command and operation numbers keep the legacy numbering so mixed-version
//! clusters agree on what each message means.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 48;

/// Magic number opening every message.
pub const MAGIC: u32 = 0x5346_5348;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Byte offset of the byte-order tag inside the header.
pub const BYTE_ORDER_OFFSET: usize = 4;

/// Small integer identifying a peer within one filesystem instance.
///
/// Ordinals are assigned administratively and stay stable across reconnects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerOrdinal(u32);

impl PeerOrdinal {
    /// Ordinal 0: "the coordinator", used as destination when broadcasting.
    pub const COORDINATOR: PeerOrdinal = PeerOrdinal(0);

    /// Creates an ordinal from its raw value.
    pub const fn new(ordinal: u32) -> Self {
        PeerOrdinal(ordinal)
    }

    /// Returns the raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// True for the reserved coordinator/broadcast ordinal.
    pub fn is_coordinator_alias(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PeerOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte order a message was encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little = 1,
    /// Most significant byte first.
    Big = 2,
}

impl ByteOrder {
    /// Byte order of the running machine.
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    /// The other byte order.
    pub fn opposite(self) -> Self {
        match self {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }
    }

    /// Header tag value.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Parses a header tag.
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            1 => Ok(ByteOrder::Little),
            2 => Ok(ByteOrder::Big),
            other => Err(ProtocolError::InvalidByteOrder(other)),
        }
    }
}

/// Message classes, numbered as in the legacy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandClass {
    /// Mount handshake and coordinator hand-off.
    Mount = 1,
    /// Lease requests.
    Lease = 2,
    /// Metadata operations.
    Inode = 4,
    /// Extent and superblock operations.
    Block = 5,
    /// Coordinator to client directed actions.
    Callout = 7,
    /// Lease expiry and host events.
    Notify = 8,
}

/// MOUNT operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MountOp {
    /// Connection handshake.
    Init = 1,
    /// Mounted/unmounted status report.
    Status = 2,
    /// Failed handshake notice.
    FailInit = 3,
    /// Lease re-synchronisation after a hand-off.
    Resync = 4,
    /// A coordinator hand-off is pending.
    Failover = 5,
    /// Hand-off finished.
    FailDone = 6,
    /// Announces the current coordinator.
    Config = 7,
}

/// LEASE operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum LeaseOp {
    /// Acquire a lease.
    Get = 1,
    /// Release a lease.
    Remove = 2,
    /// Re-report a held lease to a new coordinator.
    Reset = 3,
    /// Give up a lease in answer to a relinquish callout.
    Relinquish = 4,
}

/// INODE operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum InodeOp {
    /// Fetch inode attributes.
    GetIno = 1,
    /// Update inode attributes.
    SetAttr = 5,
    /// Staging completed, sizes changed.
    Stage = 6,
    /// Staging was cancelled.
    CancelStage = 7,
    /// Enable application based buffering.
    SetAbr = 8,
}

/// BLOCK operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BlockOp {
    /// Read a metadata buffer.
    GetBuf = 1,
    /// Read an on-disk inode image.
    GetIno = 3,
    /// Read the superblock.
    GetSblk = 4,
    /// Filesystem statistics.
    VfsStat = 5,
    /// Wake lease waiters on a resource.
    Wakeup = 6,
}

/// CALLOUT operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CalloutOp {
    /// Execute directed actions.
    Action = 1,
    /// Staging changed the authoritative size.
    Stage = 2,
    /// Change caching flags.
    Flags = 4,
    /// Give up the named leases.
    RelinquishLease = 5,
}

/// NOTIFY operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NotifyOp {
    /// Lease state changed.
    Lease = 1,
    /// Leases expired on the coordinator.
    LeaseExpire = 2,
    /// Drop a cached name.
    Dnlc = 3,
    /// The host is being administratively disabled.
    HostOff = 4,
}

/// A fully resolved (class, operation) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// MOUNT class.
    Mount(MountOp),
    /// LEASE class.
    Lease(LeaseOp),
    /// INODE class.
    Inode(InodeOp),
    /// BLOCK class.
    Block(BlockOp),
    /// CALLOUT class.
    Callout(CalloutOp),
    /// NOTIFY class.
    Notify(NotifyOp),
}

impl Command {
    /// Every known (class, operation) pair.
    pub const ALL: [Command; 29] = [
        Command::Mount(MountOp::Init),
        Command::Mount(MountOp::Status),
        Command::Mount(MountOp::FailInit),
        Command::Mount(MountOp::Resync),
        Command::Mount(MountOp::Failover),
        Command::Mount(MountOp::FailDone),
        Command::Mount(MountOp::Config),
        Command::Lease(LeaseOp::Get),
        Command::Lease(LeaseOp::Remove),
        Command::Lease(LeaseOp::Reset),
        Command::Lease(LeaseOp::Relinquish),
        Command::Inode(InodeOp::GetIno),
        Command::Inode(InodeOp::SetAttr),
        Command::Inode(InodeOp::Stage),
        Command::Inode(InodeOp::CancelStage),
        Command::Inode(InodeOp::SetAbr),
        Command::Block(BlockOp::GetBuf),
        Command::Block(BlockOp::GetIno),
        Command::Block(BlockOp::GetSblk),
        Command::Block(BlockOp::VfsStat),
        Command::Block(BlockOp::Wakeup),
        Command::Callout(CalloutOp::Action),
        Command::Callout(CalloutOp::Stage),
        Command::Callout(CalloutOp::Flags),
        Command::Callout(CalloutOp::RelinquishLease),
        Command::Notify(NotifyOp::Lease),
        Command::Notify(NotifyOp::LeaseExpire),
        Command::Notify(NotifyOp::Dnlc),
        Command::Notify(NotifyOp::HostOff),
    ];

    /// The command class.
    pub fn class(&self) -> CommandClass {
        match self {
            Command::Mount(_) => CommandClass::Mount,
            Command::Lease(_) => CommandClass::Lease,
            Command::Inode(_) => CommandClass::Inode,
            Command::Block(_) => CommandClass::Block,
            Command::Callout(_) => CommandClass::Callout,
            Command::Notify(_) => CommandClass::Notify,
        }
    }

    /// Raw operation code within the class.
    pub fn operation(&self) -> u16 {
        match *self {
            Command::Mount(op) => op as u16,
            Command::Lease(op) => op as u16,
            Command::Inode(op) => op as u16,
            Command::Block(op) => op as u16,
            Command::Callout(op) => op as u16,
            Command::Notify(op) => op as u16,
        }
    }

    /// Resolves raw header values, rejecting pairs outside the table.
    pub fn from_raw(command: u16, operation: u16) -> Result<Self, ProtocolError> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.class() as u16 == command && c.operation() == operation)
            .ok_or(ProtocolError::UnknownCommand { command, operation })
    }

    /// True for messages that create, drop or redirect leases.
    pub fn is_lease_affecting(&self) -> bool {
        matches!(
            self,
            Command::Lease(_)
                | Command::Callout(_)
                | Command::Notify(NotifyOp::Lease)
                | Command::Notify(NotifyOp::LeaseExpire)
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Mount(op) => write!(f, "MOUNT/{:?}", op),
            Command::Lease(op) => write!(f, "LEASE/{:?}", op),
            Command::Inode(op) => write!(f, "INODE/{:?}", op),
            Command::Block(op) => write!(f, "BLOCK/{:?}", op),
            Command::Callout(op) => write!(f, "CALLOUT/{:?}", op),
            Command::Notify(op) => write!(f, "NOTIFY/{:?}", op),
        }
    }
}

/// Which side of the coordinator relationship sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Originator {
    /// Sent by the coordinator.
    Server = 1,
    /// Sent by a client.
    Client = 2,
}

impl TryFrom<u8> for Originator {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Originator::Server),
            2 => Ok(Originator::Client),
            _ => Err(ProtocolError::LayoutMismatch {
                what: "originator",
            }),
        }
    }
}

/// How the sender waits for the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitFlag {
    /// Block until the reply arrives.
    Wait = 1,
    /// Ask for an immediate answer; the receiver must not block.
    NoWait = 2,
    /// No reply expected.
    OneWay = 3,
}

impl TryFrom<u8> for WaitFlag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WaitFlag::Wait),
            2 => Ok(WaitFlag::NoWait),
            3 => Ok(WaitFlag::OneWay),
            _ => Err(ProtocolError::LayoutMismatch { what: "wait flag" }),
        }
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFlags {
    /// The sender restarted its sequence numbering.
    pub reset_seqno: bool,
    /// This message answers the request with the same sequence.
    pub reply: bool,
}

impl HeaderFlags {
    /// Raw flag byte.
    pub fn as_u8(&self) -> u8 {
        let mut b = 0u8;
        if self.reset_seqno {
            b |= 0x01;
        }
        if self.reply {
            b |= 0x02;
        }
        b
    }

    /// Parses the raw flag byte.
    pub fn from_u8(b: u8) -> Self {
        Self {
            reset_seqno: (b & 0x01) != 0,
            reply: (b & 0x02) != 0,
        }
    }
}

/// Decoded message header.
///
/// The byte-order tag and payload length are produced by the codec and are
/// not part of the logical header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Role of the sender.
    pub originator: Originator,
    /// Reply expectations.
    pub wait_flag: WaitFlag,
    /// Flag bits.
    pub flags: HeaderFlags,
    /// Command class and operation.
    pub command: Command,
    /// Length of the expected response payload.
    pub out_length: u16,
    /// Per-destination sequence number.
    pub seqno: u32,
    /// Highest sequence received from the destination.
    pub ack: u32,
    /// Error code carried by replies, 0 on success.
    pub error: i32,
    /// Sender ordinal.
    pub origin: PeerOrdinal,
    /// Destination ordinal.
    pub destination: PeerOrdinal,
    /// Filesystem identity.
    pub fs_id: u32,
    /// Filesystem generation (changes when the filesystem is recreated).
    pub fs_generation: u32,
    /// Coordinator generation the sender believes is current.
    pub coord_generation: u32,
}

impl MessageHeader {
    /// A request header with every counter zeroed; senders stamp the rest.
    pub fn new(command: Command, originator: Originator) -> Self {
        Self {
            originator,
            wait_flag: WaitFlag::Wait,
            flags: HeaderFlags::default(),
            command,
            out_length: 0,
            seqno: 0,
            ack: 0,
            error: 0,
            origin: PeerOrdinal::COORDINATOR,
            destination: PeerOrdinal::COORDINATOR,
            fs_id: 0,
            fs_generation: 0,
            coord_generation: 0,
        }
    }

    /// True if this header answers an earlier request.
    pub fn is_reply(&self) -> bool {
        self.flags.reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_table_roundtrip() {
        for cmd in Command::ALL {
            let resolved = Command::from_raw(cmd.class() as u16, cmd.operation()).unwrap();
            assert_eq!(resolved, cmd);
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert_eq!(
            Command::from_raw(3, 1),
            Err(ProtocolError::UnknownCommand {
                command: 3,
                operation: 1
            })
        );
        assert!(Command::from_raw(CommandClass::Lease as u16, 9).is_err());
    }

    #[test]
    fn test_byte_order_tags() {
        assert_eq!(ByteOrder::from_tag(ByteOrder::Big.tag()).unwrap(), ByteOrder::Big);
        assert_eq!(ByteOrder::Little.opposite(), ByteOrder::Big);
        assert!(ByteOrder::from_tag(0).is_err());
    }

    #[test]
    fn test_header_flags() {
        let flags = HeaderFlags {
            reset_seqno: true,
            reply: true,
        };
        assert_eq!(flags.as_u8(), 0x03);
        assert_eq!(HeaderFlags::from_u8(0x02), HeaderFlags {
            reset_seqno: false,
            reply: true
        });
    }

    #[test]
    fn test_lease_affecting() {
        assert!(Command::Lease(LeaseOp::Get).is_lease_affecting());
        assert!(Command::Callout(CalloutOp::Action).is_lease_affecting());
        assert!(!Command::Mount(MountOp::Config).is_lease_affecting());
        assert!(!Command::Notify(NotifyOp::HostOff).is_lease_affecting());
    }

    #[test]
    fn test_ordinal_display() {
        assert_eq!(PeerOrdinal::new(5).to_string(), "5");
        assert!(PeerOrdinal::COORDINATOR.is_coordinator_alias());
    }
}
