//! Message encoding with byte-order normalisation.
//!
//! Senders always write their native byte order and record it in the header.
//! A receiver of the other endianness first rewrites the frame into its own
//! order, field by field, following a layout table selected by
//! `(command, operation)`. Layouts mark names, inline symlink targets and raw
//! data as opaque so those bytes are never swapped; there is no blanket swap
//! followed by per-call-site fix-ups.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::message::{
    BlockPayload, CalloutPayload, FixedName, InodePayload, LeasePayload, MountPayload,
    NotifyPayload, Payload, ResourceId, WireMessage, COMPONENT_LEN, INLINE_LEN, NAME_LEN,
};
use crate::protocol::{
    BlockOp, ByteOrder, Command, HeaderFlags, MessageHeader, Originator, PeerOrdinal, WaitFlag,
    BYTE_ORDER_OFFSET, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE,
};

/// One field of a layout table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Single byte, never swapped.
    U8,
    /// Two-byte integer.
    U16,
    /// Four-byte integer.
    U32,
    /// Eight-byte integer.
    U64,
    /// Fixed-size byte region that must not be swapped.
    Opaque(usize),
    /// Everything to the end of the payload is raw data.
    OpaqueTail,
}

impl FieldKind {
    fn width(self) -> usize {
        match self {
            FieldKind::U8 => 1,
            FieldKind::U16 => 2,
            FieldKind::U32 => 4,
            FieldKind::U64 => 8,
            FieldKind::Opaque(n) => n,
            FieldKind::OpaqueTail => 0,
        }
    }
}

use FieldKind::{Opaque, OpaqueTail, U16, U32, U64, U8};

/// Header layout, in wire order.
pub const HEADER_LAYOUT: &[FieldKind] = &[
    U32, // magic
    U8,  // byte order
    U8,  // originator
    U8,  // wait flag
    U8,  // flags
    U16, // command
    U16, // operation
    U16, // payload length
    U16, // response length
    U32, // seqno
    U32, // ack
    U32, // error
    U32, // origin ordinal
    U32, // destination ordinal
    U32, // filesystem identity
    U32, // filesystem generation
    U32, // coordinator generation
];

const MOUNT_LAYOUT: &[FieldKind] = &[
    Opaque(NAME_LEN),
    Opaque(NAME_LEN),
    U32,
    U32,
    U32,
    U32,
    U32,
];

const LEASE_LAYOUT: &[FieldKind] = &[
    U32, U32, U16, U16, U16, U16, U64, U64, U64, U64, U32, U32,
];

const INODE_LAYOUT: &[FieldKind] = &[
    U32,
    U32,
    U32,
    U32,
    U64,
    U64,
    U32,
    U32,
    U32,
    U32,
    U16,
    U16,
    Opaque(INLINE_LEN),
];

const BLOCK_LAYOUT: &[FieldKind] = &[U32, U32, U64, U32, U32, U64];

const BLOCK_DATA_LAYOUT: &[FieldKind] = &[U32, U32, U64, U32, U32, U64, OpaqueTail];

const CALLOUT_LAYOUT: &[FieldKind] = &[U32, U32, U16, U16, U16, U16, U64, U64, U32];

const NOTIFY_LAYOUT: &[FieldKind] = &[U32, U32, U16, U16, U32, Opaque(COMPONENT_LEN)];

/// Payload layout of a (command, operation) pair.
pub fn payload_layout(command: Command) -> &'static [FieldKind] {
    match command {
        Command::Mount(_) => MOUNT_LAYOUT,
        Command::Lease(_) => LEASE_LAYOUT,
        Command::Inode(_) => INODE_LAYOUT,
        Command::Block(BlockOp::GetBuf) | Command::Block(BlockOp::GetSblk) => BLOCK_DATA_LAYOUT,
        Command::Block(BlockOp::GetIno)
        | Command::Block(BlockOp::VfsStat)
        | Command::Block(BlockOp::Wakeup) => BLOCK_LAYOUT,
        Command::Callout(_) => CALLOUT_LAYOUT,
        Command::Notify(_) => NOTIFY_LAYOUT,
    }
}

/// Fixed byte size of a layout, excluding any data tail.
pub fn layout_size(layout: &[FieldKind]) -> usize {
    layout.iter().map(|k| k.width()).sum()
}

fn has_tail(layout: &[FieldKind]) -> bool {
    layout.last() == Some(&OpaqueTail)
}

struct Writer {
    buf: BytesMut,
    order: ByteOrder,
}

impl Writer {
    fn new(order: ByteOrder, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            order,
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    fn u16(&mut self, v: u16) {
        match self.order {
            ByteOrder::Little => self.buf.put_u16_le(v),
            ByteOrder::Big => self.buf.put_u16(v),
        }
    }

    fn u32(&mut self, v: u32) {
        match self.order {
            ByteOrder::Little => self.buf.put_u32_le(v),
            ByteOrder::Big => self.buf.put_u32(v),
        }
    }

    fn i32(&mut self, v: i32) {
        self.u32(v as u32);
    }

    fn u64(&mut self, v: u64) {
        match self.order {
            ByteOrder::Little => self.buf.put_u64_le(v),
            ByteOrder::Big => self.buf.put_u64(v),
        }
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    fn resource(&mut self, id: ResourceId) {
        self.u32(id.ino);
        self.u32(id.gen);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    order: ByteOrder,
    start_len: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self {
            buf,
            order,
            start_len: buf.len(),
        }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Truncated {
                expected: self.consumed() + n,
                available: self.start_len,
            });
        }
        Ok(())
    }

    fn consumed(&self) -> usize {
        self.start_len - self.buf.len()
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_u16_le(),
            ByteOrder::Big => self.buf.get_u16(),
        })
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_u32_le(),
            ByteOrder::Big => self.buf.get_u32(),
        })
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_u64_le(),
            ByteOrder::Big => self.buf.get_u64(),
        })
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.buf.to_vec();
        self.buf = &[];
        out
    }

    fn resource(&mut self) -> Result<ResourceId, ProtocolError> {
        Ok(ResourceId {
            ino: self.u32()?,
            gen: self.u32()?,
        })
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if !self.buf.is_empty() {
            return Err(ProtocolError::Truncated {
                expected: self.consumed(),
                available: self.start_len,
            });
        }
        Ok(())
    }
}

/// Encodes `msg` in the local machine's byte order.
pub fn encode(msg: &WireMessage) -> Result<Bytes, ProtocolError> {
    encode_with_order(msg, ByteOrder::native())
}

/// Encodes `msg` in an explicit byte order.
pub fn encode_with_order(msg: &WireMessage, order: ByteOrder) -> Result<Bytes, ProtocolError> {
    let command = msg.header.command;
    if !msg.payload.matches(command) {
        return Err(ProtocolError::LayoutMismatch {
            what: "payload class",
        });
    }
    let layout = payload_layout(command);

    let mut body = Writer::new(order, layout_size(layout));
    put_payload(&mut body, &msg.payload, layout)?;
    let payload = body.buf.freeze();
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max_size: MAX_PAYLOAD_SIZE,
        });
    }

    let h = &msg.header;
    let mut w = Writer::new(order, HEADER_SIZE + payload.len());
    w.u32(MAGIC);
    w.u8(order.tag());
    w.u8(h.originator as u8);
    w.u8(h.wait_flag as u8);
    w.u8(h.flags.as_u8());
    w.u16(command.class() as u16);
    w.u16(command.operation());
    w.u16(payload.len() as u16);
    w.u16(h.out_length);
    w.u32(h.seqno);
    w.u32(h.ack);
    w.i32(h.error);
    w.u32(h.origin.as_u32());
    w.u32(h.destination.as_u32());
    w.u32(h.fs_id);
    w.u32(h.fs_generation);
    w.u32(h.coord_generation);
    w.bytes(&payload);
    Ok(w.buf.freeze())
}

fn put_payload(
    w: &mut Writer,
    payload: &Payload,
    layout: &[FieldKind],
) -> Result<(), ProtocolError> {
    match payload {
        Payload::Mount(p) => {
            w.bytes(p.host_name.as_bytes());
            w.bytes(p.fs_name.as_bytes());
            w.u32(p.status);
            w.u32(p.config);
            w.u32(p.coordinator);
            w.u32(p.max_ordinal);
            w.u32(p.generation);
        }
        Payload::Lease(p) => {
            w.resource(p.resource);
            w.u16(p.kind);
            w.u16(p.mask);
            w.u16(p.actions);
            w.u16(p.flags);
            w.u64(p.offset);
            w.u64(p.length);
            w.u64(p.size);
            w.u64(p.stale_offset);
            w.u32(p.expires_ms);
            w.u32(p.generation);
        }
        Payload::Inode(p) => {
            w.resource(p.resource);
            w.u32(p.mode);
            w.u32(p.flags);
            w.u64(p.size);
            w.u64(p.write_seq);
            for extent in p.extents {
                w.u32(extent);
            }
            w.u16(p.inline_len);
            w.u16(p.stage_copy);
            w.bytes(&p.inline_area);
        }
        Payload::Block(p) => {
            w.resource(p.resource);
            w.u64(p.blkno);
            w.u32(p.bsize);
            w.u32(p.count);
            w.u64(p.addr);
            if has_tail(layout) {
                w.bytes(&p.data);
            } else if !p.data.is_empty() {
                return Err(ProtocolError::LayoutMismatch {
                    what: "block data on an operation without a data tail",
                });
            }
        }
        Payload::Callout(p) => {
            w.resource(p.resource);
            w.u16(p.actions);
            w.u16(p.mask);
            w.u16(p.stage_copy);
            w.u16(p.stage_flags);
            w.u64(p.size);
            w.u64(p.stale_offset);
            w.i32(p.error);
        }
        Payload::Notify(p) => {
            w.resource(p.resource);
            w.u16(p.mask);
            w.u16(p.component_len);
            w.u32(p.host);
            w.bytes(&p.component);
        }
    }
    Ok(())
}

fn get_payload(r: &mut Reader<'_>, command: Command) -> Result<Payload, ProtocolError> {
    let payload = match command {
        Command::Mount(_) => Payload::Mount(MountPayload {
            host_name: FixedName::from_bytes(r.array::<NAME_LEN>()?),
            fs_name: FixedName::from_bytes(r.array::<NAME_LEN>()?),
            status: r.u32()?,
            config: r.u32()?,
            coordinator: r.u32()?,
            max_ordinal: r.u32()?,
            generation: r.u32()?,
        }),
        Command::Lease(_) => Payload::Lease(LeasePayload {
            resource: r.resource()?,
            kind: r.u16()?,
            mask: r.u16()?,
            actions: r.u16()?,
            flags: r.u16()?,
            offset: r.u64()?,
            length: r.u64()?,
            size: r.u64()?,
            stale_offset: r.u64()?,
            expires_ms: r.u32()?,
            generation: r.u32()?,
        }),
        Command::Inode(_) => Payload::Inode(InodePayload {
            resource: r.resource()?,
            mode: r.u32()?,
            flags: r.u32()?,
            size: r.u64()?,
            write_seq: r.u64()?,
            extents: [r.u32()?, r.u32()?, r.u32()?, r.u32()?],
            inline_len: r.u16()?,
            stage_copy: r.u16()?,
            inline_area: r.array::<INLINE_LEN>()?,
        }),
        Command::Block(_) => {
            let mut block = BlockPayload {
                resource: r.resource()?,
                blkno: r.u64()?,
                bsize: r.u32()?,
                count: r.u32()?,
                addr: r.u64()?,
                data: Vec::new(),
            };
            if has_tail(payload_layout(command)) {
                block.data = r.rest();
            }
            Payload::Block(block)
        }
        Command::Callout(_) => Payload::Callout(CalloutPayload {
            resource: r.resource()?,
            actions: r.u16()?,
            mask: r.u16()?,
            stage_copy: r.u16()?,
            stage_flags: r.u16()?,
            size: r.u64()?,
            stale_offset: r.u64()?,
            error: r.i32()?,
        }),
        Command::Notify(_) => Payload::Notify(NotifyPayload {
            resource: r.resource()?,
            mask: r.u16()?,
            component_len: r.u16()?,
            host: r.u32()?,
            component: r.array::<COMPONENT_LEN>()?,
        }),
    };
    r.finish()?;
    Ok(payload)
}

/// Byte order a frame was written in.
pub fn sender_order(buf: &[u8]) -> Result<ByteOrder, ProtocolError> {
    if buf.len() <= BYTE_ORDER_OFFSET {
        return Err(ProtocolError::Truncated {
            expected: HEADER_SIZE,
            available: buf.len(),
        });
    }
    ByteOrder::from_tag(buf[BYTE_ORDER_OFFSET])
}

/// Total frame length announced by a header, for stream readers.
pub fn frame_length(header: &[u8]) -> Result<usize, ProtocolError> {
    let total = announced_length(header)?;
    let order = sender_order(header)?;
    check_magic(Reader::new(&header[..HEADER_SIZE], order).u32()?)?;
    Ok(total)
}

/// Frame length from the byte-order tag and payload length alone, without
/// validating the rest of the header. Lets a stream reader skip a frame it
/// is about to reject.
pub fn announced_length(header: &[u8]) -> Result<usize, ProtocolError> {
    if header.len() < HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            expected: HEADER_SIZE,
            available: header.len(),
        });
    }
    let order = sender_order(header)?;
    let mut r = Reader::new(&header[12..14], order);
    Ok(HEADER_SIZE + r.u16()? as usize)
}

fn check_magic(got: u32) -> Result<(), ProtocolError> {
    if got != MAGIC {
        return Err(ProtocolError::InvalidMagic {
            expected: MAGIC,
            got,
        });
    }
    Ok(())
}

/// Decodes one complete frame, normalising a foreign byte order first.
pub fn decode(buf: &[u8]) -> Result<WireMessage, ProtocolError> {
    let order = sender_order(buf)?;
    if order == ByteOrder::native() {
        parse(buf, order)
    } else {
        let mut owned = buf.to_vec();
        swap_frame(&mut owned, order)?;
        parse(&owned, order.opposite())
    }
}

/// Rewrites an encoded frame into the opposite byte order.
///
/// Uses the same layout tables as [`decode`], so opaque regions are copied
/// untouched.
pub fn swap_bytes(buf: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let order = sender_order(buf)?;
    let mut owned = buf.to_vec();
    swap_frame(&mut owned, order)?;
    Ok(owned)
}

fn swap_frame(buf: &mut [u8], from: ByteOrder) -> Result<(), ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            expected: HEADER_SIZE,
            available: buf.len(),
        });
    }
    let mut r = Reader::new(&buf[..HEADER_SIZE], from);
    check_magic(r.u32()?)?;
    let mut r = Reader::new(&buf[8..14], from);
    let command = Command::from_raw(r.u16()?, r.u16()?)?;
    let length = r.u16()? as usize;
    check_length(buf.len(), length)?;

    let (header, payload) = buf.split_at_mut(HEADER_SIZE);
    swap_fields(header, HEADER_LAYOUT)?;
    header[BYTE_ORDER_OFFSET] = from.opposite().tag();
    swap_fields(payload, payload_layout(command))
}

fn check_length(frame_len: usize, payload_len: usize) -> Result<(), ProtocolError> {
    let available = frame_len - HEADER_SIZE;
    if available != payload_len {
        return Err(ProtocolError::Truncated {
            expected: payload_len,
            available,
        });
    }
    Ok(())
}

fn swap_fields(buf: &mut [u8], layout: &[FieldKind]) -> Result<(), ProtocolError> {
    let mut pos = 0usize;
    for kind in layout {
        let width = match kind {
            OpaqueTail => return Ok(()),
            other => other.width(),
        };
        if pos + width > buf.len() {
            return Err(ProtocolError::Truncated {
                expected: layout_size(layout),
                available: buf.len(),
            });
        }
        if matches!(kind, U16 | U32 | U64) {
            buf[pos..pos + width].reverse();
        }
        pos += width;
    }
    if pos != buf.len() {
        return Err(ProtocolError::Truncated {
            expected: pos,
            available: buf.len(),
        });
    }
    Ok(())
}

fn parse(buf: &[u8], order: ByteOrder) -> Result<WireMessage, ProtocolError> {
    let mut r = Reader::new(buf, order);
    r.need(HEADER_SIZE)?;
    check_magic(r.u32()?)?;
    let _order_tag = r.u8()?;
    let originator = Originator::try_from(r.u8()?)?;
    let wait_flag = WaitFlag::try_from(r.u8()?)?;
    let flags = HeaderFlags::from_u8(r.u8()?);
    let command = Command::from_raw(r.u16()?, r.u16()?)?;
    let length = r.u16()? as usize;
    check_length(buf.len(), length)?;
    let header = MessageHeader {
        originator,
        wait_flag,
        flags,
        command,
        out_length: r.u16()?,
        seqno: r.u32()?,
        ack: r.u32()?,
        error: r.i32()?,
        origin: PeerOrdinal::new(r.u32()?),
        destination: PeerOrdinal::new(r.u32()?),
        fs_id: r.u32()?,
        fs_generation: r.u32()?,
        coord_generation: r.u32()?,
    };
    let mut body = Reader::new(&buf[HEADER_SIZE..], order);
    let payload = get_payload(&mut body, command)?;
    Ok(WireMessage { header, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CalloutOp, InodeOp, LeaseOp, MountOp, NotifyOp};

    fn lease_msg() -> WireMessage {
        let mut msg = WireMessage::new(
            Command::Lease(LeaseOp::Get),
            Originator::Client,
            Payload::Lease(LeasePayload {
                resource: ResourceId::new(1234, 7),
                kind: 1,
                mask: 0x0002,
                offset: 0x0102_0304_0506_0708,
                length: 4096,
                ..Default::default()
            }),
        );
        msg.header.seqno = 0x0A0B_0C0D;
        msg.header.origin = PeerOrdinal::new(3);
        msg.header.coord_generation = 5;
        msg.header.error = -11;
        msg
    }

    #[test]
    fn test_header_layout_size() {
        assert_eq!(layout_size(HEADER_LAYOUT), HEADER_SIZE);
    }

    #[test]
    fn test_every_command_has_consistent_layout() {
        for command in Command::ALL {
            let msg = WireMessage::new(command, Originator::Server, Payload::empty_for(command));
            let bytes = encode(&msg).unwrap();
            assert_eq!(
                bytes.len() - HEADER_SIZE,
                layout_size(payload_layout(command)),
                "layout of {command}"
            );
        }
    }

    #[test]
    fn test_same_order_roundtrip() {
        let msg = lease_msg();
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_foreign_order_decodes() {
        let msg = lease_msg();
        let foreign = encode_with_order(&msg, ByteOrder::native().opposite()).unwrap();
        assert_eq!(sender_order(&foreign).unwrap(), ByteOrder::native().opposite());
        assert_eq!(decode(&foreign).unwrap(), msg);
    }

    #[test]
    fn test_swap_bytes_matches_foreign_encoding() {
        let msg = lease_msg();
        let native = encode(&msg).unwrap();
        let foreign = encode_with_order(&msg, ByteOrder::native().opposite()).unwrap();
        assert_eq!(swap_bytes(&native).unwrap(), foreign.to_vec());
        assert_eq!(swap_bytes(&foreign).unwrap(), native.to_vec());
    }

    #[test]
    fn test_symlink_target_not_swapped() {
        let mut inode = InodePayload {
            resource: ResourceId::new(9, 1),
            mode: 0o120777,
            extents: [1, 2, 3, 4],
            ..Default::default()
        };
        assert!(inode.set_symlink(b"abcd"));
        let msg = WireMessage::new(
            Command::Inode(InodeOp::GetIno),
            Originator::Server,
            Payload::Inode(inode),
        );
        let swapped = swap_bytes(&encode(&msg).unwrap()).unwrap();
        let area_start = HEADER_SIZE + layout_size(INODE_LAYOUT) - INLINE_LEN;
        assert_eq!(&swapped[area_start..area_start + 4], b"abcd");
        assert_eq!(decode(&swapped).unwrap(), msg);
    }

    #[test]
    fn test_block_tail_roundtrip() {
        let msg = WireMessage::new(
            Command::Block(BlockOp::GetBuf),
            Originator::Server,
            Payload::Block(BlockPayload {
                resource: ResourceId::new(4, 0),
                blkno: 77,
                bsize: 512,
                count: 1,
                addr: 0xdead_beef,
                data: vec![1, 2, 3, 4, 5],
            }),
        );
        let swapped = swap_bytes(&encode(&msg).unwrap()).unwrap();
        assert_eq!(&swapped[swapped.len() - 5..], &[1, 2, 3, 4, 5]);
        assert_eq!(decode(&swapped).unwrap(), msg);
    }

    #[test]
    fn test_block_data_rejected_without_tail() {
        let msg = WireMessage::new(
            Command::Block(BlockOp::Wakeup),
            Originator::Client,
            Payload::Block(BlockPayload {
                data: vec![1],
                ..Default::default()
            }),
        );
        assert!(matches!(
            encode(&msg),
            Err(ProtocolError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn test_payload_class_mismatch() {
        let msg = WireMessage::new(
            Command::Mount(MountOp::Init),
            Originator::Client,
            Payload::Callout(CalloutPayload::default()),
        );
        assert!(encode(&msg).is_err());
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = encode(&lease_msg()).unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            decode(cut),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(
            decode(&bytes[..20]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_command() {
        let mut bytes = encode(&lease_msg()).unwrap().to_vec();
        let order = ByteOrder::native();
        let raw: u16 = 3;
        let field = match order {
            ByteOrder::Little => raw.to_le_bytes(),
            ByteOrder::Big => raw.to_be_bytes(),
        };
        bytes[8..10].copy_from_slice(&field);
        assert_eq!(
            decode(&bytes),
            Err(ProtocolError::UnknownCommand {
                command: 3,
                operation: LeaseOp::Get as u16
            })
        );
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode(&lease_msg()).unwrap().to_vec();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_frame_length() {
        let bytes = encode(&lease_msg()).unwrap();
        assert_eq!(frame_length(&bytes[..HEADER_SIZE]).unwrap(), bytes.len());
        let foreign = encode_with_order(&lease_msg(), ByteOrder::native().opposite()).unwrap();
        assert_eq!(frame_length(&foreign[..HEADER_SIZE]).unwrap(), foreign.len());

        let mut bad = bytes.to_vec();
        bad[0] ^= 0xFF;
        assert!(matches!(
            frame_length(&bad[..HEADER_SIZE]),
            Err(ProtocolError::InvalidMagic { .. })
        ));
        assert_eq!(announced_length(&bad[..HEADER_SIZE]).unwrap(), bytes.len());
    }

    #[test]
    fn test_notify_component_kept() {
        let mut notify = NotifyPayload {
            resource: ResourceId::new(2, 0),
            ..Default::default()
        };
        notify.set_component(b"readme.txt");
        let msg = WireMessage::new(
            Command::Notify(NotifyOp::Dnlc),
            Originator::Server,
            Payload::Notify(notify),
        );
        let foreign = encode_with_order(&msg, ByteOrder::native().opposite()).unwrap();
        let decoded = decode(&foreign).unwrap();
        match decoded.payload {
            Payload::Notify(p) => assert_eq!(p.component(), b"readme.txt"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_callout_negative_error() {
        let msg = WireMessage::new(
            Command::Callout(CalloutOp::Stage),
            Originator::Server,
            Payload::Callout(CalloutPayload {
                error: -5,
                size: 1 << 40,
                ..Default::default()
            }),
        );
        let foreign = encode_with_order(&msg, ByteOrder::native().opposite()).unwrap();
        assert_eq!(decode(&foreign).unwrap(), msg);
    }
}
