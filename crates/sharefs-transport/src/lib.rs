#![warn(missing_docs)]

//! ShareFS transport subsystem: peer wire codec with byte-order normalisation,
//! TCP and simulated peer links, bounded send retry

pub mod codec;
pub mod error;
pub mod link;
pub mod message;
pub mod protocol;
pub mod retry;
pub mod sim;
pub mod tcp;

pub use codec::{decode, encode, encode_with_order, swap_bytes, FieldKind};
pub use error::{ProtocolError, Result, TransportError};
pub use link::PeerLink;
pub use message::{
    BlockPayload, CalloutPayload, FixedName, InodePayload, LeasePayload, MountPayload,
    NotifyPayload, Payload, ResourceId, WireMessage,
};
pub use protocol::{
    BlockOp, ByteOrder, CalloutOp, Command, CommandClass, HeaderFlags, InodeOp, LeaseOp,
    MessageHeader, MountOp, NotifyOp, Originator, PeerOrdinal, WaitFlag, HEADER_SIZE,
};
pub use retry::{SendOutcome, SendRetry, SendRetryConfig, MAX_SEND_TRIES, MIN_SEND_TRIES};
pub use sim::{SimFault, SimLink};
pub use tcp::{TcpLink, TcpTransport, TcpTransportConfig};
