//! Error types for the peer transport.

use std::io;

use thiserror::Error;

/// A malformed or unrecognised wire message.
///
/// Protocol errors never imply the connection is broken; the receiver logs
/// and drops the offending message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The (command, operation) pair is not in the layout table.
    #[error("unknown command {command} operation {operation}")]
    UnknownCommand {
        /// Raw command class.
        command: u16,
        /// Raw operation code.
        operation: u16,
    },

    /// Fewer (or more) bytes were available than the header announced.
    #[error("truncated message: expected {expected} bytes, {available} available")]
    Truncated {
        /// Bytes the header or layout requires.
        expected: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// The header magic did not match in either byte order.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected magic.
        expected: u32,
        /// Magic found on the wire.
        got: u32,
    },

    /// The byte-order tag is neither little nor big endian.
    #[error("invalid byte order tag {0}")]
    InvalidByteOrder(u8),

    /// The payload does not fit the 16-bit length field.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Largest encodable payload.
        max_size: usize,
    },

    /// A payload does not match the shape its layout declares.
    #[error("payload layout mismatch for {what}")]
    LayoutMismatch {
        /// Which payload was inconsistent.
        what: &'static str,
    },
}

/// Transport-level failure talking to one peer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer refused the connection.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Remote address.
        addr: String,
    },

    /// Connecting took longer than the configured timeout.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Remote address.
        addr: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The connection was reset or closed by the peer.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// No connection is installed for the peer.
    #[error("not connected")]
    NotConnected,

    /// The socket could not accept data within the congestion window.
    #[error("send congested")]
    Congested,

    /// Malformed message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Any other I/O failure.
    #[error(transparent)]
    IoError(#[from] io::Error),
}

impl TransportError {
    /// Classifies a socket error into the transient/fatal split used by senders.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => TransportError::ConnectionReset,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Congested,
            _ => TransportError::IoError(err),
        }
    }

    /// True for errors after which the connection must be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionReset
                | TransportError::NotConnected
                | TransportError::ConnectionRefused { .. }
                | TransportError::IoError(_)
        )
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_classification() {
        let reset = TransportError::from_io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(matches!(reset, TransportError::ConnectionReset));
        assert!(reset.is_fatal());

        let busy = TransportError::from_io(io::Error::new(io::ErrorKind::WouldBlock, "busy"));
        assert!(matches!(busy, TransportError::Congested));
        assert!(!busy.is_fatal());

        let other = TransportError::from_io(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(matches!(other, TransportError::IoError(_)));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownCommand {
            command: 9,
            operation: 1,
        };
        assert_eq!(err.to_string(), "unknown command 9 operation 1");

        let err = ProtocolError::Truncated {
            expected: 48,
            available: 12,
        };
        assert_eq!(
            err.to_string(),
            "truncated message: expected 48 bytes, 12 available"
        );
    }

    #[test]
    fn test_protocol_error_is_not_fatal() {
        let err: TransportError = ProtocolError::InvalidByteOrder(7).into();
        assert!(!err.is_fatal());
    }
}
