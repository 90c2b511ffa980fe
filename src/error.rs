//! Error types for the daemon and the wire codec.

use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;

use crate::header::ServiceId;
use crate::sd::types::InstanceId;
use crate::types::ReturnCode;

/// Failures while decoding SOME/IP or SOME/IP-SD bytes.
///
/// Malformed input never terminates the daemon: the offending message is
/// dropped and a counter is incremented. Each condition gets its own kind so
/// counters and logs can tell them apart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ended before the structure did.
    #[error("truncated input: need at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Header length field disagrees with the buffer.
    #[error("length field says {header_length} bytes, buffer holds {actual_length}")]
    LengthMismatch {
        header_length: u32,
        actual_length: usize,
    },

    /// Protocol version byte is not 0x01.
    #[error("wrong protocol version: expected 0x01, got 0x{0:02X}")]
    WrongProtocolVersion(u8),

    /// Message type byte outside the recognized set.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// A frame handed to the SD decoder does not carry the SD message id.
    #[error("message id 0x{0:08X} is not the SD message id")]
    NotSdMessage(u32),

    /// SD entry type byte outside the recognized set.
    #[error("unknown SD entry type: 0x{0:02X}")]
    UnknownEntryType(u8),

    /// An entry references an option index past the end of the options array.
    #[error("option index {index} out of range ({available} options present)")]
    OptionIndexOutOfRange { index: usize, available: usize },

    /// Transport protocol byte that is neither TCP (0x06) nor UDP (0x11).
    #[error("unknown transport protocol: 0x{0:02X}")]
    UnknownTransport(u8),

    /// An option whose length field does not fit its kind.
    #[error("malformed option: {0}")]
    MalformedOption(&'static str),
}

/// Errors that can occur during daemon operations.
#[derive(Error, Debug)]
pub enum SomeIpError {
    /// Malformed bytes on the wire.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Well-formed but logically impossible message.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// RPC attempted while no remote offer is live.
    #[error("service {service}/{instance} is not available")]
    NotAvailable {
        service: ServiceId,
        instance: InstanceId,
    },

    /// TCP connector to the remote endpoint is not up.
    #[error("no connection to {0}")]
    NotConnected(SocketAddrV4),

    /// Operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The remote application answered with an ERROR message.
    #[error("application error, return code {0}")]
    Application(ReturnCode),

    /// Second registration for an occupied (service, instance, transport) slot.
    #[error("instance already registered for service {service}/{instance}")]
    DuplicateInstance {
        service: ServiceId,
        instance: InstanceId,
    },

    /// IPC message referenced a handle the daemon never issued.
    #[error("unknown handle: {0}")]
    UnknownHandle(u32),

    /// The IPC connection went away mid-operation.
    #[error("IPC connection closed")]
    IpcClosed,

    /// Configuration file could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, SomeIpError>;

impl SomeIpError {
    /// Whether the error is transient and the operation may be retried.
    ///
    /// Transport errors split into transient (would-block, refused, reset)
    /// and fatal (bind failure, interface gone); only the former qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
            Self::Timeout | Self::NotConnected(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::Truncated {
            expected: 16,
            actual: 8,
        };
        assert_eq!(
            format!("{err}"),
            "truncated input: need at least 16 bytes, got 8"
        );

        let err = DecodeError::NotSdMessage(0x12345678);
        assert_eq!(
            format!("{err}"),
            "message id 0x12345678 is not the SD message id"
        );
    }

    #[test]
    fn test_transient_classification() {
        let refused: SomeIpError =
            io::Error::new(io::ErrorKind::ConnectionRefused, "test").into();
        assert!(refused.is_transient());

        let bind: SomeIpError = io::Error::new(io::ErrorKind::AddrInUse, "test").into();
        assert!(!bind.is_transient());

        assert!(SomeIpError::Timeout.is_transient());
        assert!(!SomeIpError::ProtocolViolation("x".into()).is_transient());
    }
}
