//! Core SOME/IP types and constants.

use crate::error::DecodeError;

/// SOME/IP protocol version (always 0x01).
pub const PROTOCOL_VERSION: u8 = 0x01;

/// SOME/IP message types recognized by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Request expecting a response.
    Request = 0x00,
    /// Request not expecting a response (fire-and-forget).
    RequestNoReturn = 0x01,
    /// Cyclic or event-based notification.
    Notification = 0x02,
    /// Response to a request.
    Response = 0x80,
    /// Error response to a request.
    Error = 0x81,
}

impl MessageType {
    /// Create a MessageType from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x00 => Ok(Self::Request),
            0x01 => Ok(Self::RequestNoReturn),
            0x02 => Ok(Self::Notification),
            0x80 => Ok(Self::Response),
            0x81 => Ok(Self::Error),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }

    /// Check if this message type expects a response.
    pub fn expects_response(&self) -> bool {
        matches!(self, Self::Request)
    }

    /// Check if this is a response message type (RESPONSE or ERROR).
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }
}

/// SOME/IP return code.
///
/// The wire codec is agnostic to the value, so this is an open newtype with
/// named constants for the codes the daemon itself produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReturnCode(pub u8);

impl ReturnCode {
    /// No error occurred.
    pub const OK: ReturnCode = ReturnCode(0x00);
    /// An unspecified error occurred.
    pub const NOT_OK: ReturnCode = ReturnCode(0x01);
    /// The requested service id is unknown.
    pub const UNKNOWN_SERVICE: ReturnCode = ReturnCode(0x02);
    /// The requested method id is unknown.
    pub const UNKNOWN_METHOD: ReturnCode = ReturnCode(0x03);
    /// Service is not ready.
    pub const NOT_READY: ReturnCode = ReturnCode(0x04);
    /// Service is not reachable.
    pub const NOT_REACHABLE: ReturnCode = ReturnCode(0x05);
    /// Timeout occurred.
    pub const TIMEOUT: ReturnCode = ReturnCode(0x06);
    /// Wrong protocol version.
    pub const WRONG_PROTOCOL_VERSION: ReturnCode = ReturnCode(0x07);
    /// Wrong interface version.
    pub const WRONG_INTERFACE_VERSION: ReturnCode = ReturnCode(0x08);
    /// Malformed message.
    pub const MALFORMED_MESSAGE: ReturnCode = ReturnCode(0x09);
    /// Wrong message type.
    pub const WRONG_MESSAGE_TYPE: ReturnCode = ReturnCode(0x0A);

    /// Check if this return code indicates success.
    pub fn is_ok(&self) -> bool {
        *self == Self::OK
    }

    /// Check if this return code indicates an error.
    pub fn is_error(&self) -> bool {
        *self != Self::OK
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Transport protocol used by service endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportProtocol {
    /// TCP protocol.
    Tcp = 0x06,
    /// UDP protocol.
    Udp = 0x11,
}

impl TransportProtocol {
    /// Create a TransportProtocol from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x06 => Ok(Self::Tcp),
            0x11 => Ok(Self::Udp),
            other => Err(DecodeError::UnknownTransport(other)),
        }
    }
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}
