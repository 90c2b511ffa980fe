//! SOME/IP header and id newtypes.

use crate::error::DecodeError;
use crate::types::{MessageType, ReturnCode, PROTOCOL_VERSION};

/// Size of the SOME/IP header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Service ID - identifies a SOME/IP service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ServiceId(pub u16);

/// Method ID - identifies a method or event within a service.
/// Bit 15 distinguishes events (1) from methods (0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MethodId(pub u16);

/// Client ID - identifies the client making a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientId(pub u16);

/// Session ID - unique identifier for a request/response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub u16);

impl MethodId {
    /// Check if this id addresses an event (bit 15 set).
    pub fn is_event(&self) -> bool {
        self.0 & 0x8000 != 0
    }

    /// Create an event id.
    pub fn event(id: u16) -> Self {
        Self(id | 0x8000)
    }

    /// Create a method id.
    pub fn method(id: u16) -> Self {
        Self(id & 0x7FFF)
    }
}

macro_rules! impl_hex_display {
    ($($t:ty),*) => {
        $(impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "0x{:04X}", self.0)
            }
        })*
    };
}

impl_hex_display!(ServiceId, MethodId, ClientId, SessionId);

/// SOME/IP message header (16 bytes, big-endian).
///
/// ```text
/// +-----------------+-----------------+
/// |   Service ID    |    Method ID    |   message id
/// +-----------------+-----------------+
/// |              Length               |   covers everything after this field
/// +-----------------+-----------------+
/// |    Client ID    |   Session ID    |   request id
/// +--------+--------+--------+--------+
/// | Proto  | Iface  | MsgType| RetCode|
/// +--------+--------+--------+--------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SomeIpHeader {
    /// Service ID.
    pub service_id: ServiceId,
    /// Method ID.
    pub method_id: MethodId,
    /// Length of payload + 8 bytes of trailing header fields.
    pub length: u32,
    /// Client ID.
    pub client_id: ClientId,
    /// Session ID.
    pub session_id: SessionId,
    /// Protocol version (always 0x01).
    pub protocol_version: u8,
    /// Interface version (= service major version).
    pub interface_version: u8,
    /// Message type.
    pub message_type: MessageType,
    /// Return code.
    pub return_code: ReturnCode,
}

impl SomeIpHeader {
    /// Create a header with the given ids and message type, empty payload.
    pub fn new(service_id: ServiceId, method_id: MethodId, message_type: MessageType) -> Self {
        Self {
            service_id,
            method_id,
            length: 8,
            client_id: ClientId::default(),
            session_id: SessionId::default(),
            protocol_version: PROTOCOL_VERSION,
            interface_version: 1,
            message_type,
            return_code: ReturnCode::OK,
        }
    }

    /// Get the payload length (length field minus 8).
    pub fn payload_length(&self) -> u32 {
        self.length.saturating_sub(8)
    }

    /// Set the payload length (updates length field to payload_len + 8).
    pub fn set_payload_length(&mut self, payload_len: u32) {
        self.length = payload_len + 8;
    }

    /// Parse a header from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }

        let protocol_version = data[12];
        if protocol_version != PROTOCOL_VERSION {
            return Err(DecodeError::WrongProtocolVersion(protocol_version));
        }

        Ok(Self {
            service_id: ServiceId(u16::from_be_bytes([data[0], data[1]])),
            method_id: MethodId(u16::from_be_bytes([data[2], data[3]])),
            length: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            client_id: ClientId(u16::from_be_bytes([data[8], data[9]])),
            session_id: SessionId(u16::from_be_bytes([data[10], data[11]])),
            protocol_version,
            interface_version: data[13],
            message_type: MessageType::from_u8(data[14])?,
            return_code: ReturnCode(data[15]),
        })
    }

    /// Serialize the header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.service_id.0.to_be_bytes());
        buf[2..4].copy_from_slice(&self.method_id.0.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..10].copy_from_slice(&self.client_id.0.to_be_bytes());
        buf[10..12].copy_from_slice(&self.session_id.0.to_be_bytes());
        buf[12] = self.protocol_version;
        buf[13] = self.interface_version;
        buf[14] = self.message_type as u8;
        buf[15] = self.return_code.0;
        buf
    }

    /// Get the message id (service_id << 16 | method_id).
    pub fn message_id(&self) -> u32 {
        ((self.service_id.0 as u32) << 16) | (self.method_id.0 as u32)
    }

    /// Get the request id (client_id << 16 | session_id).
    pub fn request_id(&self) -> u32 {
        ((self.client_id.0 as u32) << 16) | (self.session_id.0 as u32)
    }
}
