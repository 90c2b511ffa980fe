//! SOME/IP message handling.

use bytes::Bytes;

use crate::error::DecodeError;
use crate::header::{ClientId, MethodId, ServiceId, SessionId, SomeIpHeader, HEADER_SIZE};
use crate::types::{MessageType, ReturnCode};

/// Maximum UDP datagram payload before the daemon logs a warning.
pub const UDP_DATAGRAM_WARN_SIZE: usize = 1400;

/// A complete SOME/IP message (header + opaque payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SomeIpMessage {
    /// Message header.
    pub header: SomeIpHeader,
    /// Message payload. The daemon never interprets these bytes.
    pub payload: Bytes,
}

impl SomeIpMessage {
    /// Create a message from header and payload, fixing up the length field.
    pub fn new(mut header: SomeIpHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        header.set_payload_length(payload.len() as u32);
        Self { header, payload }
    }

    /// Create a request message builder.
    pub fn request(service_id: ServiceId, method_id: MethodId) -> MessageBuilder {
        MessageBuilder::new(service_id, method_id, MessageType::Request)
    }

    /// Create a fire-and-forget request builder.
    pub fn request_no_return(service_id: ServiceId, method_id: MethodId) -> MessageBuilder {
        MessageBuilder::new(service_id, method_id, MessageType::RequestNoReturn)
    }

    /// Create a notification message builder.
    pub fn notification(service_id: ServiceId, method_id: MethodId) -> MessageBuilder {
        MessageBuilder::new(service_id, method_id, MessageType::Notification)
    }

    /// Create a RESPONSE builder mirroring this request's addressing.
    pub fn response_to(&self) -> MessageBuilder {
        MessageBuilder::new(
            self.header.service_id,
            self.header.method_id,
            MessageType::Response,
        )
        .client_id(self.header.client_id)
        .session_id(self.header.session_id)
        .interface_version(self.header.interface_version)
    }

    /// Create an ERROR builder mirroring this request's addressing.
    pub fn error_to(&self, return_code: ReturnCode) -> MessageBuilder {
        MessageBuilder::new(
            self.header.service_id,
            self.header.method_id,
            MessageType::Error,
        )
        .client_id(self.header.client_id)
        .session_id(self.header.session_id)
        .interface_version(self.header.interface_version)
        .return_code(return_code)
    }

    /// Parse a message from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let header = SomeIpHeader::from_bytes(data)?;
        let expected_total = HEADER_SIZE + header.payload_length() as usize;

        if data.len() < expected_total {
            return Err(DecodeError::LengthMismatch {
                header_length: header.length,
                actual_length: data.len().saturating_sub(8),
            });
        }

        let payload = Bytes::copy_from_slice(&data[HEADER_SIZE..expected_total]);
        Ok(Self { header, payload })
    }

    /// Serialize the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Get the total message size (header + payload).
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Builder for constructing SOME/IP messages.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    service_id: ServiceId,
    method_id: MethodId,
    client_id: ClientId,
    session_id: SessionId,
    interface_version: u8,
    message_type: MessageType,
    return_code: ReturnCode,
    payload: Bytes,
}

impl MessageBuilder {
    /// Create a new message builder.
    pub fn new(service_id: ServiceId, method_id: MethodId, message_type: MessageType) -> Self {
        Self {
            service_id,
            method_id,
            client_id: ClientId::default(),
            session_id: SessionId::default(),
            interface_version: 1,
            message_type,
            return_code: ReturnCode::OK,
            payload: Bytes::new(),
        }
    }

    /// Set the client id.
    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = client_id;
        self
    }

    /// Set the session id.
    pub fn session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    /// Set the interface version.
    pub fn interface_version(mut self, version: u8) -> Self {
        self.interface_version = version;
        self
    }

    /// Set the return code.
    pub fn return_code(mut self, code: ReturnCode) -> Self {
        self.return_code = code;
        self
    }

    /// Set the payload.
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Build the message.
    pub fn build(self) -> SomeIpMessage {
        let header = SomeIpHeader {
            service_id: self.service_id,
            method_id: self.method_id,
            length: 8 + self.payload.len() as u32,
            client_id: self.client_id,
            session_id: self.session_id,
            protocol_version: crate::types::PROTOCOL_VERSION,
            interface_version: self.interface_version,
            message_type: self.message_type,
            return_code: self.return_code,
        };

        SomeIpMessage {
            header,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder() {
        let msg = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x0001))
            .client_id(ClientId(0x0100))
            .session_id(SessionId(0x0001))
            .payload(b"hello".as_slice())
            .build();

        assert_eq!(msg.header.service_id, ServiceId(0x1234));
        assert_eq!(msg.header.message_type, MessageType::Request);
        assert_eq!(msg.payload.as_ref(), b"hello");
        assert_eq!(msg.header.length, 8 + 5);
    }

    #[test]
    fn test_message_roundtrip() {
        let original = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x5678))
            .client_id(ClientId(0xABCD))
            .session_id(SessionId(0x0001))
            .payload(vec![1, 2, 3, 4, 5])
            .build();

        let parsed = SomeIpMessage::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_response_to() {
        let request = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x0001))
            .client_id(ClientId(0x0100))
            .session_id(SessionId(0x0042))
            .build();

        let response = request.response_to().payload(b"data".as_slice()).build();
        assert_eq!(response.header.service_id, request.header.service_id);
        assert_eq!(response.header.client_id, request.header.client_id);
        assert_eq!(response.header.session_id, request.header.session_id);
        assert_eq!(response.header.message_type, MessageType::Response);
    }

    #[test]
    fn test_error_to() {
        let request = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x0001))
            .session_id(SessionId(0x0042))
            .build();

        let error = request.error_to(ReturnCode::UNKNOWN_METHOD).build();
        assert_eq!(error.header.message_type, MessageType::Error);
        assert_eq!(error.header.return_code, ReturnCode::UNKNOWN_METHOD);
        assert_eq!(error.header.session_id, SessionId(0x0042));
    }

    #[test]
    fn test_length_mismatch() {
        let msg = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x0001))
            .payload(vec![0u8; 32])
            .build();
        let mut bytes = msg.to_bytes();
        bytes.truncate(HEADER_SIZE + 16);

        let result = SomeIpMessage::from_bytes(&bytes);
        assert!(matches!(result, Err(DecodeError::LengthMismatch { .. })));
    }
}
