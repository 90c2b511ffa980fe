//! IPC envelope codec.
//!
//! Each envelope is length-prefixed (u32 big-endian) and starts with a u8
//! kind and a u32 correlation id. Event-style envelopes that carry no
//! request context put 0 on the wire for the correlation id. An unknown
//! kind is a decode error and closes the connection.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DecodeError, SomeIpError};
use crate::header::{ClientId, MethodId, ServiceId, SessionId};
use crate::sd::option::Endpoint;
use crate::sd::types::{EventgroupId, InstanceId};
use crate::service::Service;
use crate::types::{MessageType, ReturnCode, TransportProtocol};

/// Upper bound on one envelope body.
pub const MAX_ENVELOPE_SIZE: usize = 1 << 20;

/// Ack status: request carried out.
pub const ACK_OK: u8 = 0;
/// Ack status: (service, instance, transport) slot already taken.
pub const ACK_DUPLICATE: u8 = 1;
/// Ack status: handle was never issued or no longer live.
pub const ACK_UNKNOWN_HANDLE: u8 = 2;
/// Ack status: request is malformed for the referenced instance.
pub const ACK_INVALID: u8 = 3;
/// Ack status: socket setup failed.
pub const ACK_TRANSPORT: u8 = 4;

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Kind {
    RegisterServer = 0x01,
    StartOffer = 0x02,
    StopOffer = 0x03,
    RegisterClient = 0x04,
    Subscribe = 0x05,
    Unsubscribe = 0x06,
    SendEvent = 0x07,
    CallMethod = 0x08,
    ReplyRequest = 0x09,
    Ack = 0x0A,
    MethodResponse = 0x0B,
    IncomingEvent = 0x0C,
    IncomingRequest = 0x0D,
    SubscriptionChanged = 0x0E,
    InstanceAvailable = 0x0F,
}

impl Kind {
    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x01 => Ok(Self::RegisterServer),
            0x02 => Ok(Self::StartOffer),
            0x03 => Ok(Self::StopOffer),
            0x04 => Ok(Self::RegisterClient),
            0x05 => Ok(Self::Subscribe),
            0x06 => Ok(Self::Unsubscribe),
            0x07 => Ok(Self::SendEvent),
            0x08 => Ok(Self::CallMethod),
            0x09 => Ok(Self::ReplyRequest),
            0x0A => Ok(Self::Ack),
            0x0B => Ok(Self::MethodResponse),
            0x0C => Ok(Self::IncomingEvent),
            0x0D => Ok(Self::IncomingRequest),
            0x0E => Ok(Self::SubscriptionChanged),
            0x0F => Ok(Self::InstanceAvailable),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

/// One IPC envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcMessage {
    /// Register a server instance (app -> daemon).
    RegisterServer {
        correlation: u32,
        service: Service,
        instance_id: InstanceId,
        endpoint: Endpoint,
        ttl: u32,
        offer_period_ms: u32,
    },
    /// Enter Offering (app -> daemon).
    StartOffer { correlation: u32, handle: u32 },
    /// Leave Offering (app -> daemon).
    StopOffer { correlation: u32, handle: u32 },
    /// Register a client instance (app -> daemon).
    RegisterClient {
        correlation: u32,
        service: Service,
        instance_id: InstanceId,
        local_endpoint: SocketAddrV4,
    },
    /// Subscribe to an eventgroup (app -> daemon).
    Subscribe {
        correlation: u32,
        handle: u32,
        eventgroup: EventgroupId,
        ttl: u32,
    },
    /// Drop an eventgroup subscription (app -> daemon).
    Unsubscribe {
        correlation: u32,
        handle: u32,
        eventgroup: EventgroupId,
    },
    /// Publish an event to an eventgroup's subscribers (app -> daemon).
    SendEvent {
        correlation: u32,
        handle: u32,
        eventgroup: EventgroupId,
        event: MethodId,
        payload: Bytes,
    },
    /// Invoke a remote method (app -> daemon). `timeout_ms` of 0 requests
    /// fire-and-forget (REQUEST_NO_RETURN).
    CallMethod {
        correlation: u32,
        handle: u32,
        method: MethodId,
        timeout_ms: u32,
        payload: Bytes,
    },
    /// Answer a forwarded request (app -> daemon).
    ReplyRequest {
        correlation: u32,
        message_type: MessageType,
        return_code: ReturnCode,
        payload: Bytes,
    },
    /// Generic acknowledgement (daemon -> app), carrying the originating
    /// correlation id and, for registrations, the issued handle.
    Ack {
        correlation: u32,
        status: u8,
        handle: u32,
    },
    /// Terminal result of a CallMethod (daemon -> app).
    MethodResponse {
        correlation: u32,
        message_type: MessageType,
        return_code: ReturnCode,
        payload: Bytes,
    },
    /// An event arrived for a subscribed client (daemon -> app).
    IncomingEvent {
        handle: u32,
        event: MethodId,
        payload: Bytes,
    },
    /// A request arrived for an offered instance (daemon -> app).
    IncomingRequest {
        correlation: u32,
        handle: u32,
        method: MethodId,
        client_id: ClientId,
        session_id: SessionId,
        sender: Endpoint,
        payload: Bytes,
    },
    /// A remote subscriber joined or left an eventgroup (daemon -> app).
    SubscriptionChanged {
        handle: u32,
        eventgroup: EventgroupId,
        subscriber: Endpoint,
        added: bool,
    },
    /// The remote service became available/unavailable (daemon -> app).
    InstanceAvailable { handle: u32, available: bool },
}

// --- scalar reader over one envelope body ---

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + n > self.data.len() {
            return Err(DecodeError::Truncated {
                expected: self.pos + n,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.u8()? != 0)
    }

    fn payload(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn sock_addr(&mut self) -> Result<SocketAddrV4, DecodeError> {
        let b = self.take(4)?;
        let addr = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
        let port = self.u16()?;
        Ok(SocketAddrV4::new(addr, port))
    }

    fn endpoint(&mut self) -> Result<Endpoint, DecodeError> {
        let addr = self.sock_addr()?;
        let protocol = TransportProtocol::from_u8(self.u8()?)?;
        Ok(Endpoint { addr, protocol })
    }

    fn service(&mut self) -> Result<Service, DecodeError> {
        let service_id = ServiceId(self.u16()?);
        let major = self.u8()?;
        let minor = self.u32()?;

        let mut builder = Service::builder(service_id)
            .major_version(major)
            .minor_version(minor);
        for _ in 0..self.u16()? {
            builder = builder.method(self.u16()?);
        }
        for _ in 0..self.u16()? {
            builder = builder.event(self.u16()?);
        }
        for _ in 0..self.u16()? {
            let eventgroup = EventgroupId(self.u16()?);
            let count = self.u16()?;
            let mut events = Vec::with_capacity(count as usize);
            for _ in 0..count {
                events.push(self.u16()?);
            }
            builder = builder.eventgroup(eventgroup, events);
        }
        Ok(builder.build())
    }
}

// --- scalar writers ---

fn put_payload(buf: &mut Vec<u8>, payload: &Bytes) {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
}

fn put_sock_addr(buf: &mut Vec<u8>, addr: &SocketAddrV4) {
    buf.extend_from_slice(&addr.ip().octets());
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

fn put_endpoint(buf: &mut Vec<u8>, endpoint: &Endpoint) {
    put_sock_addr(buf, &endpoint.addr);
    buf.push(endpoint.protocol as u8);
}

fn put_service(buf: &mut Vec<u8>, service: &Service) {
    buf.extend_from_slice(&service.service_id.0.to_be_bytes());
    buf.push(service.major_version);
    buf.extend_from_slice(&service.minor_version.to_be_bytes());

    let methods: Vec<MethodId> = service.methods().collect();
    buf.extend_from_slice(&(methods.len() as u16).to_be_bytes());
    for id in methods {
        buf.extend_from_slice(&id.0.to_be_bytes());
    }

    let events: Vec<MethodId> = service.events().collect();
    buf.extend_from_slice(&(events.len() as u16).to_be_bytes());
    for id in events {
        buf.extend_from_slice(&id.0.to_be_bytes());
    }

    let groups: Vec<_> = service.eventgroups().collect();
    buf.extend_from_slice(&(groups.len() as u16).to_be_bytes());
    for (eventgroup, events) in groups {
        buf.extend_from_slice(&eventgroup.0.to_be_bytes());
        buf.extend_from_slice(&(events.len() as u16).to_be_bytes());
        for id in events {
            buf.extend_from_slice(&id.0.to_be_bytes());
        }
    }
}

impl IpcMessage {
    /// The envelope's correlation id (0 for event-style envelopes).
    pub fn correlation(&self) -> u32 {
        match self {
            Self::RegisterServer { correlation, .. }
            | Self::StartOffer { correlation, .. }
            | Self::StopOffer { correlation, .. }
            | Self::RegisterClient { correlation, .. }
            | Self::Subscribe { correlation, .. }
            | Self::Unsubscribe { correlation, .. }
            | Self::SendEvent { correlation, .. }
            | Self::CallMethod { correlation, .. }
            | Self::ReplyRequest { correlation, .. }
            | Self::Ack { correlation, .. }
            | Self::MethodResponse { correlation, .. }
            | Self::IncomingRequest { correlation, .. } => *correlation,
            Self::IncomingEvent { .. }
            | Self::SubscriptionChanged { .. }
            | Self::InstanceAvailable { .. } => 0,
        }
    }

    fn kind(&self) -> Kind {
        match self {
            Self::RegisterServer { .. } => Kind::RegisterServer,
            Self::StartOffer { .. } => Kind::StartOffer,
            Self::StopOffer { .. } => Kind::StopOffer,
            Self::RegisterClient { .. } => Kind::RegisterClient,
            Self::Subscribe { .. } => Kind::Subscribe,
            Self::Unsubscribe { .. } => Kind::Unsubscribe,
            Self::SendEvent { .. } => Kind::SendEvent,
            Self::CallMethod { .. } => Kind::CallMethod,
            Self::ReplyRequest { .. } => Kind::ReplyRequest,
            Self::Ack { .. } => Kind::Ack,
            Self::MethodResponse { .. } => Kind::MethodResponse,
            Self::IncomingEvent { .. } => Kind::IncomingEvent,
            Self::IncomingRequest { .. } => Kind::IncomingRequest,
            Self::SubscriptionChanged { .. } => Kind::SubscriptionChanged,
            Self::InstanceAvailable { .. } => Kind::InstanceAvailable,
        }
    }

    /// Encode the envelope body (kind + correlation + fields, no length
    /// prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.kind() as u8);
        buf.extend_from_slice(&self.correlation().to_be_bytes());

        match self {
            Self::RegisterServer {
                service,
                instance_id,
                endpoint,
                ttl,
                offer_period_ms,
                ..
            } => {
                put_service(&mut buf, service);
                buf.extend_from_slice(&instance_id.0.to_be_bytes());
                put_endpoint(&mut buf, endpoint);
                buf.extend_from_slice(&ttl.to_be_bytes());
                buf.extend_from_slice(&offer_period_ms.to_be_bytes());
            }
            Self::StartOffer { handle, .. } | Self::StopOffer { handle, .. } => {
                buf.extend_from_slice(&handle.to_be_bytes());
            }
            Self::RegisterClient {
                service,
                instance_id,
                local_endpoint,
                ..
            } => {
                put_service(&mut buf, service);
                buf.extend_from_slice(&instance_id.0.to_be_bytes());
                put_sock_addr(&mut buf, local_endpoint);
            }
            Self::Subscribe {
                handle,
                eventgroup,
                ttl,
                ..
            } => {
                buf.extend_from_slice(&handle.to_be_bytes());
                buf.extend_from_slice(&eventgroup.0.to_be_bytes());
                buf.extend_from_slice(&ttl.to_be_bytes());
            }
            Self::Unsubscribe {
                handle, eventgroup, ..
            } => {
                buf.extend_from_slice(&handle.to_be_bytes());
                buf.extend_from_slice(&eventgroup.0.to_be_bytes());
            }
            Self::SendEvent {
                handle,
                eventgroup,
                event,
                payload,
                ..
            } => {
                buf.extend_from_slice(&handle.to_be_bytes());
                buf.extend_from_slice(&eventgroup.0.to_be_bytes());
                buf.extend_from_slice(&event.0.to_be_bytes());
                put_payload(&mut buf, payload);
            }
            Self::CallMethod {
                handle,
                method,
                timeout_ms,
                payload,
                ..
            } => {
                buf.extend_from_slice(&handle.to_be_bytes());
                buf.extend_from_slice(&method.0.to_be_bytes());
                buf.extend_from_slice(&timeout_ms.to_be_bytes());
                put_payload(&mut buf, payload);
            }
            Self::ReplyRequest {
                message_type,
                return_code,
                payload,
                ..
            }
            | Self::MethodResponse {
                message_type,
                return_code,
                payload,
                ..
            } => {
                buf.push(*message_type as u8);
                buf.push(return_code.0);
                put_payload(&mut buf, payload);
            }
            Self::Ack { status, handle, .. } => {
                buf.push(*status);
                buf.extend_from_slice(&handle.to_be_bytes());
            }
            Self::IncomingEvent {
                handle,
                event,
                payload,
            } => {
                buf.extend_from_slice(&handle.to_be_bytes());
                buf.extend_from_slice(&event.0.to_be_bytes());
                put_payload(&mut buf, payload);
            }
            Self::IncomingRequest {
                handle,
                method,
                client_id,
                session_id,
                sender,
                payload,
                ..
            } => {
                buf.extend_from_slice(&handle.to_be_bytes());
                buf.extend_from_slice(&method.0.to_be_bytes());
                buf.extend_from_slice(&client_id.0.to_be_bytes());
                buf.extend_from_slice(&session_id.0.to_be_bytes());
                put_endpoint(&mut buf, sender);
                put_payload(&mut buf, payload);
            }
            Self::SubscriptionChanged {
                handle,
                eventgroup,
                subscriber,
                added,
            } => {
                buf.extend_from_slice(&handle.to_be_bytes());
                buf.extend_from_slice(&eventgroup.0.to_be_bytes());
                put_endpoint(&mut buf, subscriber);
                buf.push(*added as u8);
            }
            Self::InstanceAvailable { handle, available } => {
                buf.extend_from_slice(&handle.to_be_bytes());
                buf.push(*available as u8);
            }
        }
        buf
    }

    /// Decode one envelope body.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let kind = Kind::from_u8(r.u8()?)?;
        let correlation = r.u32()?;

        let msg = match kind {
            Kind::RegisterServer => Self::RegisterServer {
                correlation,
                service: r.service()?,
                instance_id: InstanceId(r.u16()?),
                endpoint: r.endpoint()?,
                ttl: r.u32()?,
                offer_period_ms: r.u32()?,
            },
            Kind::StartOffer => Self::StartOffer {
                correlation,
                handle: r.u32()?,
            },
            Kind::StopOffer => Self::StopOffer {
                correlation,
                handle: r.u32()?,
            },
            Kind::RegisterClient => Self::RegisterClient {
                correlation,
                service: r.service()?,
                instance_id: InstanceId(r.u16()?),
                local_endpoint: r.sock_addr()?,
            },
            Kind::Subscribe => Self::Subscribe {
                correlation,
                handle: r.u32()?,
                eventgroup: EventgroupId(r.u16()?),
                ttl: r.u32()?,
            },
            Kind::Unsubscribe => Self::Unsubscribe {
                correlation,
                handle: r.u32()?,
                eventgroup: EventgroupId(r.u16()?),
            },
            Kind::SendEvent => Self::SendEvent {
                correlation,
                handle: r.u32()?,
                eventgroup: EventgroupId(r.u16()?),
                event: MethodId(r.u16()?),
                payload: r.payload()?,
            },
            Kind::CallMethod => Self::CallMethod {
                correlation,
                handle: r.u32()?,
                method: MethodId(r.u16()?),
                timeout_ms: r.u32()?,
                payload: r.payload()?,
            },
            Kind::ReplyRequest => Self::ReplyRequest {
                correlation,
                message_type: MessageType::from_u8(r.u8()?)?,
                return_code: ReturnCode(r.u8()?),
                payload: r.payload()?,
            },
            Kind::Ack => Self::Ack {
                correlation,
                status: r.u8()?,
                handle: r.u32()?,
            },
            Kind::MethodResponse => Self::MethodResponse {
                correlation,
                message_type: MessageType::from_u8(r.u8()?)?,
                return_code: ReturnCode(r.u8()?),
                payload: r.payload()?,
            },
            Kind::IncomingEvent => Self::IncomingEvent {
                handle: r.u32()?,
                event: MethodId(r.u16()?),
                payload: r.payload()?,
            },
            Kind::IncomingRequest => Self::IncomingRequest {
                correlation,
                handle: r.u32()?,
                method: MethodId(r.u16()?),
                client_id: ClientId(r.u16()?),
                session_id: SessionId(r.u16()?),
                sender: r.endpoint()?,
                payload: r.payload()?,
            },
            Kind::SubscriptionChanged => Self::SubscriptionChanged {
                handle: r.u32()?,
                eventgroup: EventgroupId(r.u16()?),
                subscriber: r.endpoint()?,
                added: r.bool()?,
            },
            Kind::InstanceAvailable => Self::InstanceAvailable {
                handle: r.u32()?,
                available: r.bool()?,
            },
        };
        Ok(msg)
    }
}

/// Read one length-prefixed envelope from a stream.
pub async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> crate::error::Result<IpcMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_ENVELOPE_SIZE {
        return Err(SomeIpError::ProtocolViolation(format!(
            "unreasonable IPC envelope length {len}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(IpcMessage::decode(&body)?)
}

/// Write one length-prefixed envelope to a stream.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &IpcMessage,
) -> crate::error::Result<()> {
    let body = msg.encode();
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_service() -> Service {
        Service::builder(ServiceId(0x1234))
            .major_version(1)
            .minor_version(2)
            .method(0x0001)
            .method(0x0002)
            .eventgroup(EventgroupId(0x0321), [0x0123])
            .build()
    }

    fn roundtrip(msg: IpcMessage) {
        let decoded = IpcMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_register_server_roundtrip() {
        roundtrip(IpcMessage::RegisterServer {
            correlation: 7,
            service: sample_service(),
            instance_id: InstanceId(0x5678),
            endpoint: Endpoint::udp(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 3000)),
            ttl: 3,
            offer_period_ms: 500,
        });
    }

    #[test]
    fn test_register_client_roundtrip() {
        roundtrip(IpcMessage::RegisterClient {
            correlation: 8,
            service: sample_service(),
            instance_id: InstanceId(0x5678),
            local_endpoint: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 4000),
        });
    }

    #[test]
    fn test_data_envelopes_roundtrip() {
        roundtrip(IpcMessage::SendEvent {
            correlation: 9,
            handle: 3,
            eventgroup: EventgroupId(0x0321),
            event: MethodId::event(0x0123),
            payload: Bytes::from_static(&[1, 2, 3]),
        });
        roundtrip(IpcMessage::CallMethod {
            correlation: 10,
            handle: 4,
            method: MethodId(0x0001),
            timeout_ms: 1000,
            payload: Bytes::from_static(&[0, 2, 0, 3]),
        });
        roundtrip(IpcMessage::MethodResponse {
            correlation: 10,
            message_type: MessageType::Response,
            return_code: ReturnCode::OK,
            payload: Bytes::from_static(&[0, 0, 0, 5]),
        });
        roundtrip(IpcMessage::IncomingRequest {
            correlation: 11,
            handle: 5,
            method: MethodId(0x0001),
            client_id: ClientId(0x0100),
            session_id: SessionId(0x0001),
            sender: Endpoint::tcp(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 50000)),
            payload: Bytes::new(),
        });
    }

    #[test]
    fn test_event_envelopes_have_zero_correlation() {
        let msg = IpcMessage::IncomingEvent {
            handle: 1,
            event: MethodId::event(0x0123),
            payload: Bytes::from_static(&[1]),
        };
        assert_eq!(msg.correlation(), 0);
        roundtrip(msg);

        roundtrip(IpcMessage::SubscriptionChanged {
            handle: 2,
            eventgroup: EventgroupId(0x0321),
            subscriber: Endpoint::udp(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 4000)),
            added: true,
        });
        roundtrip(IpcMessage::InstanceAvailable {
            handle: 2,
            available: false,
        });
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut body = IpcMessage::StartOffer {
            correlation: 1,
            handle: 1,
        }
        .encode();
        body[0] = 0x7F;
        assert_eq!(
            IpcMessage::decode(&body),
            Err(DecodeError::UnknownMessageType(0x7F))
        );
    }

    #[test]
    fn test_truncated_body_rejected() {
        let body = IpcMessage::Subscribe {
            correlation: 1,
            handle: 1,
            eventgroup: EventgroupId(1),
            ttl: 5,
        }
        .encode();
        let result = IpcMessage::decode(&body[..body.len() - 2]);
        assert!(matches!(result, Err(DecodeError::Truncated { .. })));
    }

    #[tokio::test]
    async fn test_envelope_framing() {
        let msg = IpcMessage::Ack {
            correlation: 42,
            status: ACK_OK,
            handle: 7,
        };
        let mut buf = Vec::new();
        write_envelope(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_envelope(&mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_zero_length_envelope_rejected() {
        let mut cursor = Cursor::new(vec![0u8; 4]);
        let result = read_envelope(&mut cursor).await;
        assert!(matches!(result, Err(SomeIpError::ProtocolViolation(_))));
    }
}
