//! SOME/IP-SD option types.
//!
//! Wire layout of every option: a 16-bit length field counting the bytes
//! after the type field, an 8-bit type, then the body starting with a
//! reserved byte. IPv4 options are exactly 12 bytes on the wire.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::DecodeError;
use crate::types::TransportProtocol;

use super::types::{OptionType, SD_OPTION_PREFIX_SIZE};

/// Body size of an IPv4 endpoint/multicast option (reserved, address,
/// reserved, transport, port).
const IPV4_BODY_SIZE: usize = 9;

/// IPv4 endpoint option payload, shared by the endpoint and multicast kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4EndpointOption {
    /// IPv4 address.
    pub address: Ipv4Addr,
    /// Transport protocol (TCP or UDP).
    pub transport: TransportProtocol,
    /// Port number.
    pub port: u16,
}

impl Ipv4EndpointOption {
    /// Parse the option body (after the type field).
    fn from_body(body: &[u8]) -> Result<Self, DecodeError> {
        if body.len() < IPV4_BODY_SIZE {
            return Err(DecodeError::MalformedOption("ipv4 option body too short"));
        }
        // body[0] reserved
        let address = Ipv4Addr::new(body[1], body[2], body[3], body[4]);
        // body[5] reserved
        let transport = TransportProtocol::from_u8(body[6])?;
        let port = u16::from_be_bytes([body[7], body[8]]);
        Ok(Self {
            address,
            transport,
            port,
        })
    }

    /// Serialize the option body (after the type field).
    fn to_body(self) -> [u8; IPV4_BODY_SIZE] {
        let mut body = [0u8; IPV4_BODY_SIZE];
        body[1..5].copy_from_slice(&self.address.octets());
        body[6] = self.transport as u8;
        body[7..9].copy_from_slice(&self.port.to_be_bytes());
        body
    }

    /// The socket address this option points at.
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.port)
    }
}

/// An SD option.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SdOption {
    /// IPv4 endpoint option (0x04).
    Ipv4Endpoint(Ipv4EndpointOption),
    /// IPv4 multicast option (0x14).
    Ipv4Multicast(Ipv4EndpointOption),
    /// Configuration option (0x01); body kept raw, never interpreted.
    Configuration(Vec<u8>),
    /// Load balancing option (0x02); decoded and ignored.
    LoadBalancing {
        /// Priority (lower wins).
        priority: u16,
        /// Weight within a priority.
        weight: u16,
    },
    /// Unrecognized option kind, carried opaquely and skipped.
    Opaque {
        /// Raw option type byte.
        option_type: u8,
        /// Raw body including the leading reserved byte.
        body: Vec<u8>,
    },
}

impl SdOption {
    /// Parse one option from the options array; returns the option and the
    /// number of bytes it occupied.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        if data.len() < SD_OPTION_PREFIX_SIZE {
            return Err(DecodeError::Truncated {
                expected: SD_OPTION_PREFIX_SIZE,
                actual: data.len(),
            });
        }

        let length = u16::from_be_bytes([data[0], data[1]]) as usize;
        let option_type = data[2];
        let total = SD_OPTION_PREFIX_SIZE + length;
        if data.len() < total {
            return Err(DecodeError::Truncated {
                expected: total,
                actual: data.len(),
            });
        }

        let body = &data[SD_OPTION_PREFIX_SIZE..total];

        let option = match OptionType::from_u8(option_type) {
            Some(OptionType::Ipv4Endpoint) => {
                Self::Ipv4Endpoint(Ipv4EndpointOption::from_body(body)?)
            }
            Some(OptionType::Ipv4Multicast) => {
                Self::Ipv4Multicast(Ipv4EndpointOption::from_body(body)?)
            }
            Some(OptionType::Configuration) => {
                if body.is_empty() {
                    return Err(DecodeError::MalformedOption("empty configuration option"));
                }
                Self::Configuration(body[1..].to_vec())
            }
            Some(OptionType::LoadBalancing) => {
                if body.len() < 5 {
                    return Err(DecodeError::MalformedOption("load balancing body too short"));
                }
                Self::LoadBalancing {
                    priority: u16::from_be_bytes([body[1], body[2]]),
                    weight: u16::from_be_bytes([body[3], body[4]]),
                }
            }
            None => Self::Opaque {
                option_type,
                body: body.to_vec(),
            },
        };

        Ok((option, total))
    }

    /// Serialize the option including its length/type prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (option_type, body): (u8, Vec<u8>) = match self {
            Self::Ipv4Endpoint(opt) => (OptionType::Ipv4Endpoint as u8, opt.to_body().to_vec()),
            Self::Ipv4Multicast(opt) => (OptionType::Ipv4Multicast as u8, opt.to_body().to_vec()),
            Self::Configuration(cfg) => {
                let mut body = Vec::with_capacity(cfg.len() + 1);
                body.push(0); // reserved
                body.extend_from_slice(cfg);
                (OptionType::Configuration as u8, body)
            }
            Self::LoadBalancing { priority, weight } => {
                let mut body = vec![0u8; 5];
                body[1..3].copy_from_slice(&priority.to_be_bytes());
                body[3..5].copy_from_slice(&weight.to_be_bytes());
                (OptionType::LoadBalancing as u8, body)
            }
            Self::Opaque { option_type, body } => (*option_type, body.clone()),
        };

        let mut buf = Vec::with_capacity(SD_OPTION_PREFIX_SIZE + body.len());
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.push(option_type);
        buf.extend_from_slice(&body);
        buf
    }

    /// The endpoint this option addresses, for the unicast endpoint kind.
    pub fn endpoint(&self) -> Option<Endpoint> {
        match self {
            Self::Ipv4Endpoint(opt) => Some(Endpoint {
                addr: opt.socket_addr(),
                protocol: opt.transport,
            }),
            _ => None,
        }
    }
}

/// A network endpoint: IPv4 socket address plus transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Socket address.
    pub addr: SocketAddrV4,
    /// Transport protocol.
    pub protocol: TransportProtocol,
}

impl Endpoint {
    /// Create a TCP endpoint.
    pub fn tcp(addr: SocketAddrV4) -> Self {
        Self {
            addr,
            protocol: TransportProtocol::Tcp,
        }
    }

    /// Create a UDP endpoint.
    pub fn udp(addr: SocketAddrV4) -> Self {
        Self {
            addr,
            protocol: TransportProtocol::Udp,
        }
    }

    /// Convert to an IPv4 endpoint option.
    pub fn to_option(self) -> SdOption {
        SdOption::Ipv4Endpoint(Ipv4EndpointOption {
            address: *self.addr.ip(),
            transport: self.protocol,
            port: self.addr.port(),
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.addr)
    }
}
