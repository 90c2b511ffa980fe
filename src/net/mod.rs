//! Endpoint management: socket ownership, reader tasks and TCP links.
//!
//! Sockets are owned by tasks spawned here; everything they receive is
//! decoded and pushed as a [`NetEvent`] into the daemon loop's channel. The
//! daemon is the only writer of protocol state, so these tasks carry none.

pub mod tcp;
pub mod udp;

use std::net::SocketAddrV4;

use tokio::sync::mpsc;

use crate::error::DecodeError;
use crate::message::SomeIpMessage;
use crate::registry::{ClientKey, ServerKey};
use crate::types::TransportProtocol;

pub use tcp::ReconnectBackoff;
pub use udp::{SdSocket, UdpEndpoint};

/// Which local instance a socket or connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOwner {
    /// A local server instance's service socket.
    Server(ServerKey),
    /// A local client instance's endpoint.
    Client(ClientKey),
}

/// Events produced by socket tasks for the daemon loop.
#[derive(Debug)]
pub enum NetEvent {
    /// A datagram arrived on the SD socket.
    Sd {
        /// Raw frame.
        data: Vec<u8>,
        /// Sender.
        from: SocketAddrV4,
    },
    /// A decoded SOME/IP message arrived on a service socket.
    Frame {
        /// Owning instance.
        owner: SocketOwner,
        /// Transport it arrived over.
        transport: TransportProtocol,
        /// The message.
        msg: SomeIpMessage,
        /// Sender.
        from: SocketAddrV4,
    },
    /// A frame failed to decode and was dropped.
    DecodeFailed {
        /// Owning instance.
        owner: SocketOwner,
        /// Sender.
        from: SocketAddrV4,
        /// Why it was dropped.
        error: DecodeError,
    },
    /// A TCP connection (accepted or dialed) is up; frames for the peer go
    /// through `tx`.
    TcpConnected {
        /// Owning instance.
        owner: SocketOwner,
        /// Remote peer.
        peer: SocketAddrV4,
        /// Write queue of the connection's writer task.
        tx: mpsc::Sender<Vec<u8>>,
    },
    /// A TCP connection closed (EOF, I/O error, framing error or connect
    /// failure after the last retry).
    TcpClosed {
        /// Owning instance.
        owner: SocketOwner,
        /// Remote peer.
        peer: SocketAddrV4,
    },
}

/// Narrow a socket address to IPv4; v6 peers are out of scope and ignored.
pub(crate) fn as_v4(addr: std::net::SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        std::net::SocketAddr::V4(v4) => Some(v4),
        std::net::SocketAddr::V6(_) => None,
    }
}
