//! UDP sockets: the shared SD socket and per-instance service sockets.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::message::{SomeIpMessage, UDP_DATAGRAM_WARN_SIZE};

use super::{as_v4, NetEvent, SocketOwner};

/// The daemon's SD socket: one per host, bound to the SD port, joined to the
/// SD multicast group when the configured address is multicast (tests run it
/// against a plain loopback address).
#[derive(Debug)]
pub struct SdSocket {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
}

impl SdSocket {
    /// Bind the SD socket and join the group on the given interface.
    pub async fn bind(interface: Ipv4Addr, sd_addr: Ipv4Addr, sd_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, sd_port)).await?;
        if sd_addr.is_multicast() {
            socket.join_multicast_v4(sd_addr, interface)?;
            socket.set_multicast_loop_v4(true)?;
        }
        Ok(Self {
            socket: Arc::new(socket),
            group: SocketAddrV4::new(sd_addr, sd_port),
        })
    }

    /// The address cyclic offers are sent to.
    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// Send a raw SD frame to the group.
    pub async fn send_multicast(&self, frame: &[u8]) -> Result<()> {
        self.socket.send_to(frame, self.group).await?;
        Ok(())
    }

    /// Send a raw SD frame to a specific peer.
    pub async fn send_unicast(&self, frame: &[u8], to: SocketAddrV4) -> Result<()> {
        self.socket.send_to(frame, to).await?;
        Ok(())
    }

    /// Spawn the reader task pushing raw datagrams into the daemon loop.
    pub fn spawn_reader(&self, events: mpsc::Sender<NetEvent>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        let Some(from) = as_v4(addr) else { continue };
                        let event = NetEvent::Sd {
                            data: buf[..len].to_vec(),
                            from,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "SD socket receive failed");
                        break;
                    }
                }
            }
        })
    }
}

/// A UDP service socket owned by one local instance.
#[derive(Debug)]
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local: SocketAddrV4,
}

impl UdpEndpoint {
    /// Bind the instance's configured endpoint.
    pub async fn bind(addr: SocketAddrV4) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local = as_v4(socket.local_addr()?).unwrap_or(addr);
        Ok(Self {
            socket: Arc::new(socket),
            local,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// Send a raw frame to a peer.
    pub async fn send_to(&self, frame: &[u8], to: SocketAddrV4) -> Result<()> {
        self.socket.send_to(frame, to).await?;
        Ok(())
    }

    /// Spawn the reader task decoding datagrams into [`NetEvent::Frame`]s.
    pub fn spawn_reader(
        &self,
        owner: SocketOwner,
        events: mpsc::Sender<NetEvent>,
    ) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        let Some(from) = as_v4(addr) else { continue };
                        if len > UDP_DATAGRAM_WARN_SIZE {
                            // Processed regardless; fragmentation is not our
                            // concern.
                            warn!(len, %from, "oversized UDP datagram");
                        }
                        let event = match SomeIpMessage::from_bytes(&buf[..len]) {
                            Ok(msg) => NetEvent::Frame {
                                owner,
                                transport: crate::types::TransportProtocol::Udp,
                                msg,
                                from,
                            },
                            Err(error) => {
                                debug!(%from, %error, "dropping malformed datagram");
                                NetEvent::DecodeFailed { owner, from, error }
                            }
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "UDP endpoint receive failed");
                        break;
                    }
                }
            }
        })
    }
}
