//! TCP endpoints: passive listeners, active connectors with capped
//! exponential backoff, and per-connection reader/writer tasks.

use std::net::SocketAddrV4;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::codec::read_frame;
use crate::error::Result;

use super::{as_v4, NetEvent, SocketOwner};

/// Capped exponential backoff for TCP reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Initial delay.
    pub base: Duration,
    /// Delay ceiling.
    pub max: Duration,
    /// Multiplier per attempt.
    pub multiplier: f64,
    /// Attempts before the connector gives up and reports the link down.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 6,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.base.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms.min(self.max.as_millis() as f64) as u64)
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Bind the passive listener of a TCP server instance.
pub async fn bind_listener(addr: SocketAddrV4) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    Ok(listener)
}

/// Spawn the accept loop of a TCP server instance. Every accepted
/// connection gets its own reader and writer tasks.
pub fn spawn_listener(
    listener: TcpListener,
    owner: SocketOwner,
    events: mpsc::Sender<NetEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let Some(peer) = as_v4(addr) else { continue };
                    spawn_connection(stream, owner, peer, events.clone()).await;
                }
                Err(err) => {
                    warn!(%err, "TCP accept failed");
                    break;
                }
            }
        }
    })
}

/// Spawn an active connector dialing `peer`, optionally binding the local
/// data endpoint so the remote side can match it against the advertised
/// subscriber endpoint. Retries with capped exponential backoff; after the
/// last attempt a [`NetEvent::TcpClosed`] reports the link down.
pub fn spawn_connector(
    owner: SocketOwner,
    peer: SocketAddrV4,
    local: Option<SocketAddrV4>,
    backoff: ReconnectBackoff,
    events: mpsc::Sender<NetEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt = 0u32;
        loop {
            match dial(peer, local).await {
                Ok(stream) => {
                    spawn_connection(stream, owner, peer, events).await;
                    return;
                }
                Err(err) => {
                    debug!(%peer, attempt, %err, "TCP connect failed");
                    if !backoff.should_retry(attempt) {
                        let _ = events.send(NetEvent::TcpClosed { owner, peer }).await;
                        return;
                    }
                    sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    })
}

async fn dial(peer: SocketAddrV4, local: Option<SocketAddrV4>) -> Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    if let Some(local) = local {
        socket.set_reuseaddr(true)?;
        socket.bind(local.into())?;
    }
    Ok(socket.connect(peer.into()).await?)
}

/// Wire up reader and writer tasks for an established connection and
/// announce it to the daemon loop.
async fn spawn_connection(
    stream: TcpStream,
    owner: SocketOwner,
    peer: SocketAddrV4,
    events: mpsc::Sender<NetEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);

    if events
        .send(NetEvent::TcpConnected { owner, peer, tx })
        .await
        .is_err()
    {
        return;
    }

    spawn_writer(write_half, rx, owner, peer, events.clone());
    spawn_reader(read_half, owner, peer, events);
}

fn spawn_writer(
    write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    owner: SocketOwner,
    peer: SocketAddrV4,
    events: mpsc::Sender<NetEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
                let _ = events.send(NetEvent::TcpClosed { owner, peer }).await;
                return;
            }
        }
        let _ = writer.shutdown().await;
    })
}

fn spawn_reader(
    read_half: OwnedReadHalf,
    owner: SocketOwner,
    peer: SocketAddrV4,
    events: mpsc::Sender<NetEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            match read_frame(&mut reader).await {
                Ok(msg) => {
                    let event = NetEvent::Frame {
                        owner,
                        transport: crate::types::TransportProtocol::Tcp,
                        msg,
                        from: peer,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    // EOF and framing errors both terminate the connection;
                    // the daemon drops subscriptions bound to this peer.
                    debug!(%peer, %err, "TCP connection closed");
                    let _ = events.send(NetEvent::TcpClosed { owner, peer }).await;
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::write_frame;
    use crate::header::{MethodId, ServiceId};
    use crate::message::SomeIpMessage;
    use crate::registry::ClientKey;
    use crate::sd::types::InstanceId;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    fn owner() -> SocketOwner {
        let key: ClientKey = (ServiceId(0x1234), InstanceId(1));
        SocketOwner::Client(key)
    }

    #[test]
    fn test_backoff_caps() {
        let backoff = ReconnectBackoff::default();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(5));
        assert!(backoff.should_retry(5));
        assert!(!backoff.should_retry(6));
    }

    #[tokio::test]
    async fn test_listener_and_connector_roundtrip() {
        let listener = bind_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        let (server_tx, mut server_rx) = mpsc::channel(8);
        spawn_listener(listener, owner(), server_tx);

        let (client_tx, mut client_rx) = mpsc::channel(8);
        spawn_connector(
            owner(),
            addr,
            None,
            ReconnectBackoff::default(),
            client_tx,
        );

        // Client side comes up first.
        let client_queue = match client_rx.recv().await.unwrap() {
            NetEvent::TcpConnected { tx, .. } => tx,
            other => panic!("unexpected event {other:?}"),
        };
        // Server side announces the accepted peer.
        let server_queue = match server_rx.recv().await.unwrap() {
            NetEvent::TcpConnected { tx, .. } => tx,
            other => panic!("unexpected event {other:?}"),
        };

        // Frame client -> server.
        let request = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x0001))
            .payload(b"ping".as_slice())
            .build();
        client_queue.send(request.to_bytes()).await.unwrap();
        match server_rx.recv().await.unwrap() {
            NetEvent::Frame { msg, .. } => assert_eq!(msg, request),
            other => panic!("unexpected event {other:?}"),
        }

        // Frame server -> client.
        let response = request.response_to().payload(b"pong".as_slice()).build();
        server_queue.send(response.to_bytes()).await.unwrap();
        match client_rx.recv().await.unwrap() {
            NetEvent::Frame { msg, .. } => assert_eq!(msg, response),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connector_gives_up_after_retries() {
        // Nothing listens here; the connector must report the link down.
        let (tx, mut rx) = mpsc::channel(8);
        let backoff = ReconnectBackoff {
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
            multiplier: 1.0,
            max_attempts: 2,
        };
        spawn_connector(
            owner(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
            None,
            backoff,
            tx,
        );

        assert!(matches!(
            rx.recv().await.unwrap(),
            NetEvent::TcpClosed { .. }
        ));
    }

    #[tokio::test]
    async fn test_framing_error_closes_connection() {
        let listener = bind_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_tx, mut server_rx) = mpsc::channel(8);
        spawn_listener(listener, owner(), server_tx);

        let mut raw = TcpStream::connect(addr).await.unwrap();
        // An absurd length field is a framing error.
        let mut junk = SomeIpMessage::request(ServiceId(1), MethodId(1)).build().to_bytes();
        junk[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        raw.write_all(&junk).await.unwrap();

        // Connected, then closed.
        assert!(matches!(
            server_rx.recv().await.unwrap(),
            NetEvent::TcpConnected { .. }
        ));
        assert!(matches!(
            server_rx.recv().await.unwrap(),
            NetEvent::TcpClosed { .. }
        ));
    }

    #[tokio::test]
    async fn test_read_frame_sync_cursor() {
        // The TCP framing reads the 16-byte header then exactly the payload.
        let msg = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x0001))
            .payload(vec![7u8; 100])
            .build();
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), msg);
    }
}
