//! Daemon-side IPC: accept application connections on the Unix-domain
//! socket and bridge them into the daemon loop's event channel.

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::wire::{read_envelope, write_envelope, IpcMessage};
use super::ConnId;

/// Events surfaced to the daemon loop for each application connection.
#[derive(Debug)]
pub enum IpcEvent {
    /// A new application connected; envelopes for it go through `tx`.
    Connected {
        /// The connection.
        conn: ConnId,
        /// Write queue of the connection's writer task.
        tx: mpsc::Sender<IpcMessage>,
    },
    /// The application sent an envelope.
    Request {
        /// The connection.
        conn: ConnId,
        /// The decoded envelope.
        msg: IpcMessage,
    },
    /// The connection went away (EOF, I/O error, or unknown envelope kind).
    Disconnected {
        /// The connection.
        conn: ConnId,
    },
}

/// The daemon's IPC acceptor.
#[derive(Debug)]
pub struct IpcServer;

impl IpcServer {
    /// Spawn the accept loop; each connection gets reader and writer tasks.
    pub fn spawn(listener: UnixListener, events: mpsc::Sender<IpcEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut next_conn = 1u64;
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let conn = ConnId(next_conn);
                        next_conn += 1;
                        spawn_connection(stream, conn, events.clone()).await;
                    }
                    Err(err) => {
                        warn!(%err, "IPC accept failed");
                        break;
                    }
                }
            }
        })
    }
}

async fn spawn_connection(stream: UnixStream, conn: ConnId, events: mpsc::Sender<IpcEvent>) {
    let (read_half, write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<IpcMessage>(64);

    if events.send(IpcEvent::Connected { conn, tx }).await.is_err() {
        return;
    }

    // Writer: drain the daemon's queue onto the stream.
    tokio::spawn(async move {
        let mut writer = write_half;
        while let Some(msg) = rx.recv().await {
            if write_envelope(&mut writer, &msg).await.is_err() {
                break;
            }
        }
    });

    // Reader: decode envelopes until EOF or a framing/kind error; any
    // error closes the connection.
    tokio::spawn(async move {
        let mut reader = read_half;
        loop {
            match read_envelope(&mut reader).await {
                Ok(msg) => {
                    if events.send(IpcEvent::Request { conn, msg }).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(%conn, %err, "IPC connection closed");
                    let _ = events.send(IpcEvent::Disconnected { conn }).await;
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::wire::ACK_OK;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_accept_request_reply_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("someipyd.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        IpcServer::spawn(listener, events_tx);

        let mut app = UnixStream::connect(&path).await.unwrap();

        let (conn, daemon_tx) = match events_rx.recv().await.unwrap() {
            IpcEvent::Connected { conn, tx } => (conn, tx),
            other => panic!("unexpected event {other:?}"),
        };

        // App -> daemon request.
        let request = IpcMessage::StartOffer {
            correlation: 5,
            handle: 1,
        };
        write_envelope(&mut app, &request).await.unwrap();
        match events_rx.recv().await.unwrap() {
            IpcEvent::Request { conn: c, msg } => {
                assert_eq!(c, conn);
                assert_eq!(msg, request);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Daemon -> app ack.
        daemon_tx
            .send(IpcMessage::Ack {
                correlation: 5,
                status: ACK_OK,
                handle: 1,
            })
            .await
            .unwrap();
        let reply = read_envelope(&mut app).await.unwrap();
        assert_eq!(reply.correlation(), 5);

        // Dropping the app side surfaces a disconnect.
        drop(app);
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            IpcEvent::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("someipyd.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        IpcServer::spawn(listener, events_tx);

        let mut app = UnixStream::connect(&path).await.unwrap();
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            IpcEvent::Connected { .. }
        ));

        // A well-framed envelope with a bogus kind byte.
        app.write_all(&5u32.to_be_bytes()).await.unwrap();
        app.write_all(&[0x7F, 0, 0, 0, 1]).await.unwrap();

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            IpcEvent::Disconnected { .. }
        ));
    }
}
