//! The local IPC transport between applications and the daemon: a framed
//! Unix-domain stream carrying control and data envelopes.

pub mod client;
pub mod server;
pub mod wire;

/// Identifies one application connection to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ipc#{}", self.0)
    }
}

pub use client::{AppClient, AppEvent, IncomingCall, MethodResult};
pub use server::{IpcEvent, IpcServer};
pub use wire::{IpcMessage, ACK_DUPLICATE, ACK_INVALID, ACK_OK, ACK_TRANSPORT, ACK_UNKNOWN_HANDLE};
