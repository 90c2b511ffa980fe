//! SOME/IP middleware daemon and client library.
//!
//! This crate implements the core of a SOME/IP middleware per AUTOSAR
//! R22-11: a long-lived daemon (`someipyd`) that owns all network resources
//! on a host, and a thin application-side layer that reaches it over a
//! Unix-domain socket.
//!
//! # Architecture
//!
//! - [`header`], [`message`], [`codec`], [`sd`] — the bit-exact wire codec
//!   for SOME/IP headers, SD entries and SD options, with no I/O.
//! - [`net`] — socket ownership: the SD multicast socket, per-instance
//!   UDP/TCP endpoints, TCP framing and reconnect backoff.
//! - [`sd::engine`] — the SD state machines: cyclic offers, the
//!   find/offer/subscribe/ack handshake and TTL-based expiry.
//! - [`registry`] — the in-memory directories of local instances, remote
//!   offers and subscriptions.
//! - [`correlator`] — client/session id allocation and out-of-order
//!   response correlation.
//! - [`ipc`] — the framed IPC contract and the [`ipc::AppClient`]
//!   application layer.
//! - [`daemon`] — the single event loop owning all of the above.
//!
//! Payloads are opaque byte strings throughout; (de)serialization is a
//! separate concern.
//!
//! # Example
//!
//! ```no_run
//! use someipyd::ipc::AppClient;
//! use someipyd::sd::{Endpoint, EventgroupId, InstanceId};
//! use someipyd::Service;
//! use someipyd::header::ServiceId;
//! use std::time::Duration;
//!
//! # async fn demo() -> someipyd::Result<()> {
//! let app = AppClient::connect("/tmp/someipyd.sock").await?;
//!
//! let service = Service::builder(ServiceId(0x1234))
//!     .major_version(1)
//!     .eventgroup(EventgroupId(0x0321), [0x0123])
//!     .build();
//! let handle = app
//!     .register_server(
//!         service,
//!         InstanceId(0x5678),
//!         Endpoint::udp("127.0.0.1:3000".parse().unwrap()),
//!         3,
//!         Duration::from_millis(500),
//!     )
//!     .await?;
//! app.start_offer(handle).await?;
//! app.send_event(handle, EventgroupId(0x0321), 0x0123, vec![1, 2, 3]).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod correlator;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod header;
pub mod ipc;
pub mod message;
pub mod net;
pub mod registry;
pub mod sd;
pub mod service;
pub mod types;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{DecodeError, Result, SomeIpError};
pub use header::{ClientId, MethodId, ServiceId, SessionId, SomeIpHeader, HEADER_SIZE};
pub use message::{MessageBuilder, SomeIpMessage};
pub use service::{Service, ServiceBuilder};
pub use types::{MessageType, ReturnCode, TransportProtocol, PROTOCOL_VERSION};
