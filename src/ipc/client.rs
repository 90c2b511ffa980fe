//! Application-side IPC: the thin client layer through which applications
//! drive the daemon. Carries no network state of its own.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Result, SomeIpError};
use crate::header::{ClientId, MethodId, SessionId};
use crate::sd::option::Endpoint;
use crate::sd::types::{EventgroupId, InstanceId};
use crate::service::Service;
use crate::types::{MessageType, ReturnCode};

use super::wire::{
    read_envelope, write_envelope, IpcMessage, ACK_DUPLICATE, ACK_OK, ACK_UNKNOWN_HANDLE,
};

/// Terminal result of a remote method call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResult {
    /// RESPONSE or ERROR.
    pub message_type: MessageType,
    /// Return code of the response.
    pub return_code: ReturnCode,
    /// Response payload.
    pub payload: Bytes,
}

/// A request forwarded by the daemon, awaiting [`AppClient::reply`].
#[derive(Debug, Clone)]
pub struct IncomingCall {
    /// Daemon-side correlation id; echoed by the reply.
    pub correlation: u32,
    /// Server handle the request addresses.
    pub handle: u32,
    /// Requested method.
    pub method: MethodId,
    /// Requester's client id.
    pub client_id: ClientId,
    /// Requester's session id.
    pub session_id: SessionId,
    /// Requester's endpoint.
    pub sender: Endpoint,
    /// Request payload.
    pub payload: Bytes,
}

/// Unsolicited traffic from the daemon.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// An event notification for a subscribed client handle.
    Event {
        /// Client handle.
        handle: u32,
        /// Event id.
        event: MethodId,
        /// Event payload.
        payload: Bytes,
    },
    /// A method request for an offered server handle.
    Call(IncomingCall),
    /// A remote subscriber joined or left one of our eventgroups.
    SubscriptionChanged {
        /// Server handle.
        handle: u32,
        /// Eventgroup affected.
        eventgroup: EventgroupId,
        /// The subscriber's endpoint.
        subscriber: Endpoint,
        /// Joined (true) or left (false).
        added: bool,
    },
    /// The observed remote service became available or unavailable.
    Availability {
        /// Client handle.
        handle: u32,
        /// New availability.
        available: bool,
    },
}

type PendingMap = Arc<Mutex<HashMap<u32, oneshot::Sender<IpcMessage>>>>;

/// Handle to the daemon for one application.
///
/// Request methods take `&self`, so one client can drive concurrent calls;
/// the event stream is exclusive and can be split off with
/// [`AppClient::take_events`] when the client is shared.
#[derive(Debug)]
pub struct AppClient {
    tx: mpsc::Sender<IpcMessage>,
    events: Option<mpsc::Receiver<AppEvent>>,
    pending: PendingMap,
    next_correlation: AtomicU32,
}

impl AppClient {
    /// Connect to the daemon's Unix-domain socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();

        let (tx, mut out_rx) = mpsc::channel::<IpcMessage>(64);
        let (event_tx, events) = mpsc::channel::<AppEvent>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            let mut writer = write_half;
            while let Some(msg) = out_rx.recv().await {
                if write_envelope(&mut writer, &msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut reader = read_half;
            loop {
                let msg = match read_envelope(&mut reader).await {
                    Ok(msg) => msg,
                    Err(_) => break,
                };
                match msg {
                    IpcMessage::Ack { correlation, .. }
                    | IpcMessage::MethodResponse { correlation, .. } => {
                        if let Some(waiter) = reader_pending.lock().await.remove(&correlation) {
                            let _ = waiter.send(msg);
                        }
                    }
                    IpcMessage::IncomingEvent {
                        handle,
                        event,
                        payload,
                    } => {
                        let _ = event_tx
                            .send(AppEvent::Event {
                                handle,
                                event,
                                payload,
                            })
                            .await;
                    }
                    IpcMessage::IncomingRequest {
                        correlation,
                        handle,
                        method,
                        client_id,
                        session_id,
                        sender,
                        payload,
                    } => {
                        let _ = event_tx
                            .send(AppEvent::Call(IncomingCall {
                                correlation,
                                handle,
                                method,
                                client_id,
                                session_id,
                                sender,
                                payload,
                            }))
                            .await;
                    }
                    IpcMessage::SubscriptionChanged {
                        handle,
                        eventgroup,
                        subscriber,
                        added,
                    } => {
                        let _ = event_tx
                            .send(AppEvent::SubscriptionChanged {
                                handle,
                                eventgroup,
                                subscriber,
                                added,
                            })
                            .await;
                    }
                    IpcMessage::InstanceAvailable { handle, available } => {
                        let _ = event_tx
                            .send(AppEvent::Availability { handle, available })
                            .await;
                    }
                    _ => {}
                }
            }
            // Fail every waiter on disconnect.
            reader_pending.lock().await.clear();
        });

        Ok(Self {
            tx,
            events: Some(events),
            pending,
            next_correlation: AtomicU32::new(0),
        })
    }

    fn next_correlation(&self) -> u32 {
        // Correlation 0 marks event envelopes; skip it.
        self.next_correlation.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    async fn transact(
        &self,
        build: impl FnOnce(u32) -> IpcMessage,
    ) -> Result<IpcMessage> {
        let correlation = self.next_correlation();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation, waiter_tx);

        if self.tx.send(build(correlation)).await.is_err() {
            self.pending.lock().await.remove(&correlation);
            return Err(SomeIpError::IpcClosed);
        }
        waiter_rx.await.map_err(|_| SomeIpError::IpcClosed)
    }

    /// Run one request/ack exchange, returning (status, handle).
    async fn transact_status(&self, build: impl FnOnce(u32) -> IpcMessage) -> Result<(u8, u32)> {
        match self.transact(build).await? {
            IpcMessage::Ack { status, handle, .. } => Ok((status, handle)),
            other => Err(SomeIpError::ProtocolViolation(format!(
                "unexpected reply kind for correlation {}",
                other.correlation()
            ))),
        }
    }

    async fn transact_ack(&self, build: impl FnOnce(u32) -> IpcMessage) -> Result<u32> {
        match self.transact_status(build).await? {
            (ACK_OK, handle) => Ok(handle),
            (ACK_UNKNOWN_HANDLE, handle) => Err(SomeIpError::UnknownHandle(handle)),
            (status, _) => Err(SomeIpError::ProtocolViolation(format!(
                "daemon rejected request (status {status})"
            ))),
        }
    }

    /// Ack mapping for registrations, where DUPLICATE has a precise error.
    async fn transact_register(
        &self,
        service_id: crate::header::ServiceId,
        instance_id: InstanceId,
        build: impl FnOnce(u32) -> IpcMessage,
    ) -> Result<u32> {
        match self.transact_status(build).await? {
            (ACK_OK, handle) => Ok(handle),
            (ACK_DUPLICATE, _) => Err(SomeIpError::DuplicateInstance {
                service: service_id,
                instance: instance_id,
            }),
            (status, _) => Err(SomeIpError::ProtocolViolation(format!(
                "daemon rejected registration (status {status})"
            ))),
        }
    }

    /// Register a server instance; returns its handle.
    pub async fn register_server(
        &self,
        service: Service,
        instance_id: InstanceId,
        endpoint: Endpoint,
        ttl: u32,
        offer_period: Duration,
    ) -> Result<u32> {
        let service_id = service.service_id;
        self.transact_register(service_id, instance_id, |correlation| {
            IpcMessage::RegisterServer {
                correlation,
                service,
                instance_id,
                endpoint,
                ttl,
                offer_period_ms: offer_period.as_millis() as u32,
            }
        })
        .await
    }

    /// Register a client instance; returns its handle.
    pub async fn register_client(
        &self,
        service: Service,
        instance_id: InstanceId,
        local_endpoint: SocketAddrV4,
    ) -> Result<u32> {
        let service_id = service.service_id;
        self.transact_register(service_id, instance_id, |correlation| {
            IpcMessage::RegisterClient {
                correlation,
                service,
                instance_id,
                local_endpoint,
            }
        })
        .await
    }

    /// Start cyclic offering of a server instance.
    pub async fn start_offer(&self, handle: u32) -> Result<()> {
        self.transact_ack(|correlation| IpcMessage::StartOffer {
            correlation,
            handle,
        })
        .await
        .map(|_| ())
    }

    /// Stop offering a server instance (emits one Stop-Offer).
    pub async fn stop_offer(&self, handle: u32) -> Result<()> {
        self.transact_ack(|correlation| IpcMessage::StopOffer {
            correlation,
            handle,
        })
        .await
        .map(|_| ())
    }

    /// Subscribe a client handle to an eventgroup.
    pub async fn subscribe(&self, handle: u32, eventgroup: EventgroupId, ttl: u32) -> Result<()> {
        self.transact_ack(|correlation| IpcMessage::Subscribe {
            correlation,
            handle,
            eventgroup,
            ttl,
        })
        .await
        .map(|_| ())
    }

    /// Drop an eventgroup subscription.
    pub async fn unsubscribe(&self, handle: u32, eventgroup: EventgroupId) -> Result<()> {
        self.transact_ack(|correlation| IpcMessage::Unsubscribe {
            correlation,
            handle,
            eventgroup,
        })
        .await
        .map(|_| ())
    }

    /// Publish an event to every live subscriber of the eventgroup.
    pub async fn send_event(
        &self,
        handle: u32,
        eventgroup: EventgroupId,
        event_id: u16,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let payload = payload.into();
        self.transact_ack(|correlation| IpcMessage::SendEvent {
            correlation,
            handle,
            eventgroup,
            event: MethodId::event(event_id),
            payload,
        })
        .await
        .map(|_| ())
    }

    /// Call a remote method and await its result.
    pub async fn call_method(
        &self,
        handle: u32,
        method_id: u16,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<MethodResult> {
        let payload = payload.into();
        let timeout_ms = (timeout.as_millis() as u32).max(1);
        match self
            .transact(|correlation| IpcMessage::CallMethod {
                correlation,
                handle,
                method: MethodId::method(method_id),
                timeout_ms,
                payload,
            })
            .await?
        {
            IpcMessage::MethodResponse {
                message_type,
                return_code,
                payload,
                ..
            } => Ok(MethodResult {
                message_type,
                return_code,
                payload,
            }),
            IpcMessage::Ack { status, handle, .. } => Err(match status {
                ACK_UNKNOWN_HANDLE => SomeIpError::UnknownHandle(handle),
                status => SomeIpError::ProtocolViolation(format!(
                    "daemon rejected call (status {status})"
                )),
            }),
            other => Err(SomeIpError::ProtocolViolation(format!(
                "unexpected reply kind for correlation {}",
                other.correlation()
            ))),
        }
    }

    /// Fire a REQUEST_NO_RETURN; acknowledged locally, never answered.
    pub async fn call_method_no_return(
        &self,
        handle: u32,
        method_id: u16,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let payload = payload.into();
        self.transact_ack(|correlation| IpcMessage::CallMethod {
            correlation,
            handle,
            method: MethodId::method(method_id),
            timeout_ms: 0,
            payload,
        })
        .await
        .map(|_| ())
    }

    /// Answer a forwarded request.
    pub async fn reply(
        &self,
        call: &IncomingCall,
        message_type: MessageType,
        return_code: ReturnCode,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.tx
            .send(IpcMessage::ReplyRequest {
                correlation: call.correlation,
                message_type,
                return_code,
                payload: payload.into(),
            })
            .await
            .map_err(|_| SomeIpError::IpcClosed)
    }

    /// Next unsolicited event from the daemon; `None` after disconnect or
    /// once the stream has been split off.
    pub async fn next_event(&mut self) -> Option<AppEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Split off the event stream, leaving the request side shareable.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<AppEvent>> {
        self.events.take()
    }
}
