//! The daemon: one per host, sole owner of the SD socket, every service
//! endpoint and the SOME/IP wire state, driven by a single event loop.
//!
//! Socket and IPC tasks communicate with the loop through channels only;
//! every registry mutation happens here. Timer work is driven by a unified
//! deadline: the earliest of the next cyclic offer, the next SD timer, the
//! next method/request deadline and one TTL tick.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::correlator::{self, MethodOutcome, ResponseSink};
use crate::dispatch::{DispatchCounters, ForwardedRequest, RequestTable, REQUEST_REPLY_TIMEOUT};
use crate::error::Result;
use crate::header::MethodId;
use crate::ipc::{
    ConnId, IpcEvent, IpcMessage, IpcServer, ACK_DUPLICATE, ACK_INVALID, ACK_OK, ACK_TRANSPORT,
    ACK_UNKNOWN_HANDLE,
};
use crate::message::{MessageBuilder, SomeIpMessage};
use crate::net::{tcp, NetEvent, ReconnectBackoff, SdSocket, SocketOwner, UdpEndpoint};
use crate::registry::{ClientKey, OfferState, Registry, ServerInstance, ServerKey, SubscribePhase};
use crate::sd::engine::{SdAction, SdEngine, SdTimings};
use crate::sd::option::Endpoint;
use crate::sd::types::{EventgroupId, InstanceId};
use crate::service::Service;
use crate::types::{MessageType, ReturnCode, TransportProtocol};

const EVENT_CHANNEL_DEPTH: usize = 1024;

/// State of one TCP link, keyed by (owner, peer).
#[derive(Debug)]
enum TcpLink {
    /// Connector dialing; calls fail fast until it reports in.
    Connecting,
    /// Established; frames go through the writer queue.
    Up(mpsc::Sender<Vec<u8>>),
}

/// The daemon. All state roots here; `main` owns the single value.
pub struct Daemon {
    cfg: Config,
    registry: Registry,
    engine: SdEngine,
    request_table: RequestTable,
    counters: DispatchCounters,

    sd: SdSocket,
    net_tx: mpsc::Sender<NetEvent>,
    net_rx: Option<mpsc::Receiver<NetEvent>>,
    ipc_rx: Option<mpsc::Receiver<IpcEvent>>,

    conns: HashMap<ConnId, mpsc::Sender<IpcMessage>>,
    udp_endpoints: HashMap<SocketOwner, UdpEndpoint>,
    tcp_links: HashMap<(SocketOwner, SocketAddrV4), TcpLink>,
    tasks: HashMap<SocketOwner, Vec<JoinHandle<()>>>,
    core_tasks: Vec<JoinHandle<()>>,

    server_handles: HashMap<u32, ServerKey>,
    client_handles: HashMap<u32, ClientKey>,
    server_handle_of: HashMap<ServerKey, u32>,
    client_handle_of: HashMap<ClientKey, u32>,
    next_handle: u32,
}

impl Daemon {
    /// Bind the SD socket and the IPC listener. Failures here are fatal
    /// startup errors (exit 1).
    pub async fn bind(cfg: Config) -> Result<Self> {
        let sd = SdSocket::bind(cfg.interface, cfg.sd_address, cfg.sd_port).await?;

        // A stale socket file from an unclean shutdown would fail the bind.
        let _ = std::fs::remove_file(&cfg.uds_path);
        let listener = UnixListener::bind(&cfg.uds_path)?;

        let (net_tx, net_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (ipc_tx, ipc_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let sd_reader = sd.spawn_reader(net_tx.clone());
        let ipc_task = IpcServer::spawn(listener, ipc_tx);

        info!(
            sd = %cfg.sd_socket_addr(),
            uds = %cfg.uds_path.display(),
            "someipyd listening"
        );

        Ok(Self {
            cfg,
            registry: Registry::new(),
            engine: SdEngine::new(SdTimings::default()),
            request_table: RequestTable::new(),
            counters: DispatchCounters::default(),
            sd,
            net_tx,
            net_rx: Some(net_rx),
            ipc_rx: Some(ipc_rx),
            conns: HashMap::new(),
            udp_endpoints: HashMap::new(),
            tcp_links: HashMap::new(),
            tasks: HashMap::new(),
            core_tasks: vec![sd_reader, ipc_task],
            server_handles: HashMap::new(),
            client_handles: HashMap::new(),
            server_handle_of: HashMap::new(),
            client_handle_of: HashMap::new(),
            next_handle: 0,
        })
    }

    /// Run the event loop until both event sources close.
    pub async fn run(&mut self) -> Result<()> {
        let (Some(mut net_rx), Some(mut ipc_rx)) = (self.net_rx.take(), self.ipc_rx.take())
        else {
            return Err(crate::error::SomeIpError::ProtocolViolation(
                "daemon loop already running".into(),
            ));
        };

        loop {
            let deadline = tokio::time::Instant::from_std(self.next_deadline(Instant::now()));
            tokio::select! {
                event = ipc_rx.recv() => match event {
                    Some(event) => self.handle_ipc(event).await,
                    None => break,
                },
                event = net_rx.recv() => match event {
                    Some(event) => self.handle_net(event).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => self.on_timer().await,
            }
        }
        Ok(())
    }

    /// Emit Stop-Offer for every Offering instance and release resources.
    pub async fn shutdown(&mut self) {
        let now = Instant::now();
        let offering: Vec<ServerKey> = self
            .registry
            .servers()
            .filter(|s| s.state == OfferState::Offering)
            .map(|s| s.key())
            .collect();
        for key in offering {
            let actions = self.engine.stop_offer(&mut self.registry, &key, now);
            self.execute_actions(actions).await;
        }

        for (_, tasks) in self.tasks.drain() {
            for task in tasks {
                task.abort();
            }
        }
        for task in self.core_tasks.drain(..) {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.cfg.uds_path);

        info!(
            sd_decode_errors = self.engine.counters.decode_errors,
            sd_protocol_violations = self.engine.counters.protocol_violations,
            decode_errors = self.counters.decode_errors,
            dropped_events = self.counters.dropped_events,
            dropped_responses = self.counters.dropped_responses,
            dropped_requests = self.counters.dropped_requests,
            "someipyd shut down"
        );
    }

    fn next_deadline(&self, now: Instant) -> Instant {
        let mut deadline = self.engine.next_deadline(&self.registry, now);
        if let Some(t) = self.request_table.next_deadline() {
            deadline = deadline.min(t);
        }
        for client in self.registry.clients() {
            if let Some(t) = client.correlator.next_deadline() {
                deadline = deadline.min(t);
            }
        }
        deadline.max(now)
    }

    fn alloc_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    async fn send_ipc(&self, conn: ConnId, msg: IpcMessage) {
        if let Some(tx) = self.conns.get(&conn) {
            let _ = tx.send(msg).await;
        }
    }

    async fn send_ack(&self, conn: ConnId, correlation: u32, status: u8, handle: u32) {
        self.send_ipc(
            conn,
            IpcMessage::Ack {
                correlation,
                status,
                handle,
            },
        )
        .await;
    }

    async fn send_method_response(&self, conn: ConnId, correlation: u32, outcome: MethodOutcome) {
        self.send_ipc(
            conn,
            IpcMessage::MethodResponse {
                correlation,
                message_type: outcome.message_type,
                return_code: outcome.return_code,
                payload: outcome.payload,
            },
        )
        .await;
    }

    /// Send a SOME/IP message to a remote endpoint through the owner's
    /// socket or link. Returns false when nothing was sent.
    async fn send_to_remote(
        &self,
        owner: SocketOwner,
        target: Endpoint,
        msg: &SomeIpMessage,
    ) -> bool {
        match target.protocol {
            TransportProtocol::Udp => match self.udp_endpoints.get(&owner) {
                Some(endpoint) => endpoint.send_to(&msg.to_bytes(), target.addr).await.is_ok(),
                None => false,
            },
            TransportProtocol::Tcp => {
                match self.tcp_links.get(&(owner, target.addr)) {
                    Some(TcpLink::Up(tx)) => tx.send(msg.to_bytes()).await.is_ok(),
                    _ => false,
                }
            }
        }
    }

    // --- SD action execution ---

    async fn execute_actions(&mut self, actions: Vec<SdAction>) {
        for action in actions {
            match action {
                SdAction::SendMulticast(msg) => {
                    if let Err(err) = self.sd.send_multicast(&msg.to_frame()).await {
                        debug!(%err, "SD multicast send failed");
                    }
                }
                SdAction::SendUnicast(msg, to) => {
                    if let Err(err) = self.sd.send_unicast(&msg.to_frame(), to).await {
                        debug!(%err, %to, "SD unicast send failed");
                    }
                }
                SdAction::Availability { client: key, available } => {
                    let conn = self.registry.client(&key).map(|c| c.owner);
                    if let (Some(conn), Some(&handle)) = (conn, self.client_handle_of.get(&key)) {
                        self.send_ipc(conn, IpcMessage::InstanceAvailable { handle, available })
                            .await;
                    }
                    if available {
                        self.ensure_client_link(key);
                    } else {
                        self.tcp_links
                            .retain(|(owner, _), _| *owner != SocketOwner::Client(key));
                    }
                }
                SdAction::SubscriberAdded {
                    server,
                    eventgroup,
                    subscriber,
                } => {
                    self.notify_subscription_changed(server, eventgroup, subscriber, true)
                        .await;
                }
                SdAction::SubscriberRemoved {
                    server,
                    eventgroup,
                    subscriber,
                } => {
                    self.notify_subscription_changed(server, eventgroup, subscriber, false)
                        .await;
                }
            }
        }
    }

    async fn notify_subscription_changed(
        &self,
        server: ServerKey,
        eventgroup: EventgroupId,
        subscriber: Endpoint,
        added: bool,
    ) {
        let conn = self.registry.server(&server).map(|s| s.owner);
        if let (Some(conn), Some(&handle)) = (conn, self.server_handle_of.get(&server)) {
            self.send_ipc(
                conn,
                IpcMessage::SubscriptionChanged {
                    handle,
                    eventgroup,
                    subscriber,
                    added,
                },
            )
            .await;
        }
    }

    /// Dial the remote TCP endpoint of a client's offer ahead of time, so
    /// method calls and event delivery find the link up.
    fn ensure_client_link(&mut self, key: ClientKey) {
        let Some(offer) = self.registry.remote_offer(&key) else {
            return;
        };
        let Some(target) = offer
            .endpoints
            .iter()
            .find(|ep| ep.protocol == TransportProtocol::Tcp)
        else {
            return;
        };
        let Some(client) = self.registry.client(&key) else {
            return;
        };

        let owner = SocketOwner::Client(key);
        if self.tcp_links.contains_key(&(owner, target.addr)) {
            return;
        }
        self.tcp_links.insert((owner, target.addr), TcpLink::Connecting);
        tcp::spawn_connector(
            owner,
            target.addr,
            Some(client.local_endpoint),
            ReconnectBackoff::default(),
            self.net_tx.clone(),
        );
    }

    // --- network events ---

    async fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Sd { data, from } => {
                let now = Instant::now();
                let actions = self.engine.handle_frame(&mut self.registry, &data, from, now);
                self.execute_actions(actions).await;
            }
            NetEvent::DecodeFailed { .. } => {
                self.counters.decode_errors += 1;
            }
            NetEvent::Frame {
                owner,
                transport,
                msg,
                from,
            } => match owner {
                SocketOwner::Server(key) => match msg.header.message_type {
                    MessageType::Request | MessageType::RequestNoReturn => {
                        self.dispatch_request(key, transport, msg, from).await;
                    }
                    _ => {
                        self.counters.dropped_responses += 1;
                    }
                },
                SocketOwner::Client(key) => match msg.header.message_type {
                    MessageType::Notification => self.dispatch_notification(key, msg).await,
                    MessageType::Response | MessageType::Error => {
                        self.dispatch_response(key, msg).await;
                    }
                    _ => {
                        self.counters.dropped_requests += 1;
                    }
                },
            },
            NetEvent::TcpConnected { owner, peer, tx } => {
                self.tcp_links.insert((owner, peer), TcpLink::Up(tx));
            }
            NetEvent::TcpClosed { owner, peer } => {
                self.tcp_links.remove(&(owner, peer));
                if let SocketOwner::Server(_) = owner {
                    // Subscriptions ride the connection on TCP.
                    let removed = self.registry.drop_subscriptions_for_peer(peer);
                    for ((service_id, instance_id, eventgroup), endpoint) in removed {
                        let server = (service_id, instance_id, endpoint.protocol);
                        self.notify_subscription_changed(server, eventgroup, endpoint, false)
                            .await;
                    }
                }
            }
        }
    }

    async fn dispatch_request(
        &mut self,
        key: ServerKey,
        transport: TransportProtocol,
        msg: SomeIpMessage,
        from: SocketAddrV4,
    ) {
        let reply_to = Endpoint {
            addr: from,
            protocol: transport,
        };
        let Some(server) = self.registry.server(&key) else {
            self.counters.dropped_requests += 1;
            return;
        };
        let app = server.owner;
        let interface_version = server.service.major_version;
        let known_method = server.service.has_method(msg.header.method_id);

        if !known_method {
            self.counters.dropped_requests += 1;
            if msg.header.message_type == MessageType::Request {
                let error = msg.error_to(ReturnCode::UNKNOWN_METHOD).build();
                self.send_to_remote(SocketOwner::Server(key), reply_to, &error)
                    .await;
            }
            return;
        }
        let Some(&handle) = self.server_handle_of.get(&key) else {
            return;
        };

        // Fire-and-forget requests carry correlation 0: no reply expected.
        let correlation = if msg.header.message_type == MessageType::Request {
            self.request_table.insert(ForwardedRequest {
                server: key,
                app,
                reply_to,
                client_id: msg.header.client_id,
                session_id: msg.header.session_id,
                method: msg.header.method_id,
                interface_version,
                deadline: Instant::now() + REQUEST_REPLY_TIMEOUT,
            })
        } else {
            0
        };

        self.send_ipc(
            app,
            IpcMessage::IncomingRequest {
                correlation,
                handle,
                method: msg.header.method_id,
                client_id: msg.header.client_id,
                session_id: msg.header.session_id,
                sender: reply_to,
                payload: msg.payload,
            },
        )
        .await;
    }

    async fn dispatch_notification(&mut self, key: ClientKey, msg: SomeIpMessage) {
        let event = msg.header.method_id;
        let Some(client) = self.registry.client(&key) else {
            self.counters.dropped_events += 1;
            return;
        };
        // Initial events can race the Subscribe-Ack, so a subscription that
        // is still waiting for its ack also receives.
        let subscribed = client.service.eventgroups_containing(event).any(|eg| {
            matches!(
                client.subscriptions.get(&eg).map(|s| s.phase),
                Some(SubscribePhase::Subscribed { .. } | SubscribePhase::Subscribing { .. })
            )
        });
        if !subscribed {
            self.counters.dropped_events += 1;
            debug!(service = %key.0, %event, "dropping unsubscribed event");
            return;
        }
        let conn = client.owner;
        let Some(&handle) = self.client_handle_of.get(&key) else {
            return;
        };
        self.send_ipc(
            conn,
            IpcMessage::IncomingEvent {
                handle,
                event,
                payload: msg.payload,
            },
        )
        .await;
    }

    async fn dispatch_response(&mut self, key: ClientKey, msg: SomeIpMessage) {
        let delivery = {
            let Some(client) = self.registry.client_mut(&key) else {
                self.counters.dropped_responses += 1;
                return;
            };
            if msg.header.client_id != client.client_id {
                self.counters.dropped_responses += 1;
                return;
            }
            match client.correlator.complete(msg.header.session_id) {
                Some(call) => correlator::deliver(
                    call.sink,
                    MethodOutcome {
                        message_type: msg.header.message_type,
                        return_code: msg.header.return_code,
                        payload: msg.payload,
                    },
                ),
                None => {
                    self.counters.dropped_responses += 1;
                    debug!(session = %msg.header.session_id, "response for unknown session");
                    return;
                }
            }
        };
        if let Some((conn, correlation, outcome)) = delivery {
            self.send_method_response(conn, correlation, outcome).await;
        }
    }

    // --- timers ---

    async fn on_timer(&mut self) {
        let now = Instant::now();
        let actions = self.engine.poll(&mut self.registry, now);
        self.execute_actions(actions).await;

        for request in self.request_table.sweep(now) {
            // The remote runs its own timeout; the reply slot just goes away.
            debug!(
                service = %request.server.0,
                method = %request.method,
                "abandoning forwarded request without an application reply"
            );
        }

        let keys: Vec<ClientKey> = self.registry.clients().map(|c| c.key()).collect();
        for key in keys {
            let expired = match self.registry.client_mut(&key) {
                Some(client) => client.correlator.sweep(now),
                None => continue,
            };
            for call in expired {
                if let Some((conn, correlation, outcome)) =
                    correlator::deliver(call.sink, MethodOutcome::timeout())
                {
                    self.send_method_response(conn, correlation, outcome).await;
                }
            }
        }
    }

    // --- IPC events ---

    async fn handle_ipc(&mut self, event: IpcEvent) {
        match event {
            IpcEvent::Connected { conn, tx } => {
                self.conns.insert(conn, tx);
            }
            IpcEvent::Disconnected { conn } => self.cleanup_conn(conn).await,
            IpcEvent::Request { conn, msg } => self.handle_ipc_request(conn, msg).await,
        }
    }

    async fn handle_ipc_request(&mut self, conn: ConnId, msg: IpcMessage) {
        match msg {
            IpcMessage::RegisterServer {
                correlation,
                service,
                instance_id,
                endpoint,
                ttl,
                offer_period_ms,
            } => {
                self.on_register_server(
                    conn,
                    correlation,
                    service,
                    instance_id,
                    endpoint,
                    ttl,
                    offer_period_ms,
                )
                .await;
            }
            IpcMessage::RegisterClient {
                correlation,
                service,
                instance_id,
                local_endpoint,
            } => {
                self.on_register_client(conn, correlation, service, instance_id, local_endpoint)
                    .await;
            }
            IpcMessage::StartOffer {
                correlation,
                handle,
            } => {
                let Some(key) = self.owned_server(conn, handle) else {
                    self.send_ack(conn, correlation, ACK_UNKNOWN_HANDLE, handle).await;
                    return;
                };
                let actions = self.engine.start_offer(&mut self.registry, &key, Instant::now());
                self.execute_actions(actions).await;
                self.send_ack(conn, correlation, ACK_OK, handle).await;
            }
            IpcMessage::StopOffer {
                correlation,
                handle,
            } => {
                let Some(key) = self.owned_server(conn, handle) else {
                    self.send_ack(conn, correlation, ACK_UNKNOWN_HANDLE, handle).await;
                    return;
                };
                let actions = self.engine.stop_offer(&mut self.registry, &key, Instant::now());
                self.execute_actions(actions).await;
                self.send_ack(conn, correlation, ACK_OK, handle).await;
            }
            IpcMessage::Subscribe {
                correlation,
                handle,
                eventgroup,
                ttl,
            } => {
                let Some(key) = self.owned_client(conn, handle) else {
                    self.send_ack(conn, correlation, ACK_UNKNOWN_HANDLE, handle).await;
                    return;
                };
                let known = self
                    .registry
                    .client(&key)
                    .is_some_and(|c| c.service.eventgroup(eventgroup).is_some());
                if !known {
                    self.send_ack(conn, correlation, ACK_INVALID, handle).await;
                    return;
                }
                let actions =
                    self.engine
                        .subscribe(&mut self.registry, &key, eventgroup, ttl, Instant::now());
                self.execute_actions(actions).await;
                self.ensure_client_link(key);
                self.send_ack(conn, correlation, ACK_OK, handle).await;
            }
            IpcMessage::Unsubscribe {
                correlation,
                handle,
                eventgroup,
            } => {
                let Some(key) = self.owned_client(conn, handle) else {
                    self.send_ack(conn, correlation, ACK_UNKNOWN_HANDLE, handle).await;
                    return;
                };
                let actions =
                    self.engine
                        .unsubscribe(&mut self.registry, &key, eventgroup, Instant::now());
                self.execute_actions(actions).await;
                self.send_ack(conn, correlation, ACK_OK, handle).await;
            }
            IpcMessage::SendEvent {
                correlation,
                handle,
                eventgroup,
                event,
                payload,
            } => {
                self.on_send_event(conn, correlation, handle, eventgroup, event, payload)
                    .await;
            }
            IpcMessage::CallMethod {
                correlation,
                handle,
                method,
                timeout_ms,
                payload,
            } => {
                self.on_call_method(conn, correlation, handle, method, timeout_ms, payload)
                    .await;
            }
            IpcMessage::ReplyRequest {
                correlation,
                message_type,
                return_code,
                payload,
            } => {
                self.on_reply_request(conn, correlation, message_type, return_code, payload)
                    .await;
            }
            // Daemon-originated kinds arriving from an app are dropped.
            other => {
                debug!(%conn, correlation = other.correlation(), "ignoring unexpected IPC kind");
            }
        }
    }

    fn owned_server(&self, conn: ConnId, handle: u32) -> Option<ServerKey> {
        let key = *self.server_handles.get(&handle)?;
        (self.registry.server(&key)?.owner == conn).then_some(key)
    }

    fn owned_client(&self, conn: ConnId, handle: u32) -> Option<ClientKey> {
        let key = *self.client_handles.get(&handle)?;
        (self.registry.client(&key)?.owner == conn).then_some(key)
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_register_server(
        &mut self,
        conn: ConnId,
        correlation: u32,
        service: Service,
        instance_id: InstanceId,
        endpoint: Endpoint,
        ttl: u32,
        offer_period_ms: u32,
    ) {
        let service = Arc::new(service);
        let instance = ServerInstance::new(
            Arc::clone(&service),
            instance_id,
            endpoint,
            ttl,
            Duration::from_millis(offer_period_ms as u64),
            conn,
        );
        let key = match self.registry.insert_server(instance) {
            Ok(key) => key,
            Err(_) => {
                self.send_ack(conn, correlation, ACK_DUPLICATE, 0).await;
                return;
            }
        };

        let owner = SocketOwner::Server(key);
        let bind_result = match endpoint.protocol {
            TransportProtocol::Udp => match UdpEndpoint::bind(endpoint.addr).await {
                Ok(udp) => {
                    let task = udp.spawn_reader(owner, self.net_tx.clone());
                    self.udp_endpoints.insert(owner, udp);
                    self.tasks.entry(owner).or_default().push(task);
                    Ok(())
                }
                Err(err) => Err(err),
            },
            TransportProtocol::Tcp => match tcp::bind_listener(endpoint.addr).await {
                Ok(listener) => {
                    let task = tcp::spawn_listener(listener, owner, self.net_tx.clone());
                    self.tasks.entry(owner).or_default().push(task);
                    Ok(())
                }
                Err(err) => Err(err),
            },
        };
        if let Err(err) = bind_result {
            warn!(%err, %endpoint, "server endpoint bind failed");
            self.registry.remove_server(&key);
            self.send_ack(conn, correlation, ACK_TRANSPORT, 0).await;
            return;
        }

        let handle = self.alloc_handle();
        self.server_handles.insert(handle, key);
        self.server_handle_of.insert(key, handle);
        info!(service = %key.0, instance = %key.1, %endpoint, "server instance registered");
        self.send_ack(conn, correlation, ACK_OK, handle).await;
    }

    async fn on_register_client(
        &mut self,
        conn: ConnId,
        correlation: u32,
        service: Service,
        instance_id: InstanceId,
        local_endpoint: SocketAddrV4,
    ) {
        let service = Arc::new(service);
        let key = match self
            .registry
            .insert_client(service, instance_id, local_endpoint, conn)
        {
            Ok(key) => key,
            Err(_) => {
                self.send_ack(conn, correlation, ACK_DUPLICATE, 0).await;
                return;
            }
        };

        let owner = SocketOwner::Client(key);
        match UdpEndpoint::bind(local_endpoint).await {
            Ok(udp) => {
                let task = udp.spawn_reader(owner, self.net_tx.clone());
                self.udp_endpoints.insert(owner, udp);
                self.tasks.entry(owner).or_default().push(task);
            }
            Err(err) => {
                warn!(%err, %local_endpoint, "client endpoint bind failed");
                self.registry.remove_client(&key);
                self.send_ack(conn, correlation, ACK_TRANSPORT, 0).await;
                return;
            }
        }

        let handle = self.alloc_handle();
        self.client_handles.insert(handle, key);
        self.client_handle_of.insert(key, handle);
        info!(service = %key.0, instance = %key.1, "client instance registered");
        self.send_ack(conn, correlation, ACK_OK, handle).await;
    }

    async fn on_send_event(
        &mut self,
        conn: ConnId,
        correlation: u32,
        handle: u32,
        eventgroup: EventgroupId,
        event: MethodId,
        payload: Bytes,
    ) {
        let Some(key) = self.owned_server(conn, handle) else {
            self.send_ack(conn, correlation, ACK_UNKNOWN_HANDLE, handle).await;
            return;
        };
        let now = Instant::now();

        let (service_id, major, session) = {
            let Some(server) = self.registry.server_mut(&key) else {
                self.send_ack(conn, correlation, ACK_UNKNOWN_HANDLE, handle).await;
                return;
            };
            let valid = server
                .service
                .eventgroup(eventgroup)
                .is_some_and(|events| events.contains(&event));
            if !valid {
                self.send_ack(conn, correlation, ACK_INVALID, handle).await;
                return;
            }
            (
                server.service.service_id,
                server.service.major_version,
                server.next_notification_session(),
            )
        };

        let msg = SomeIpMessage::notification(service_id, event)
            .session_id(session)
            .interface_version(major)
            .payload(payload)
            .build();

        let subscribers = self
            .registry
            .subscribers((key.0, key.1, eventgroup), key.2, now);
        for subscriber in subscribers {
            if !self
                .send_to_remote(SocketOwner::Server(key), subscriber, &msg)
                .await
            {
                debug!(%subscriber, "event delivery skipped, no path to subscriber");
            }
        }
        self.send_ack(conn, correlation, ACK_OK, handle).await;
    }

    async fn on_call_method(
        &mut self,
        conn: ConnId,
        correlation: u32,
        handle: u32,
        method: MethodId,
        timeout_ms: u32,
        payload: Bytes,
    ) {
        let Some(key) = self.owned_client(conn, handle) else {
            self.send_ack(conn, correlation, ACK_UNKNOWN_HANDLE, handle).await;
            return;
        };
        let now = Instant::now();

        let offer = self.registry.remote_offer(&key).cloned();
        let (client_id, major, known_method, available) = {
            let Some(client) = self.registry.client(&key) else {
                self.send_ack(conn, correlation, ACK_UNKNOWN_HANDLE, handle).await;
                return;
            };
            (
                client.client_id,
                client.service.major_version,
                client.service.has_method(method),
                client.available,
            )
        };

        if !known_method {
            self.send_ack(conn, correlation, ACK_INVALID, handle).await;
            return;
        }

        // NotAvailable: no live offer for the instance.
        let Some(offer) = offer.filter(|_| available) else {
            self.send_method_response(conn, correlation, MethodOutcome::unreachable())
                .await;
            return;
        };
        let Some(target) = offer.endpoints.primary else {
            self.send_method_response(conn, correlation, MethodOutcome::unreachable())
                .await;
            return;
        };

        if timeout_ms == 0 {
            let msg = SomeIpMessage::request_no_return(key.0, method)
                .client_id(client_id)
                .interface_version(major)
                .payload(payload)
                .build();
            self.send_to_remote(SocketOwner::Client(key), target, &msg).await;
            self.send_ack(conn, correlation, ACK_OK, handle).await;
            return;
        }

        // NotConnected: fail fast while the TCP link is not up.
        if target.protocol == TransportProtocol::Tcp {
            match self.tcp_links.get(&(SocketOwner::Client(key), target.addr)) {
                Some(TcpLink::Up(_)) => {}
                Some(TcpLink::Connecting) => {
                    self.send_method_response(conn, correlation, MethodOutcome::not_connected())
                        .await;
                    return;
                }
                None => {
                    self.ensure_client_link(key);
                    self.send_method_response(conn, correlation, MethodOutcome::not_connected())
                        .await;
                    return;
                }
            }
        }

        let deadline = now + Duration::from_millis(timeout_ms as u64);
        let session = {
            let Some(client) = self.registry.client_mut(&key) else {
                self.send_ack(conn, correlation, ACK_UNKNOWN_HANDLE, handle).await;
                return;
            };
            client
                .correlator
                .allocate(deadline, ResponseSink::Ipc { conn, correlation })
        };

        let msg = SomeIpMessage::request(key.0, method)
            .client_id(client_id)
            .session_id(session)
            .interface_version(major)
            .payload(payload)
            .build();

        if !self.send_to_remote(SocketOwner::Client(key), target, &msg).await {
            if let Some(client) = self.registry.client_mut(&key) {
                client.correlator.complete(session);
            }
            self.send_method_response(conn, correlation, MethodOutcome::not_connected())
                .await;
        }
    }

    async fn on_reply_request(
        &mut self,
        conn: ConnId,
        correlation: u32,
        message_type: MessageType,
        return_code: ReturnCode,
        payload: Bytes,
    ) {
        let Some(request) = self.request_table.take(correlation) else {
            self.counters.late_replies += 1;
            debug!(correlation, "reply for an expired or unknown request");
            return;
        };
        if request.app != conn {
            self.counters.late_replies += 1;
            return;
        }
        if !message_type.is_response() {
            debug!(correlation, "reply with non-response message type dropped");
            return;
        }

        let msg = MessageBuilder::new(request.server.0, request.method, message_type)
            .client_id(request.client_id)
            .session_id(request.session_id)
            .interface_version(request.interface_version)
            .return_code(return_code)
            .payload(payload)
            .build();
        self.send_to_remote(SocketOwner::Server(request.server), request.reply_to, &msg)
            .await;
    }

    async fn cleanup_conn(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
        self.request_table.drop_for_conn(conn);

        let (server_keys, client_keys) = self.registry.keys_owned_by(conn);
        let now = Instant::now();

        // Connection loss equals stop_offer on every owned server instance.
        for key in server_keys {
            let actions = self.engine.stop_offer(&mut self.registry, &key, now);
            self.execute_actions(actions).await;
            self.registry.remove_server(&key);
            self.remove_owner_resources(SocketOwner::Server(key));
            if let Some(handle) = self.server_handle_of.remove(&key) {
                self.server_handles.remove(&handle);
            }
        }

        // And unsubscribe plus cancellation on every owned client instance.
        for key in client_keys {
            let eventgroups: Vec<EventgroupId> = self
                .registry
                .client(&key)
                .map(|c| c.subscriptions.keys().copied().collect())
                .unwrap_or_default();
            for eventgroup in eventgroups {
                let actions = self.engine.unsubscribe(&mut self.registry, &key, eventgroup, now);
                self.execute_actions(actions).await;
            }
            if let Some(mut client) = self.registry.remove_client(&key) {
                // Sinks point at the dead connection; dropping them is the
                // best-effort cancellation the wire does not carry.
                client.correlator.drain();
            }
            self.remove_owner_resources(SocketOwner::Client(key));
            if let Some(handle) = self.client_handle_of.remove(&key) {
                self.client_handles.remove(&handle);
            }
        }

        info!(%conn, "application disconnected, instances cleaned up");
    }

    fn remove_owner_resources(&mut self, owner: SocketOwner) {
        if let Some(tasks) = self.tasks.remove(&owner) {
            for task in tasks {
                task.abort();
            }
        }
        self.udp_endpoints.remove(&owner);
        self.tcp_links.retain(|(o, _), _| *o != owner);
    }
}
