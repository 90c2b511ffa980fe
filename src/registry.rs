//! Instance registry: the in-memory directories of local offered instances,
//! remotely known instances and active subscriptions.
//!
//! Every mutation goes through the registry so the one-instance-per-slot
//! rule can be enforced at insertion, and so the single event-loop task is
//! the only mutator.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::correlator::Correlator;
use crate::error::{Result, SomeIpError};
use crate::header::{ClientId, ServiceId, SessionId};
use crate::ipc::ConnId;
use crate::sd::message::EndpointPair;
use crate::sd::option::Endpoint;
use crate::sd::types::{EventgroupId, InstanceId};
use crate::service::Service;
use crate::types::TransportProtocol;

/// Key of a local server instance.
pub type ServerKey = (ServiceId, InstanceId, TransportProtocol);

/// Key of a local client instance.
pub type ClientKey = (ServiceId, InstanceId);

/// Offer lifecycle of a local server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferState {
    /// Registered but silent.
    Down,
    /// Cyclically announced via SD.
    Offering,
}

/// A service instance offered by a local application.
#[derive(Debug)]
pub struct ServerInstance {
    /// Service schema.
    pub service: Arc<Service>,
    /// Instance ID.
    pub instance_id: InstanceId,
    /// Endpoint the instance serves on.
    pub endpoint: Endpoint,
    /// Offer TTL in seconds.
    pub ttl: u32,
    /// Cyclic offer period.
    pub offer_period: Duration,
    /// Offer lifecycle state.
    pub state: OfferState,
    /// Next scheduled cyclic offer, while Offering.
    pub next_offer_at: Option<Instant>,
    /// Owning IPC connection.
    pub owner: ConnId,
    notification_session: u16,
}

impl ServerInstance {
    /// Create a registered-but-silent instance.
    pub fn new(
        service: Arc<Service>,
        instance_id: InstanceId,
        endpoint: Endpoint,
        ttl: u32,
        offer_period: Duration,
        owner: ConnId,
    ) -> Self {
        Self {
            service,
            instance_id,
            endpoint,
            ttl,
            offer_period,
            state: OfferState::Down,
            next_offer_at: None,
            owner,
            notification_session: 0,
        }
    }

    /// Registry key of this instance.
    pub fn key(&self) -> ServerKey {
        (self.service.service_id, self.instance_id, self.endpoint.protocol)
    }

    /// Next session id for an outgoing notification (wraps, skips 0).
    pub fn next_notification_session(&mut self) -> SessionId {
        self.notification_session = self.notification_session.wrapping_add(1);
        if self.notification_session == 0 {
            self.notification_session = 1;
        }
        SessionId(self.notification_session)
    }
}

/// Client-side subscription state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribePhase {
    /// Waiting for a matching remote offer.
    PendingOffer,
    /// Subscribe sent, waiting for the Ack.
    Subscribing {
        /// When the response timer fires.
        deadline: Instant,
        /// Consecutive attempts without an Ack.
        attempts: u32,
    },
    /// Acknowledged by the remote server.
    Subscribed {
        /// When the subscription is re-sent to stay alive.
        refresh_at: Instant,
    },
    /// Nacked or timed out; waiting out a linear backoff.
    Backoff {
        /// End of the backoff window.
        until: Instant,
        /// Consecutive failed attempts.
        attempts: u32,
    },
}

/// A client-side eventgroup subscription.
#[derive(Debug, Clone, Copy)]
pub struct ClientSubscription {
    /// Requested TTL in seconds.
    pub ttl: u32,
    /// State machine phase.
    pub phase: SubscribePhase,
}

/// A local application's client of a remote service.
#[derive(Debug)]
pub struct ClientInstance {
    /// Service schema.
    pub service: Arc<Service>,
    /// Instance ID.
    pub instance_id: InstanceId,
    /// Local endpoint events are delivered to.
    pub local_endpoint: SocketAddrV4,
    /// Allocated client id for outgoing requests.
    pub client_id: ClientId,
    /// Owning IPC connection.
    pub owner: ConnId,
    /// Cached availability (edge-triggered notifications).
    pub available: bool,
    /// Subscriptions by eventgroup.
    pub subscriptions: HashMap<EventgroupId, ClientSubscription>,
    /// Outstanding method calls.
    pub correlator: Correlator,
}

impl ClientInstance {
    /// Registry key of this instance.
    pub fn key(&self) -> ClientKey {
        (self.service.service_id, self.instance_id)
    }
}

/// A remote offer observed via SD.
#[derive(Debug, Clone)]
pub struct RemoteOffer {
    /// Service ID.
    pub service_id: ServiceId,
    /// Instance ID.
    pub instance_id: InstanceId,
    /// Major version of the offer.
    pub major_version: u8,
    /// Minor version of the offer (advisory).
    pub minor_version: u32,
    /// Data-plane endpoints from the offer's option runs.
    pub endpoints: EndpointPair,
    /// SD source address, target for unicast subscribe entries.
    pub sd_addr: SocketAddrV4,
    /// When the offer was received.
    pub received_at: Instant,
    /// Offer TTL in seconds.
    pub ttl: u32,
    /// Eviction time (received_at + ttl).
    pub expires_at: Instant,
}

/// A server-side subscription record.
#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    /// Subscriber's data-plane endpoint.
    pub endpoint: Endpoint,
    /// Eviction time; refreshed on every matching Subscribe.
    pub expires_at: Instant,
}

/// Key of the server-side subscription directory.
pub type SubscriptionKey = (ServiceId, InstanceId, EventgroupId);

/// The in-memory instance directories.
#[derive(Debug, Default)]
pub struct Registry {
    servers: HashMap<ServerKey, ServerInstance>,
    clients: HashMap<ClientKey, ClientInstance>,
    remote_offers: HashMap<ClientKey, RemoteOffer>,
    server_subs: HashMap<SubscriptionKey, Vec<Subscription>>,
    next_client_id: u16,
}

impl Registry {
    /// Create empty directories.
    pub fn new() -> Self {
        Self::default()
    }

    // --- local servers ---

    /// Insert a server instance; rejects a second instance in the same
    /// (service, instance, transport) slot.
    pub fn insert_server(&mut self, instance: ServerInstance) -> Result<ServerKey> {
        let key = instance.key();
        if self.servers.contains_key(&key) {
            return Err(SomeIpError::DuplicateInstance {
                service: key.0,
                instance: key.1,
            });
        }
        self.servers.insert(key, instance);
        Ok(key)
    }

    /// Look up a server instance.
    pub fn server(&self, key: &ServerKey) -> Option<&ServerInstance> {
        self.servers.get(key)
    }

    /// Look up a server instance mutably.
    pub fn server_mut(&mut self, key: &ServerKey) -> Option<&mut ServerInstance> {
        self.servers.get_mut(key)
    }

    /// Remove a server instance together with the subscriptions bound to its
    /// transport.
    pub fn remove_server(&mut self, key: &ServerKey) -> Option<ServerInstance> {
        let instance = self.servers.remove(key)?;
        let (service_id, instance_id, transport) = *key;
        for (sub_key, subs) in self.server_subs.iter_mut() {
            if sub_key.0 == service_id && sub_key.1 == instance_id {
                subs.retain(|s| s.endpoint.protocol != transport);
            }
        }
        self.server_subs.retain(|_, subs| !subs.is_empty());
        Some(instance)
    }

    /// Iterate over all server instances.
    pub fn servers(&self) -> impl Iterator<Item = &ServerInstance> {
        self.servers.values()
    }

    /// Iterate mutably over all server instances.
    pub fn servers_mut(&mut self) -> impl Iterator<Item = &mut ServerInstance> {
        self.servers.values_mut()
    }

    // --- local clients ---

    /// Insert a client instance, allocating its client id.
    pub fn insert_client(
        &mut self,
        service: Arc<Service>,
        instance_id: InstanceId,
        local_endpoint: SocketAddrV4,
        owner: ConnId,
    ) -> Result<ClientKey> {
        let key = (service.service_id, instance_id);
        if self.clients.contains_key(&key) {
            return Err(SomeIpError::DuplicateInstance {
                service: key.0,
                instance: key.1,
            });
        }
        let client_id = self.allocate_client_id();
        self.clients.insert(
            key,
            ClientInstance {
                service,
                instance_id,
                local_endpoint,
                client_id,
                owner,
                available: false,
                subscriptions: HashMap::new(),
                correlator: Correlator::new(),
            },
        );
        Ok(key)
    }

    fn allocate_client_id(&mut self) -> ClientId {
        loop {
            self.next_client_id = self.next_client_id.wrapping_add(1);
            if self.next_client_id == 0 {
                continue;
            }
            let candidate = ClientId(self.next_client_id);
            if !self.clients.values().any(|c| c.client_id == candidate) {
                return candidate;
            }
        }
    }

    /// Look up a client instance.
    pub fn client(&self, key: &ClientKey) -> Option<&ClientInstance> {
        self.clients.get(key)
    }

    /// Look up a client instance mutably.
    pub fn client_mut(&mut self, key: &ClientKey) -> Option<&mut ClientInstance> {
        self.clients.get_mut(key)
    }

    /// Remove a client instance.
    pub fn remove_client(&mut self, key: &ClientKey) -> Option<ClientInstance> {
        self.clients.remove(key)
    }

    /// Iterate over all client instances.
    pub fn clients(&self) -> impl Iterator<Item = &ClientInstance> {
        self.clients.values()
    }

    /// Iterate mutably over all client instances.
    pub fn clients_mut(&mut self) -> impl Iterator<Item = &mut ClientInstance> {
        self.clients.values_mut()
    }

    // --- remote offers ---

    /// Insert or refresh a remote offer.
    pub fn upsert_remote_offer(&mut self, offer: RemoteOffer) {
        self.remote_offers
            .insert((offer.service_id, offer.instance_id), offer);
    }

    /// Look up a remote offer.
    pub fn remote_offer(&self, key: &ClientKey) -> Option<&RemoteOffer> {
        self.remote_offers.get(key)
    }

    /// Remove a remote offer.
    pub fn remove_remote_offer(&mut self, key: &ClientKey) -> Option<RemoteOffer> {
        self.remote_offers.remove(key)
    }

    /// Keys of remote offers whose TTL has elapsed.
    pub fn expired_remote_offers(&self, now: Instant) -> Vec<ClientKey> {
        self.remote_offers
            .iter()
            .filter(|(_, offer)| now >= offer.expires_at)
            .map(|(key, _)| *key)
            .collect()
    }

    // --- server-side subscriptions ---

    /// Insert or refresh a subscription; returns true when the subscriber is
    /// new.
    pub fn upsert_subscription(
        &mut self,
        key: SubscriptionKey,
        endpoint: Endpoint,
        ttl: u32,
        now: Instant,
    ) -> bool {
        let subs = self.server_subs.entry(key).or_default();
        let expires_at = now + Duration::from_secs(ttl as u64);
        if let Some(existing) = subs.iter_mut().find(|s| s.endpoint == endpoint) {
            existing.expires_at = expires_at;
            false
        } else {
            subs.push(Subscription {
                endpoint,
                expires_at,
            });
            true
        }
    }

    /// Remove a subscription; returns true when it existed.
    pub fn remove_subscription(&mut self, key: SubscriptionKey, endpoint: Endpoint) -> bool {
        let Some(subs) = self.server_subs.get_mut(&key) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.endpoint != endpoint);
        let removed = subs.len() != before;
        if subs.is_empty() {
            self.server_subs.remove(&key);
        }
        removed
    }

    /// Live subscriber endpoints of an eventgroup, restricted to the given
    /// transport.
    pub fn subscribers(
        &self,
        key: SubscriptionKey,
        transport: TransportProtocol,
        now: Instant,
    ) -> Vec<Endpoint> {
        self.server_subs
            .get(&key)
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.endpoint.protocol == transport && now < s.expires_at)
                    .map(|s| s.endpoint)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Evict expired subscriptions, returning what was removed.
    pub fn sweep_subscriptions(&mut self, now: Instant) -> Vec<(SubscriptionKey, Endpoint)> {
        let mut removed = Vec::new();
        for (key, subs) in self.server_subs.iter_mut() {
            subs.retain(|s| {
                if now >= s.expires_at {
                    removed.push((*key, s.endpoint));
                    false
                } else {
                    true
                }
            });
        }
        self.server_subs.retain(|_, subs| !subs.is_empty());
        removed
    }

    /// Drop every subscription bound to a TCP peer that went away.
    pub fn drop_subscriptions_for_peer(
        &mut self,
        peer: SocketAddrV4,
    ) -> Vec<(SubscriptionKey, Endpoint)> {
        let mut removed = Vec::new();
        for (key, subs) in self.server_subs.iter_mut() {
            subs.retain(|s| {
                if s.endpoint.protocol == TransportProtocol::Tcp && s.endpoint.addr == peer {
                    removed.push((*key, s.endpoint));
                    false
                } else {
                    true
                }
            });
        }
        self.server_subs.retain(|_, subs| !subs.is_empty());
        removed
    }

    // --- ownership ---

    /// Keys of every instance owned by the given IPC connection.
    pub fn keys_owned_by(&self, conn: ConnId) -> (Vec<ServerKey>, Vec<ClientKey>) {
        let servers = self
            .servers
            .values()
            .filter(|s| s.owner == conn)
            .map(|s| s.key())
            .collect();
        let clients = self
            .clients
            .values()
            .filter(|c| c.owner == conn)
            .map(|c| c.key())
            .collect();
        (servers, clients)
    }
}
