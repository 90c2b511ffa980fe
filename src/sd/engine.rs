//! The SD state machines: cyclic offers, the subscribe handshake, remote
//! offer tracking and TTL expiry.
//!
//! The engine performs no I/O. The daemon loop feeds it received SD frames
//! and clock ticks; it mutates the registry and returns [`SdAction`]s for
//! the daemon to execute. This keeps every transition reproducible in tests
//! with a synthetic clock.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::header::ServiceId;
use crate::registry::{
    ClientKey, ClientSubscription, OfferState, Registry, RemoteOffer, ServerKey, SubscribePhase,
};
use crate::types::TransportProtocol;

use super::entry::{EventgroupEntry, SdEntry, ServiceEntry};
use super::message::{EndpointPair, SdFlags, SdMessage, SdMessageBuilder};
use super::option::Endpoint;
use super::types::{EntryType, EventgroupId, InstanceId};

/// Tunable SD timing parameters.
#[derive(Debug, Clone)]
pub struct SdTimings {
    /// How long to wait for a Subscribe-Ack before backing off.
    pub response_timeout: Duration,
    /// Linear backoff increment after a Nack or response timeout.
    pub backoff_step: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// TTL-expiry granularity; the daemon never sleeps longer than this.
    pub tick: Duration,
    /// Offers due within this window of each other share one SD message.
    pub pack_tolerance: Duration,
}

impl Default for SdTimings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(300),
            backoff_step: Duration::from_millis(200),
            backoff_max: Duration::from_secs(2),
            tick: Duration::from_millis(100),
            pack_tolerance: Duration::from_millis(20),
        }
    }
}

/// Drop counters kept by the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SdCounters {
    /// Malformed SD frames dropped.
    pub decode_errors: u64,
    /// Well-formed but logically impossible entries dropped.
    pub protocol_violations: u64,
}

/// I/O and notification work the daemon must carry out for the engine.
#[derive(Debug)]
pub enum SdAction {
    /// Send an SD message to the multicast group.
    SendMulticast(SdMessage),
    /// Send an SD message to a specific SD endpoint.
    SendUnicast(SdMessage, SocketAddrV4),
    /// A local client's availability view changed.
    Availability {
        /// Client instance affected.
        client: ClientKey,
        /// New availability.
        available: bool,
    },
    /// A new remote subscriber joined an eventgroup of a local server.
    SubscriberAdded {
        /// Server instance affected.
        server: ServerKey,
        /// Eventgroup subscribed to.
        eventgroup: EventgroupId,
        /// Subscriber's data-plane endpoint.
        subscriber: Endpoint,
    },
    /// A remote subscriber left (stop-subscribe or TTL expiry).
    SubscriberRemoved {
        /// Server instance affected.
        server: ServerKey,
        /// Eventgroup unsubscribed from.
        eventgroup: EventgroupId,
        /// Subscriber's data-plane endpoint.
        subscriber: Endpoint,
    },
}

/// The SD protocol engine.
#[derive(Debug)]
pub struct SdEngine {
    timings: SdTimings,
    reboot_pending: bool,
    /// Drop counters.
    pub counters: SdCounters,
}

impl SdEngine {
    /// Create an engine; the first outgoing message will carry the reboot
    /// flag.
    pub fn new(timings: SdTimings) -> Self {
        Self {
            timings,
            reboot_pending: true,
            counters: SdCounters::default(),
        }
    }

    /// Flags for the next outgoing message; clears the reboot flag.
    fn take_flags(&mut self) -> SdFlags {
        let flags = SdFlags {
            reboot: self.reboot_pending,
            unicast: true,
        };
        self.reboot_pending = false;
        flags
    }

    fn backoff(&self, attempts: u32) -> Duration {
        (self.timings.backoff_step * (attempts + 1)).min(self.timings.backoff_max)
    }

    fn refresh_period(&self, sub_ttl: u32, offer_ttl: u32) -> Duration {
        Duration::from_secs(sub_ttl.min(offer_ttl / 2).max(1) as u64)
    }

    // --- operations driven by the application ---

    /// Move a server instance into Offering: emit the first offer now and
    /// schedule the cycle.
    pub fn start_offer(&mut self, reg: &mut Registry, key: &ServerKey, now: Instant) -> Vec<SdAction> {
        let Some(server) = reg.server_mut(key) else {
            return Vec::new();
        };
        if server.state == OfferState::Offering {
            return Vec::new();
        }
        server.state = OfferState::Offering;
        server.next_offer_at = Some(now + server.offer_period);

        if Duration::from_secs(server.ttl as u64) < server.offer_period {
            // Subscriptions renewed per cycle will briefly expire between
            // offers; user-visible misconfiguration, not an error.
            warn!(
                service = %server.service.service_id,
                instance = %server.instance_id,
                ttl = server.ttl,
                period_ms = server.offer_period.as_millis() as u64,
                "offer TTL shorter than cyclic offer period; subscriptions may flap"
            );
        }

        let (service_id, instance_id, major, minor, ttl, endpoint) = (
            server.service.service_id,
            server.instance_id,
            server.service.major_version,
            server.service.minor_version,
            server.ttl,
            server.endpoint,
        );
        let mut builder = SdMessageBuilder::new(self.take_flags());
        builder.offer(
            service_id,
            instance_id,
            major,
            minor,
            ttl,
            &EndpointPair::single(endpoint),
        );
        vec![SdAction::SendMulticast(builder.build())]
    }

    /// Leave Offering: cancel the cycle and emit one Stop-Offer immediately.
    pub fn stop_offer(&mut self, reg: &mut Registry, key: &ServerKey, _now: Instant) -> Vec<SdAction> {
        let Some(server) = reg.server_mut(key) else {
            return Vec::new();
        };
        if server.state != OfferState::Offering {
            return Vec::new();
        }
        server.state = OfferState::Down;
        server.next_offer_at = None;

        let (service_id, instance_id, major, minor) = (
            server.service.service_id,
            server.instance_id,
            server.service.major_version,
            server.service.minor_version,
        );
        let mut builder = SdMessageBuilder::new(self.take_flags());
        builder.stop_offer(service_id, instance_id, major, minor);
        vec![SdAction::SendMulticast(builder.build())]
    }

    /// Request a subscription: enters PendingOffer, or sends the Subscribe
    /// right away when the offer is already known.
    pub fn subscribe(
        &mut self,
        reg: &mut Registry,
        key: &ClientKey,
        eventgroup: EventgroupId,
        ttl: u32,
        now: Instant,
    ) -> Vec<SdAction> {
        let offer = reg.remote_offer(key).cloned();
        let Some(client) = reg.client_mut(key) else {
            return Vec::new();
        };

        let sub = client
            .subscriptions
            .entry(eventgroup)
            .or_insert(ClientSubscription {
                ttl,
                phase: SubscribePhase::PendingOffer,
            });
        sub.ttl = ttl;

        let Some(offer) = offer else {
            return Vec::new();
        };
        if !matches!(sub.phase, SubscribePhase::PendingOffer) {
            return Vec::new();
        }

        sub.phase = SubscribePhase::Subscribing {
            deadline: now + self.timings.response_timeout,
            attempts: 0,
        };

        let transport = offer
            .endpoints
            .primary
            .map(|ep| ep.protocol)
            .unwrap_or(TransportProtocol::Udp);
        let (major, local_addr) = (client.service.major_version, client.local_endpoint);
        let mut builder = SdMessageBuilder::new(self.take_flags());
        builder.subscribe(
            key.0,
            key.1,
            major,
            eventgroup,
            ttl,
            Endpoint {
                addr: local_addr,
                protocol: transport,
            },
        );
        vec![SdAction::SendUnicast(builder.build(), offer.sd_addr)]
    }

    /// Drop a subscription, sending Stop-Subscribe when it was announced.
    pub fn unsubscribe(
        &mut self,
        reg: &mut Registry,
        key: &ClientKey,
        eventgroup: EventgroupId,
        _now: Instant,
    ) -> Vec<SdAction> {
        let offer = reg.remote_offer(key).cloned();
        let Some(client) = reg.client_mut(key) else {
            return Vec::new();
        };
        let Some(sub) = client.subscriptions.remove(&eventgroup) else {
            return Vec::new();
        };
        let major = client.service.major_version;

        let announced = matches!(
            sub.phase,
            SubscribePhase::Subscribing { .. } | SubscribePhase::Subscribed { .. }
        );
        match (offer, announced) {
            (Some(offer), true) => {
                let mut builder = SdMessageBuilder::new(self.take_flags());
                builder.stop_subscribe(key.0, key.1, major, eventgroup);
                vec![SdAction::SendUnicast(builder.build(), offer.sd_addr)]
            }
            _ => Vec::new(),
        }
    }

    // --- received SD traffic ---

    /// Process one received SD datagram.
    pub fn handle_frame(
        &mut self,
        reg: &mut Registry,
        data: &[u8],
        from: SocketAddrV4,
        now: Instant,
    ) -> Vec<SdAction> {
        let msg = match SdMessage::from_frame(data) {
            Ok(msg) => msg,
            Err(err) => {
                self.counters.decode_errors += 1;
                debug!(%from, %err, "dropping malformed SD frame");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        for entry in &msg.entries {
            let endpoints = match msg.resolve_endpoints(entry) {
                Ok(endpoints) => endpoints,
                Err(err) => {
                    self.counters.decode_errors += 1;
                    debug!(%from, %err, "dropping SD entry with bad option runs");
                    continue;
                }
            };

            match entry {
                SdEntry::Service(se) => match se.entry_type {
                    EntryType::FindService => self.on_find(reg, se, from, &mut actions),
                    EntryType::OfferService if se.ttl > 0 => {
                        self.on_offer(reg, se, endpoints, from, now, &mut actions)
                    }
                    EntryType::OfferService => {
                        self.drop_remote_offer(reg, (se.service_id, se.instance_id), &mut actions)
                    }
                    _ => {}
                },
                SdEntry::Eventgroup(ee) => match ee.entry_type {
                    EntryType::SubscribeEventgroup if ee.ttl > 0 => {
                        self.on_subscribe(reg, ee, endpoints, from, now, &mut actions)
                    }
                    EntryType::SubscribeEventgroup => {
                        self.on_stop_subscribe(reg, ee, endpoints, &mut actions)
                    }
                    EntryType::SubscribeEventgroupAck if ee.ttl > 0 => {
                        self.on_subscribe_ack(reg, ee, now)
                    }
                    EntryType::SubscribeEventgroupAck => self.on_subscribe_nack(reg, ee, now),
                    _ => {}
                },
            }
        }
        actions
    }

    fn on_find(
        &mut self,
        reg: &mut Registry,
        entry: &ServiceEntry,
        from: SocketAddrV4,
        actions: &mut Vec<SdAction>,
    ) {
        struct Match {
            service_id: ServiceId,
            instance_id: InstanceId,
            major: u8,
            minor: u32,
            ttl: u32,
            endpoint: Endpoint,
        }
        let matches: Vec<Match> = reg
            .servers()
            .filter(|s| {
                s.state == OfferState::Offering
                    && s.service.service_id == entry.service_id
                    && (entry.instance_id.is_any() || s.instance_id == entry.instance_id)
            })
            .map(|s| Match {
                service_id: s.service.service_id,
                instance_id: s.instance_id,
                major: s.service.major_version,
                minor: s.service.minor_version,
                ttl: s.ttl,
                endpoint: s.endpoint,
            })
            .collect();
        if matches.is_empty() {
            return;
        }

        let mut builder = SdMessageBuilder::new(self.take_flags());
        for m in matches {
            builder.offer(
                m.service_id,
                m.instance_id,
                m.major,
                m.minor,
                m.ttl,
                &EndpointPair::single(m.endpoint),
            );
        }
        actions.push(SdAction::SendUnicast(builder.build(), from));
    }

    fn on_offer(
        &mut self,
        reg: &mut Registry,
        entry: &ServiceEntry,
        endpoints: EndpointPair,
        from: SocketAddrV4,
        now: Instant,
        actions: &mut Vec<SdAction>,
    ) {
        let key = (entry.service_id, entry.instance_id);
        let offer = RemoteOffer {
            service_id: entry.service_id,
            instance_id: entry.instance_id,
            major_version: entry.major_version,
            minor_version: entry.minor_version,
            endpoints,
            sd_addr: from,
            received_at: now,
            ttl: entry.ttl,
            expires_at: now + Duration::from_secs(entry.ttl as u64),
        };
        reg.upsert_remote_offer(offer.clone());

        let response_timeout = self.timings.response_timeout;
        let Some(client) = reg.client_mut(&key) else {
            return;
        };
        // Minor is advisory; availability requires a matching major.
        if client.service.major_version != entry.major_version {
            return;
        }

        if !client.available {
            client.available = true;
            actions.push(SdAction::Availability {
                client: key,
                available: true,
            });
        }

        let transport = offer
            .endpoints
            .primary
            .map(|ep| ep.protocol)
            .unwrap_or(TransportProtocol::Udp);
        let local = Endpoint {
            addr: client.local_endpoint,
            protocol: transport,
        };
        let major = client.service.major_version;

        let mut to_subscribe: Vec<(EventgroupId, u32)> = Vec::new();
        for (eventgroup, sub) in client.subscriptions.iter_mut() {
            if matches!(sub.phase, SubscribePhase::PendingOffer) {
                to_subscribe.push((*eventgroup, sub.ttl));
                sub.phase = SubscribePhase::Subscribing {
                    deadline: now + response_timeout,
                    attempts: 0,
                };
            }
        }
        if !to_subscribe.is_empty() {
            let mut builder = SdMessageBuilder::new(self.take_flags());
            for (eventgroup, ttl) in to_subscribe {
                builder.subscribe(key.0, key.1, major, eventgroup, ttl, local);
            }
            actions.push(SdAction::SendUnicast(builder.build(), offer.sd_addr));
        }
    }

    fn drop_remote_offer(&mut self, reg: &mut Registry, key: ClientKey, actions: &mut Vec<SdAction>) {
        if reg.remove_remote_offer(&key).is_none() {
            return;
        }
        let Some(client) = reg.client_mut(&key) else {
            return;
        };
        if client.available {
            client.available = false;
            actions.push(SdAction::Availability {
                client: key,
                available: false,
            });
        }
        // Tear down without network traffic; a re-offer resubscribes.
        for sub in client.subscriptions.values_mut() {
            sub.phase = SubscribePhase::PendingOffer;
        }
    }

    fn on_subscribe(
        &mut self,
        reg: &mut Registry,
        entry: &EventgroupEntry,
        endpoints: EndpointPair,
        from: SocketAddrV4,
        now: Instant,
        actions: &mut Vec<SdAction>,
    ) {
        let Some(subscriber) = endpoints.primary else {
            self.counters.protocol_violations += 1;
            debug!(%from, "subscribe entry without an endpoint option");
            return;
        };
        let flags = self.take_flags();

        let server_key = (entry.service_id, entry.instance_id, subscriber.protocol);
        let accepted = reg.server(&server_key).and_then(|server| {
            (server.service.major_version == entry.major_version
                && server.service.eventgroup(entry.eventgroup_id).is_some())
            .then_some(server.endpoint)
        });

        let mut builder = SdMessageBuilder::new(flags);
        match accepted {
            Some(server_endpoint) => {
                let added = reg.upsert_subscription(
                    (entry.service_id, entry.instance_id, entry.eventgroup_id),
                    subscriber,
                    entry.ttl,
                    now,
                );
                builder.subscribe_ack(
                    entry.service_id,
                    entry.instance_id,
                    entry.major_version,
                    entry.eventgroup_id,
                    entry.ttl,
                    entry.counter,
                    Some(server_endpoint),
                );
                actions.push(SdAction::SendUnicast(builder.build(), from));
                if added {
                    actions.push(SdAction::SubscriberAdded {
                        server: server_key,
                        eventgroup: entry.eventgroup_id,
                        subscriber,
                    });
                }
            }
            None => {
                builder.subscribe_nack(
                    entry.service_id,
                    entry.instance_id,
                    entry.major_version,
                    entry.eventgroup_id,
                    entry.counter,
                );
                actions.push(SdAction::SendUnicast(builder.build(), from));
            }
        }
    }

    fn on_stop_subscribe(
        &mut self,
        reg: &mut Registry,
        entry: &EventgroupEntry,
        endpoints: EndpointPair,
        actions: &mut Vec<SdAction>,
    ) {
        let Some(subscriber) = endpoints.primary else {
            self.counters.protocol_violations += 1;
            return;
        };
        let key = (entry.service_id, entry.instance_id, entry.eventgroup_id);
        if reg.remove_subscription(key, subscriber) {
            actions.push(SdAction::SubscriberRemoved {
                server: (entry.service_id, entry.instance_id, subscriber.protocol),
                eventgroup: entry.eventgroup_id,
                subscriber,
            });
        }
    }

    fn on_subscribe_ack(&mut self, reg: &mut Registry, entry: &EventgroupEntry, now: Instant) {
        let key = (entry.service_id, entry.instance_id);
        let offer_ttl = reg.remote_offer(&key).map(|o| o.ttl);
        let refresh = |sub_ttl: u32| {
            self.refresh_period(sub_ttl, offer_ttl.unwrap_or(sub_ttl.max(1)))
        };

        let known = reg
            .client_mut(&key)
            .and_then(|client| client.subscriptions.get_mut(&entry.eventgroup_id))
            .map(|sub| {
                sub.phase = SubscribePhase::Subscribed {
                    refresh_at: now + refresh(sub.ttl),
                };
            })
            .is_some();
        if !known {
            self.counters.protocol_violations += 1;
            debug!(
                service = %entry.service_id,
                eventgroup = %entry.eventgroup_id,
                "subscribe-ack for unknown subscription"
            );
        }
    }

    fn on_subscribe_nack(&mut self, reg: &mut Registry, entry: &EventgroupEntry, now: Instant) {
        let key = (entry.service_id, entry.instance_id);
        let backoff = |attempts: u32| self.backoff(attempts);
        let known = reg
            .client_mut(&key)
            .and_then(|client| client.subscriptions.get_mut(&entry.eventgroup_id))
            .map(|sub| {
                let attempts = match sub.phase {
                    SubscribePhase::Subscribing { attempts, .. } => attempts,
                    SubscribePhase::Backoff { attempts, .. } => attempts,
                    _ => 0,
                };
                sub.phase = SubscribePhase::Backoff {
                    until: now + backoff(attempts),
                    attempts: attempts + 1,
                };
            })
            .is_some();
        if !known {
            self.counters.protocol_violations += 1;
        }
    }

    // --- timer-driven work ---

    /// Run every due timer: TTL sweeps, subscribe retries/refreshes and the
    /// cyclic offer pack.
    pub fn poll(&mut self, reg: &mut Registry, now: Instant) -> Vec<SdAction> {
        let mut actions = Vec::new();

        for key in reg.expired_remote_offers(now) {
            self.drop_remote_offer(reg, key, &mut actions);
        }

        for ((service_id, instance_id, eventgroup), endpoint) in reg.sweep_subscriptions(now) {
            actions.push(SdAction::SubscriberRemoved {
                server: (service_id, instance_id, endpoint.protocol),
                eventgroup,
                subscriber: endpoint,
            });
        }

        self.poll_client_subscriptions(reg, now, &mut actions);
        self.poll_offers(reg, now, &mut actions);

        actions
    }

    fn poll_client_subscriptions(
        &mut self,
        reg: &mut Registry,
        now: Instant,
        actions: &mut Vec<SdAction>,
    ) {
        let keys: Vec<ClientKey> = reg.clients().map(|c| c.key()).collect();
        for key in keys {
            let offer = reg.remote_offer(&key).cloned();
            let response_timeout = self.timings.response_timeout;
            let backoffs: Vec<Duration> = (0..8).map(|a| self.backoff(a)).collect();
            let refresh = |sub_ttl: u32, offer_ttl: u32| self.refresh_period(sub_ttl, offer_ttl);

            let Some(client) = reg.client_mut(&key) else {
                continue;
            };
            let major = client.service.major_version;
            let local_addr = client.local_endpoint;
            let transport = offer
                .as_ref()
                .and_then(|o| o.endpoints.primary)
                .map(|ep| ep.protocol)
                .unwrap_or(TransportProtocol::Udp);
            let local = Endpoint {
                addr: local_addr,
                protocol: transport,
            };

            let mut to_send: Vec<(EventgroupId, u32)> = Vec::new();
            for (eventgroup, sub) in client.subscriptions.iter_mut() {
                match sub.phase {
                    SubscribePhase::Subscribing { deadline, attempts } if now >= deadline => {
                        let step = backoffs[(attempts as usize).min(backoffs.len() - 1)];
                        sub.phase = SubscribePhase::Backoff {
                            until: now + step,
                            attempts: attempts + 1,
                        };
                    }
                    SubscribePhase::Backoff { until, attempts } if now >= until => {
                        if offer.is_some() {
                            to_send.push((*eventgroup, sub.ttl));
                            sub.phase = SubscribePhase::Subscribing {
                                deadline: now + response_timeout,
                                attempts,
                            };
                        } else {
                            sub.phase = SubscribePhase::PendingOffer;
                        }
                    }
                    SubscribePhase::Subscribed { refresh_at } if now >= refresh_at => {
                        match &offer {
                            Some(o) => {
                                to_send.push((*eventgroup, sub.ttl));
                                sub.phase = SubscribePhase::Subscribed {
                                    refresh_at: now + refresh(sub.ttl, o.ttl),
                                };
                            }
                            None => sub.phase = SubscribePhase::PendingOffer,
                        }
                    }
                    _ => {}
                }
            }
            if let (false, Some(offer)) = (to_send.is_empty(), offer) {
                let mut builder = SdMessageBuilder::new(self.take_flags());
                for (eventgroup, ttl) in to_send {
                    builder.subscribe(key.0, key.1, major, eventgroup, ttl, local);
                }
                actions.push(SdAction::SendUnicast(builder.build(), offer.sd_addr));
            }
        }
    }

    fn poll_offers(&mut self, reg: &mut Registry, now: Instant, actions: &mut Vec<SdAction>) {
        let any_due = reg.servers().any(|s| {
            s.state == OfferState::Offering && s.next_offer_at.is_some_and(|t| t <= now)
        });
        if !any_due {
            return;
        }

        // Pack every offer whose cycle lands within the tolerance window.
        let horizon = now + self.timings.pack_tolerance;
        let due: Vec<ServerKey> = reg
            .servers()
            .filter(|s| {
                s.state == OfferState::Offering && s.next_offer_at.is_some_and(|t| t <= horizon)
            })
            .map(|s| s.key())
            .collect();

        let mut builder = SdMessageBuilder::new(self.take_flags());
        for key in due {
            let Some(server) = reg.server_mut(&key) else {
                continue;
            };
            builder.offer(
                server.service.service_id,
                server.instance_id,
                server.service.major_version,
                server.service.minor_version,
                server.ttl,
                &EndpointPair::single(server.endpoint),
            );
            // Advance on the scheduled grid so cadence does not drift; catch
            // up if the loop fell behind a whole cycle.
            let scheduled = server.next_offer_at.unwrap_or(now) + server.offer_period;
            server.next_offer_at = Some(if scheduled <= now {
                now + server.offer_period
            } else {
                scheduled
            });
        }
        if !builder.is_empty() {
            actions.push(SdAction::SendMulticast(builder.build()));
        }
    }

    /// The earliest instant at which [`SdEngine::poll`] has work, capped at
    /// one TTL tick from now.
    pub fn next_deadline(&self, reg: &Registry, now: Instant) -> Instant {
        let mut deadline = now + self.timings.tick;
        for server in reg.servers() {
            if let Some(t) = server.next_offer_at {
                deadline = deadline.min(t);
            }
        }
        for client in reg.clients() {
            for sub in client.subscriptions.values() {
                let t = match sub.phase {
                    SubscribePhase::Subscribing { deadline, .. } => Some(deadline),
                    SubscribePhase::Backoff { until, .. } => Some(until),
                    SubscribePhase::Subscribed { refresh_at } => Some(refresh_at),
                    SubscribePhase::PendingOffer => None,
                };
                if let Some(t) = t {
                    deadline = deadline.min(t);
                }
            }
        }
        deadline.max(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ServiceId;
    use crate::ipc::ConnId;
    use crate::registry::ServerInstance;
    use crate::service::Service;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    const SD_PEER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 30490);

    fn service(id: u16) -> Arc<Service> {
        Arc::new(
            Service::builder(ServiceId(id))
                .method(0x0001)
                .eventgroup(EventgroupId(0x0321), [0x0123])
                .build(),
        )
    }

    fn endpoint(port: u16, protocol: TransportProtocol) -> Endpoint {
        Endpoint {
            addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port),
            protocol,
        }
    }

    fn add_server(
        reg: &mut Registry,
        id: u16,
        protocol: TransportProtocol,
        ttl: u32,
        period_ms: u64,
    ) -> ServerKey {
        reg.insert_server(ServerInstance::new(
            service(id),
            InstanceId(0x5678),
            endpoint(3000, protocol),
            ttl,
            Duration::from_millis(period_ms),
            ConnId(1),
        ))
        .unwrap()
    }

    fn add_client(reg: &mut Registry, id: u16) -> ClientKey {
        reg.insert_client(
            service(id),
            InstanceId(0x5678),
            SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 4000),
            ConnId(2),
        )
        .unwrap()
    }

    fn offer_frame(id: u16, ttl: u32) -> Vec<u8> {
        let mut builder = SdMessageBuilder::new(SdFlags::default());
        builder.offer(
            ServiceId(id),
            InstanceId(0x5678),
            1,
            0,
            ttl,
            &EndpointPair::single(endpoint(3000, TransportProtocol::Udp)),
        );
        builder.build().to_frame()
    }

    fn multicast_message(actions: &[SdAction]) -> &SdMessage {
        actions
            .iter()
            .find_map(|a| match a {
                SdAction::SendMulticast(msg) => Some(msg),
                _ => None,
            })
            .expect("expected a multicast send")
    }

    #[test]
    fn test_start_offer_emits_and_schedules() {
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        let key = add_server(&mut reg, 0x1234, TransportProtocol::Udp, 3, 500);
        let t0 = Instant::now();

        let actions = engine.start_offer(&mut reg, &key, t0);
        let msg = multicast_message(&actions);
        assert_eq!(msg.entries.len(), 1);
        assert!(msg.flags.reboot, "first message carries the reboot flag");
        assert_eq!(
            reg.server(&key).unwrap().next_offer_at,
            Some(t0 + Duration::from_millis(500))
        );

        // Re-entering Offering is a no-op.
        assert!(engine.start_offer(&mut reg, &key, t0).is_empty());
    }

    #[test]
    fn test_offer_cadence_on_the_grid() {
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        let key = add_server(&mut reg, 0x1234, TransportProtocol::Udp, 3, 500);
        let t0 = Instant::now();
        engine.start_offer(&mut reg, &key, t0);

        // Poll slightly late; the next emission still lands on the grid.
        let t1 = t0 + Duration::from_millis(510);
        let actions = engine.poll(&mut reg, t1);
        assert_eq!(multicast_message(&actions).entries.len(), 1);
        assert_eq!(
            reg.server(&key).unwrap().next_offer_at,
            Some(t0 + Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_offer_packing_two_instances_two_options() {
        // Two instances, same cycle, same host:port over UDP and TCP: one
        // message, two entries, two options.
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        let k1 = add_server(&mut reg, 0x1111, TransportProtocol::Udp, 5, 2000);
        let k2 = add_server(&mut reg, 0x2222, TransportProtocol::Tcp, 5, 2000);
        let t0 = Instant::now();
        engine.start_offer(&mut reg, &k1, t0);
        engine.start_offer(&mut reg, &k2, t0);

        let actions = engine.poll(&mut reg, t0 + Duration::from_millis(2000));
        let msg = multicast_message(&actions);
        assert_eq!(msg.entries.len(), 2);
        assert_eq!(msg.options.len(), 2);
    }

    #[test]
    fn test_stop_offer_emits_once_and_cancels_cycle() {
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        let key = add_server(&mut reg, 0x1234, TransportProtocol::Udp, 3, 500);
        let t0 = Instant::now();
        engine.start_offer(&mut reg, &key, t0);

        let actions = engine.stop_offer(&mut reg, &key, t0);
        let msg = multicast_message(&actions);
        match &msg.entries[0] {
            SdEntry::Service(e) => assert!(e.is_stop_offer()),
            other => panic!("unexpected entry {other:?}"),
        }

        // Stopping again emits nothing, and no further cyclic offers fire.
        assert!(engine.stop_offer(&mut reg, &key, t0).is_empty());
        let actions = engine.poll(&mut reg, t0 + Duration::from_secs(5));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_remote_offer_expiry_flips_availability() {
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        let key = add_client(&mut reg, 0x1234);
        let t0 = Instant::now();

        let actions = engine.handle_frame(&mut reg, &offer_frame(0x1234, 2), SD_PEER, t0);
        assert!(actions.iter().any(|a| matches!(
            a,
            SdAction::Availability { available: true, .. }
        )));
        assert!(reg.client(&key).unwrap().available);

        // Nothing expires inside the TTL.
        assert!(engine
            .poll(&mut reg, t0 + Duration::from_millis(1990))
            .is_empty());

        // At TTL + one tick the offer is gone and the client sees it.
        let actions = engine.poll(&mut reg, t0 + Duration::from_millis(2050));
        assert!(actions.iter().any(|a| matches!(
            a,
            SdAction::Availability { available: false, .. }
        )));
        assert!(!reg.client(&key).unwrap().available);
        assert!(reg.remote_offer(&key).is_none());
    }

    #[test]
    fn test_subscribe_handshake() {
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        let key = add_client(&mut reg, 0x1234);
        let t0 = Instant::now();
        let eventgroup = EventgroupId(0x0321);

        // No offer yet: stays pending, no traffic.
        let actions = engine.subscribe(&mut reg, &key, eventgroup, 5, t0);
        assert!(actions.is_empty());

        // Offer arrives: subscribe goes out unicast to the offer's source.
        let actions = engine.handle_frame(&mut reg, &offer_frame(0x1234, 10), SD_PEER, t0);
        let subscribe_sent = actions.iter().any(|a| {
            matches!(a, SdAction::SendUnicast(msg, to)
                if *to == SD_PEER
                    && matches!(&msg.entries[0], SdEntry::Eventgroup(e)
                        if e.entry_type == EntryType::SubscribeEventgroup && e.ttl == 5))
        });
        assert!(subscribe_sent, "expected unicast subscribe: {actions:?}");
        assert!(matches!(
            reg.client(&key).unwrap().subscriptions[&eventgroup].phase,
            SubscribePhase::Subscribing { .. }
        ));

        // Ack moves to Subscribed with a refresh timer.
        let mut builder = SdMessageBuilder::new(SdFlags::default());
        builder.subscribe_ack(ServiceId(0x1234), InstanceId(0x5678), 1, eventgroup, 5, 0, None);
        let t1 = t0 + Duration::from_millis(50);
        engine.handle_frame(&mut reg, &builder.build().to_frame(), SD_PEER, t1);
        match reg.client(&key).unwrap().subscriptions[&eventgroup].phase {
            // refresh = min(ttl 5, offer ttl 10 / 2) = 5 s
            SubscribePhase::Subscribed { refresh_at } => {
                assert_eq!(refresh_at, t1 + Duration::from_secs(5))
            }
            other => panic!("expected Subscribed, got {other:?}"),
        }

        // Refresh timer re-sends the subscribe.
        let t2 = t1 + Duration::from_secs(5);
        let actions = engine.poll(&mut reg, t2);
        assert!(actions
            .iter()
            .any(|a| matches!(a, SdAction::SendUnicast(_, to) if *to == SD_PEER)));
    }

    #[test]
    fn test_nack_backoff_then_retry() {
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        let key = add_client(&mut reg, 0x1234);
        let t0 = Instant::now();
        let eventgroup = EventgroupId(0x0321);

        engine.subscribe(&mut reg, &key, eventgroup, 5, t0);
        engine.handle_frame(&mut reg, &offer_frame(0x1234, 10), SD_PEER, t0);

        let mut builder = SdMessageBuilder::new(SdFlags::default());
        builder.subscribe_nack(ServiceId(0x1234), InstanceId(0x5678), 1, eventgroup, 0);
        engine.handle_frame(&mut reg, &builder.build().to_frame(), SD_PEER, t0);

        let until = match reg.client(&key).unwrap().subscriptions[&eventgroup].phase {
            SubscribePhase::Backoff { until, attempts } => {
                assert_eq!(attempts, 1);
                until
            }
            other => panic!("expected Backoff, got {other:?}"),
        };

        // After the backoff the subscribe is retried.
        let actions = engine.poll(&mut reg, until);
        assert!(actions
            .iter()
            .any(|a| matches!(a, SdAction::SendUnicast(_, to) if *to == SD_PEER)));
        assert!(matches!(
            reg.client(&key).unwrap().subscriptions[&eventgroup].phase,
            SubscribePhase::Subscribing { .. }
        ));
    }

    #[test]
    fn test_response_timeout_backs_off() {
        let mut reg = Registry::new();
        let timings = SdTimings::default();
        let mut engine = SdEngine::new(timings.clone());
        let key = add_client(&mut reg, 0x1234);
        let t0 = Instant::now();
        let eventgroup = EventgroupId(0x0321);

        engine.subscribe(&mut reg, &key, eventgroup, 5, t0);
        engine.handle_frame(&mut reg, &offer_frame(0x1234, 10), SD_PEER, t0);

        let actions = engine.poll(&mut reg, t0 + timings.response_timeout);
        assert!(actions.is_empty());
        assert!(matches!(
            reg.client(&key).unwrap().subscriptions[&eventgroup].phase,
            SubscribePhase::Backoff { attempts: 1, .. }
        ));
    }

    #[test]
    fn test_server_side_subscribe_ack_and_expiry() {
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        let server_key = add_server(&mut reg, 0x1234, TransportProtocol::Udp, 5, 500);
        let t0 = Instant::now();
        let eventgroup = EventgroupId(0x0321);
        let subscriber = endpoint(4000, TransportProtocol::Udp);

        let mut builder = SdMessageBuilder::new(SdFlags::default());
        builder.subscribe(ServiceId(0x1234), InstanceId(0x5678), 1, eventgroup, 1, subscriber);
        let actions =
            engine.handle_frame(&mut reg, &builder.build().to_frame(), SD_PEER, t0);

        // Ack carries the server's endpoint option; the app is told.
        let ack_ok = actions.iter().any(|a| {
            matches!(a, SdAction::SendUnicast(msg, to)
                if *to == SD_PEER
                    && matches!(&msg.entries[0], SdEntry::Eventgroup(e)
                        if e.entry_type == EntryType::SubscribeEventgroupAck && e.ttl == 1)
                    && msg.options.len() == 1)
        });
        assert!(ack_ok, "expected ack with endpoint: {actions:?}");
        assert!(actions
            .iter()
            .any(|a| matches!(a, SdAction::SubscriberAdded { .. })));

        let sub_key = (ServiceId(0x1234), InstanceId(0x5678), eventgroup);
        assert_eq!(
            reg.subscribers(sub_key, TransportProtocol::Udp, t0),
            vec![subscriber]
        );

        // A refresh is acked again but not re-announced to the app.
        let mut builder = SdMessageBuilder::new(SdFlags::default());
        builder.subscribe(ServiceId(0x1234), InstanceId(0x5678), 1, eventgroup, 1, subscriber);
        let actions = engine.handle_frame(&mut reg, &builder.build().to_frame(), SD_PEER, t0);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, SdAction::SubscriberAdded { .. })));

        // TTL elapses without renewal: evicted, app notified, no deliveries.
        let actions = engine.poll(&mut reg, t0 + Duration::from_millis(1050));
        assert!(actions.iter().any(|a| matches!(
            a,
            SdAction::SubscriberRemoved { server, .. } if *server == server_key
        )));
        assert!(reg
            .subscribers(sub_key, TransportProtocol::Udp, t0 + Duration::from_secs(2))
            .is_empty());
    }

    #[test]
    fn test_subscribe_unknown_eventgroup_nacked() {
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        add_server(&mut reg, 0x1234, TransportProtocol::Udp, 5, 500);
        let t0 = Instant::now();

        let mut builder = SdMessageBuilder::new(SdFlags::default());
        builder.subscribe(
            ServiceId(0x1234),
            InstanceId(0x5678),
            1,
            EventgroupId(0x0999),
            5,
            endpoint(4000, TransportProtocol::Udp),
        );
        let actions = engine.handle_frame(&mut reg, &builder.build().to_frame(), SD_PEER, t0);

        let nacked = actions.iter().any(|a| {
            matches!(a, SdAction::SendUnicast(msg, _)
                if matches!(&msg.entries[0], SdEntry::Eventgroup(e)
                    if e.entry_type == EntryType::SubscribeEventgroupAck && e.is_negative()))
        });
        assert!(nacked, "expected nack: {actions:?}");
    }

    #[test]
    fn test_find_answered_with_unicast_offer() {
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        let key = add_server(&mut reg, 0x1234, TransportProtocol::Udp, 3, 500);
        let t0 = Instant::now();
        engine.start_offer(&mut reg, &key, t0);

        let mut builder = SdMessageBuilder::new(SdFlags::default());
        builder.find(ServiceId(0x1234), InstanceId::ANY, 0xFF, 0xFFFF_FFFF);
        let actions = engine.handle_frame(&mut reg, &builder.build().to_frame(), SD_PEER, t0);

        assert!(actions
            .iter()
            .any(|a| matches!(a, SdAction::SendUnicast(_, to) if *to == SD_PEER)));
    }

    #[test]
    fn test_malformed_frame_counted_not_fatal() {
        let mut reg = Registry::new();
        let mut engine = SdEngine::new(SdTimings::default());
        let t0 = Instant::now();

        let actions = engine.handle_frame(&mut reg, &[0u8; 7], SD_PEER, t0);
        assert!(actions.is_empty());
        assert_eq!(engine.counters.decode_errors, 1);

        // Ack for a subscription nobody asked for is a protocol violation.
        let mut builder = SdMessageBuilder::new(SdFlags::default());
        builder.subscribe_ack(
            ServiceId(0x7777),
            InstanceId(1),
            1,
            EventgroupId(1),
            5,
            0,
            None,
        );
        engine.handle_frame(&mut reg, &builder.build().to_frame(), SD_PEER, t0);
        assert_eq!(engine.counters.protocol_violations, 1);
    }

    #[test]
    fn test_next_deadline_capped_by_tick() {
        let reg = Registry::new();
        let engine = SdEngine::new(SdTimings::default());
        let now = Instant::now();
        let deadline = engine.next_deadline(&reg, now);
        assert!(deadline <= now + Duration::from_millis(100));
    }
}
