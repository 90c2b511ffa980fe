//! Dispatch support: the forwarded-request table and drop counters.
//!
//! Routing itself runs on the daemon loop; this module owns the state it
//! needs — which forwarded REQUESTs await an application reply, and how many
//! messages were dropped for which reason.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::header::{ClientId, MethodId, SessionId};
use crate::ipc::ConnId;
use crate::registry::ServerKey;
use crate::sd::option::Endpoint;

/// Default deadline for an application to answer a forwarded REQUEST.
pub const REQUEST_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// A REQUEST forwarded to a local application, awaiting its reply.
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    /// Owning server instance.
    pub server: ServerKey,
    /// Application connection the request went to.
    pub app: ConnId,
    /// Where the response goes, over the transport the request used.
    pub reply_to: Endpoint,
    /// Requester's client id, preserved in the response.
    pub client_id: ClientId,
    /// Requester's session id, preserved in the response.
    pub session_id: SessionId,
    /// Requested method.
    pub method: MethodId,
    /// Interface version echoed into the response.
    pub interface_version: u8,
    /// When the reply is abandoned.
    pub deadline: Instant,
}

/// Table of forwarded requests keyed by daemon-allocated correlation id.
#[derive(Debug, Default)]
pub struct RequestTable {
    next_correlation: u32,
    pending: HashMap<u32, ForwardedRequest>,
}

impl RequestTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a forwarded request, returning its correlation id.
    pub fn insert(&mut self, request: ForwardedRequest) -> u32 {
        loop {
            self.next_correlation = self.next_correlation.wrapping_add(1);
            if self.next_correlation == 0 || self.pending.contains_key(&self.next_correlation) {
                continue;
            }
            let correlation = self.next_correlation;
            self.pending.insert(correlation, request);
            return correlation;
        }
    }

    /// Take the request for an application reply.
    pub fn take(&mut self, correlation: u32) -> Option<ForwardedRequest> {
        self.pending.remove(&correlation)
    }

    /// Remove and return requests whose reply deadline elapsed.
    pub fn sweep(&mut self, now: Instant) -> Vec<ForwardedRequest> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, req)| now >= req.deadline)
            .map(|(corr, _)| *corr)
            .collect();
        expired
            .into_iter()
            .filter_map(|corr| self.pending.remove(&corr))
            .collect()
    }

    /// Drop every request owned by a disconnected application.
    pub fn drop_for_conn(&mut self, conn: ConnId) {
        self.pending.retain(|_, req| req.app != conn);
    }

    /// Earliest pending reply deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|req| req.deadline).min()
    }

    /// Number of replies outstanding.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no replies are outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Drop counters for the data-plane dispatch paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchCounters {
    /// Frames that failed to decode.
    pub decode_errors: u64,
    /// Notifications with no subscribed local client.
    pub dropped_events: u64,
    /// Responses with no matching pending session.
    pub dropped_responses: u64,
    /// Requests for services or methods nobody serves.
    pub dropped_requests: u64,
    /// Application replies that arrived after the reply deadline.
    pub late_replies: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ServiceId;
    use crate::sd::types::InstanceId;
    use crate::types::TransportProtocol;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn request(app: ConnId, deadline: Instant) -> ForwardedRequest {
        ForwardedRequest {
            server: (ServiceId(0x1234), InstanceId(1), TransportProtocol::Udp),
            app,
            reply_to: Endpoint::udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000)),
            client_id: ClientId(0x0100),
            session_id: SessionId(0x0001),
            method: MethodId(0x0001),
            interface_version: 1,
            deadline,
        }
    }

    #[test]
    fn test_insert_take() {
        let mut table = RequestTable::new();
        let deadline = Instant::now() + REQUEST_REPLY_TIMEOUT;
        let corr = table.insert(request(ConnId(1), deadline));
        assert_ne!(corr, 0);

        assert!(table.take(corr).is_some());
        assert!(table.take(corr).is_none());
    }

    #[test]
    fn test_sweep_and_deadline() {
        let mut table = RequestTable::new();
        let now = Instant::now();
        table.insert(request(ConnId(1), now + Duration::from_millis(10)));
        table.insert(request(ConnId(1), now + Duration::from_secs(30)));

        assert_eq!(table.next_deadline(), Some(now + Duration::from_millis(10)));
        let expired = table.sweep(now + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_drop_for_conn() {
        let mut table = RequestTable::new();
        let deadline = Instant::now() + REQUEST_REPLY_TIMEOUT;
        table.insert(request(ConnId(1), deadline));
        table.insert(request(ConnId(2), deadline));

        table.drop_for_conn(ConnId(1));
        assert_eq!(table.len(), 1);
    }
}
