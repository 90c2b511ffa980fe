//! Method-call correlation: session allocation and the outstanding-request
//! table of one local client instance.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::header::SessionId;
use crate::ipc::ConnId;
use crate::types::{MessageType, ReturnCode};

/// The terminal result of a method call as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodOutcome {
    /// RESPONSE or ERROR.
    pub message_type: MessageType,
    /// Return code from the response, or a daemon-produced code for local
    /// failures.
    pub return_code: ReturnCode,
    /// Response payload.
    pub payload: Bytes,
}

impl MethodOutcome {
    /// The deadline elapsed without a response.
    pub fn timeout() -> Self {
        Self {
            message_type: MessageType::Error,
            return_code: ReturnCode::TIMEOUT,
            payload: Bytes::new(),
        }
    }

    /// No live offer for the instance.
    pub fn unreachable() -> Self {
        Self {
            message_type: MessageType::Error,
            return_code: ReturnCode::NOT_REACHABLE,
            payload: Bytes::new(),
        }
    }

    /// The TCP connector to the remote endpoint is not up yet.
    pub fn not_connected() -> Self {
        Self {
            message_type: MessageType::Error,
            return_code: ReturnCode::NOT_READY,
            payload: Bytes::new(),
        }
    }
}

/// Where a completed call's outcome goes.
#[derive(Debug)]
pub enum ResponseSink {
    /// Reply over IPC with the application's correlation id.
    Ipc {
        /// Owning connection.
        conn: ConnId,
        /// Application-chosen correlation id.
        correlation: u32,
    },
    /// Complete an in-process waiter (tests and embedded use).
    Channel(oneshot::Sender<MethodOutcome>),
}

/// One outstanding request.
#[derive(Debug)]
pub struct PendingCall {
    /// When the call times out.
    pub deadline: Instant,
    /// Completion target.
    pub sink: ResponseSink,
}

/// Session allocation and the pending-call table of one client instance.
///
/// Out-of-order responses are the normal case: completion is keyed by
/// session id alone, so arrival order does not matter.
#[derive(Debug, Default)]
pub struct Correlator {
    next_session: u16,
    pending: HashMap<SessionId, PendingCall>,
}

impl Correlator {
    /// Create an empty table; the first allocated session id is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session id and park the call.
    ///
    /// Ids increment monotonically modulo 2^16, skip 0, and skip ids still
    /// occupied by an in-flight call.
    pub fn allocate(&mut self, deadline: Instant, sink: ResponseSink) -> SessionId {
        loop {
            self.next_session = self.next_session.wrapping_add(1);
            if self.next_session == 0 {
                continue;
            }
            let session = SessionId(self.next_session);
            if !self.pending.contains_key(&session) {
                self.pending.insert(session, PendingCall { deadline, sink });
                return session;
            }
        }
    }

    /// Take the pending call for a session, if one is in flight.
    pub fn complete(&mut self, session: SessionId) -> Option<PendingCall> {
        self.pending.remove(&session)
    }

    /// Remove and return every call whose deadline has elapsed.
    pub fn sweep(&mut self, now: Instant) -> Vec<PendingCall> {
        let expired: Vec<SessionId> = self
            .pending
            .iter()
            .filter(|(_, call)| now >= call.deadline)
            .map(|(session, _)| *session)
            .collect();
        expired
            .into_iter()
            .filter_map(|session| self.pending.remove(&session))
            .collect()
    }

    /// Remove and return every pending call (owner teardown).
    pub fn drain(&mut self) -> Vec<PendingCall> {
        self.pending.drain().map(|(_, call)| call).collect()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|call| call.deadline).min()
    }

    /// Number of in-flight calls.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no calls are in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Deliver an outcome into a sink. IPC sinks are returned to the caller
/// (the daemon owns the connection writers); channel sinks complete here.
pub fn deliver(sink: ResponseSink, outcome: MethodOutcome) -> Option<(ConnId, u32, MethodOutcome)> {
    match sink {
        ResponseSink::Ipc { conn, correlation } => Some((conn, correlation, outcome)),
        ResponseSink::Channel(tx) => {
            let _ = tx.send(outcome);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn sink() -> (ResponseSink, oneshot::Receiver<MethodOutcome>) {
        let (tx, rx) = oneshot::channel();
        (ResponseSink::Channel(tx), rx)
    }

    #[test]
    fn test_session_ids_unique_while_in_flight() {
        let mut correlator = Correlator::new();
        let deadline = Instant::now() + Duration::from_secs(1);

        let mut seen = HashSet::new();
        for _ in 0..100 {
            let (s, _rx) = sink();
            let session = correlator.allocate(deadline, s);
            assert_ne!(session.0, 0);
            assert!(seen.insert(session), "duplicate session {session}");
        }
        assert_eq!(correlator.len(), 100);
    }

    #[test]
    fn test_wraparound_skips_zero_and_collisions() {
        let mut correlator = Correlator::new();
        correlator.next_session = u16::MAX - 1;
        let deadline = Instant::now() + Duration::from_secs(1);

        let (s1, _rx1) = sink();
        let first = correlator.allocate(deadline, s1);
        assert_eq!(first, SessionId(u16::MAX));

        // Wraps past 0 to 1.
        let (s2, _rx2) = sink();
        assert_eq!(correlator.allocate(deadline, s2), SessionId(1));

        // With 1 still in flight, the next wrap-around must skip it.
        correlator.next_session = 0;
        let (s3, _rx3) = sink();
        assert_eq!(correlator.allocate(deadline, s3), SessionId(2));
    }

    #[test]
    fn test_out_of_order_completion() {
        let mut correlator = Correlator::new();
        let deadline = Instant::now() + Duration::from_secs(1);

        let (sa, mut rx_a) = sink();
        let (sb, mut rx_b) = sink();
        let a = correlator.allocate(deadline, sa);
        let b = correlator.allocate(deadline, sb);

        // B completes before A.
        let call = correlator.complete(b).unwrap();
        deliver(
            call.sink,
            MethodOutcome {
                message_type: MessageType::Response,
                return_code: ReturnCode::OK,
                payload: Bytes::from_static(b"b"),
            },
        );
        let call = correlator.complete(a).unwrap();
        deliver(
            call.sink,
            MethodOutcome {
                message_type: MessageType::Response,
                return_code: ReturnCode::OK,
                payload: Bytes::from_static(b"a"),
            },
        );

        assert_eq!(rx_a.try_recv().unwrap().payload.as_ref(), b"a");
        assert_eq!(rx_b.try_recv().unwrap().payload.as_ref(), b"b");
    }

    #[test]
    fn test_unknown_session_is_none() {
        let mut correlator = Correlator::new();
        assert!(correlator.complete(SessionId(42)).is_none());
    }

    #[test]
    fn test_sweep_removes_expired_only() {
        let mut correlator = Correlator::new();
        let now = Instant::now();

        let (s1, _rx1) = sink();
        let (s2, _rx2) = sink();
        correlator.allocate(now + Duration::from_millis(10), s1);
        correlator.allocate(now + Duration::from_secs(10), s2);

        let expired = correlator.sweep(now + Duration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(correlator.len(), 1);
        assert_eq!(
            correlator.next_deadline(),
            Some(now + Duration::from_secs(10))
        );
    }
}
