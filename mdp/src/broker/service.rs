//! Service registry entity.
//!
//! One [`Service`] exists per distinct service name a client has requested
//! or a worker has `READY`'d for. Mutated only on the broker's single
//! event-loop task — see §5 of the spec for the no-locks invariant.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use crate::protocol::is_reserved_service;

/// A pending request envelope as held inside a service's queue: the
/// client's return address, the empty delimiter, the request id, and the
/// opaque payload frames — everything needed to rewrap a reply.
pub type RequestEnvelope = Vec<Bytes>;

/// A registered service.
#[derive(Debug)]
pub struct Service {
    /// Opaque byte-string name, unique key in the broker's service table.
    pub name: Bytes,
    /// FIFO of pending request envelopes not yet dispatched to a worker.
    pub requests: VecDeque<RequestEnvelope>,
    /// Idle workers registered for this service, insertion-ordered.
    pub waiting: VecDeque<Bytes>,
    /// True for every service except the reserved name `APP`.
    pub workholic_mode: bool,
    /// The one worker all requests are pinned to, when `workholic_mode`.
    pub designated_worker: Option<Bytes>,
    /// Monotonic timestamp updated whenever the service is referenced.
    pub last_activity_time: Instant,
}

impl Service {
    #[must_use]
    pub fn new(name: Bytes, now: Instant) -> Self {
        let workholic_mode = name.as_ref() != b"APP" as &[u8];
        Self {
            name,
            requests: VecDeque::new(),
            waiting: VecDeque::new(),
            workholic_mode,
            designated_worker: None,
            last_activity_time: now,
        }
    }

    /// Whether `name` falls in the reserved MMI namespace and thus can never
    /// become a real service.
    #[must_use]
    pub fn is_reserved_name(name: &[u8]) -> bool {
        is_reserved_service(name)
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity_time = now;
    }

    /// A service is eligible for GC once no workers are waiting and it has
    /// been inactive for longer than `service_timeout`.
    #[must_use]
    pub fn is_expired(&self, now: Instant, service_timeout: std::time::Duration) -> bool {
        self.waiting.is_empty() && now.duration_since(self.last_activity_time) > service_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workholic_mode_is_default_except_app() {
        let now = Instant::now();
        let app = Service::new(Bytes::from_static(b"APP"), now);
        assert!(!app.workholic_mode);

        let tick = Service::new(Bytes::from_static(b"TICK"), now);
        assert!(tick.workholic_mode);
    }

    #[test]
    fn expiry_requires_empty_waiting_and_elapsed_timeout() {
        let now = Instant::now();
        let mut svc = Service::new(Bytes::from_static(b"TICK"), now);
        assert!(!svc.is_expired(now, std::time::Duration::from_millis(0)));

        svc.waiting.push_back(Bytes::from_static(b"w1"));
        let later = now + std::time::Duration::from_secs(10);
        assert!(!svc.is_expired(later, std::time::Duration::from_millis(1)));

        svc.waiting.clear();
        assert!(svc.is_expired(later, std::time::Duration::from_millis(1)));
    }
}
