//! Worker registry entity.
//!
//! One [`Worker`] exists per currently-registered worker identity. The
//! broker never exposes a handle to this type outside the engine — all
//! mutation happens on the broker's single event-loop task.

use bytes::Bytes;
use std::time::Instant;

/// A registered worker.
#[derive(Debug, Clone)]
pub struct Worker {
    /// Unique identity assigned by the transport layer when the connection
    /// was accepted.
    pub identity: Bytes,
    /// Name of the service this worker last sent `READY` for.
    pub service: Bytes,
    /// Monotonic deadline; if exceeded without a heartbeat the worker is
    /// purged.
    pub expiry: Instant,
}

impl Worker {
    #[must_use]
    pub fn new(identity: Bytes, service: Bytes, expiry: Instant) -> Self {
        Self {
            identity,
            service,
            expiry,
        }
    }

    /// Push the expiry deadline forward by `liveness` heartbeat intervals.
    pub fn refresh_expiry(&mut self, now: Instant, heartbeat_expiry: std::time::Duration) {
        self.expiry = now + heartbeat_expiry;
    }
}
