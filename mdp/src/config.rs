//! Timing and endpoint configuration shared by the broker, worker session,
//! async client, and pub/sub sidecar.
//!
//! Defaults mirror §4.3/§4.4 of the specification this crate implements:
//! `HEARTBEAT_LIVENESS = 5`, `HEARTBEAT_INTERVAL = 1000ms`,
//! `HEARTBEAT_EXPIRY = HEARTBEAT_INTERVAL * HEARTBEAT_LIVENESS`,
//! `SERVICE_TIMEOUT = 5000ms`.

use std::time::Duration;

/// Default endpoint the broker binds and that workers/clients connect to
/// when none is supplied.
pub const DEFAULT_ENDPOINT: &str = "tcp://0.0.0.0:5555";

/// Broker engine timing configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How many consecutive missed heartbeats before a worker is purged.
    pub heartbeat_liveness: u32,
    /// How often the broker ticks heartbeats and polls for input.
    pub heartbeat_interval: Duration,
    /// Idle interval after which a service with no waiting workers is
    /// garbage-collected.
    pub service_timeout: Duration,
    /// Endpoint to bind the router transport to.
    pub endpoint: String,
}

impl BrokerConfig {
    /// The derived expiry deadline: `heartbeat_interval * heartbeat_liveness`.
    #[must_use]
    pub fn heartbeat_expiry(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_liveness
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_liveness: 5,
            heartbeat_interval: Duration::from_millis(1000),
            service_timeout: Duration::from_millis(5000),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

/// Worker session timing configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub heartbeat_liveness: u32,
    pub heartbeat_interval: Duration,
    /// Delay before reconnecting after the broker is presumed dead.
    pub reconnect_delay: Duration,
}

impl WorkerConfig {
    #[must_use]
    pub fn heartbeat_expiry(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_liveness
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_liveness: 5,
            heartbeat_interval: Duration::from_millis(1000),
            reconnect_delay: Duration::from_millis(2500),
        }
    }
}

/// Async client timing configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long `recv()` blocks waiting for a reply before returning `None`.
    pub recv_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(2500),
        }
    }
}

/// Pub/Sub sidecar timing configuration.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// How long the subscriber's poll loop waits for a message before
    /// looping again to re-check its `active` flag.
    pub keep_alive_tolerance: Duration,
    /// Capacity of the publisher's outgoing queue before `publish` blocks.
    pub queue_capacity: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            keep_alive_tolerance: Duration::from_secs(5),
            queue_capacity: 1000,
        }
    }
}
