//! A Majordomo-style request/reply broker with per-service worker
//! affinity, built on ZMTP over io_uring.
//!
//! - [`broker::Broker`] is the single-threaded router engine: service and
//!   worker registries, heartbeat liveness, the `mmi.*` meta-service, and
//!   the "workholic" designated-worker dispatch policy.
//! - [`worker::WorkerSession`] is the worker-side session a service
//!   implementation drives: connect, `READY`, dispatch requests to
//!   registered handlers, heartbeat, reconnect.
//! - [`client::AsyncClient`] is the asynchronous client session: fire a
//!   request, correlate the reply by id, either by polling [`client::AsyncClient::recv`]
//!   or registering a callback.
//! - [`pubsub::Publisher`]/[`pubsub::Subscriber`] are an independent
//!   pub/sub sidecar for out-of-band fan-out, riding the same transport.
#![allow(clippy::module_name_repetitions)]

pub mod broker;
pub mod client;
pub mod config;
pub mod dev_tracing;
pub mod error;
pub mod port_reclaim;
pub mod protocol;
pub mod pubsub;
pub mod worker;

pub use broker::Broker;
pub use client::AsyncClient;
pub use config::{BrokerConfig, ClientConfig, PubSubConfig, WorkerConfig};
pub use error::{BrokerError, ClientError, PubSubError, WorkerError};
pub use pubsub::{Publisher, Subscriber};
pub use worker::WorkerSession;
