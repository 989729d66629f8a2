//! Error taxonomy for the broker engine, worker session, and async client.
//!
//! Follows §7 of the spec: most broker-side conditions are handled in place
//! (log + drop, log + disconnect, silent purge) rather than bubbled up as
//! fatal errors, so these enums cover what a caller actually needs to react
//! to: bind failures, malformed wire input, and transport loss.

use thiserror::Error;

/// Errors surfaced by the broker engine.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The requested bind endpoint could not be parsed.
    #[error("invalid bind endpoint: {0}")]
    InvalidEndpoint(String),

    /// The bind endpoint is already in use and could not be reclaimed.
    #[error("endpoint already in use: {0}")]
    EndpointInUse(String),

    /// Transport-level I/O error while accepting or serving a connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A worker or client connection sent a multipart message with an
    /// unexpected frame count or missing delimiter.
    #[error("malformed multipart message: {0}")]
    MalformedMultipart(String),
}

/// Errors surfaced by the worker session state machine.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Could not connect or reconnect to the broker.
    #[error("broker connection failed: {0}")]
    Connect(#[from] std::io::Error),

    /// The broker protocol was violated (e.g. unexpected command).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No message was received from the broker within `HEARTBEAT_EXPIRY`.
    #[error("broker liveness expired")]
    LivenessExpired,

    /// The registered request handler panicked or returned an error.
    ///
    /// Per §7, this is marshalled into a failure-tagged reply rather than
    /// tearing down the session.
    #[error("request handler failed: {0}")]
    HandlerFailed(String),
}

/// Errors surfaced by the async client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not connect or reconnect to the broker.
    #[error("broker connection failed: {0}")]
    Connect(#[from] std::io::Error),

    /// The reply channel was closed (client session task exited).
    #[error("client session closed")]
    Closed,

    /// No reply arrived before the caller-supplied timeout.
    #[error("receive timed out")]
    Timeout,
}

/// Errors surfaced by the publish/subscribe sidecar.
#[derive(Error, Debug)]
pub enum PubSubError {
    /// Could not connect to the endpoint.
    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),

    /// A received message did not have the expected two-frame shape.
    #[error("malformed pub/sub frame: {0}")]
    MalformedFrame(String),

    /// The publisher's outgoing queue is closed.
    #[error("publisher queue closed")]
    QueueClosed,
}
