//! Worker-side session: the client half of the broker/worker protocol.
//!
//! One [`WorkerSession`] owns exactly one background task and exactly one
//! [`DealerSocket`] connection to the broker, matching §5's "each owns
//! exactly one background task" rule. The only state shared with the
//! caller's thread is the handler table (guarded by a `std::sync::Mutex`,
//! per §5: "a single small mutex in each session guards the active flag
//! and, in the worker, the registered-functions table") and a designation
//! flag read by the application layer.
//!
//! State machine: `DISCONNECTED -> CONNECTED(READY sent) -> IDLE <-> BUSY
//! -> DISCONNECTED`, exactly as laid out in spec §4.4.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use futures::{select, FutureExt};
use tracing::{info, warn};

use mdp_core::endpoint::Endpoint;
use mdp_core::options::SocketOptions;
use mdp_zmtp::DealerSocket;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::protocol::{
    is_tag, tag_frame, w_worker_frame, worker_command_bytes, DESIGNATED_MARKER, REPLY_ERR,
    REPLY_OK, W_DISCONNECT, W_HEARTBEAT, W_READY, W_REPLY, W_REQUEST, W_WORKER,
};

/// The payload frames a registered handler returns on success.
pub type HandlerResult = Result<Vec<Bytes>, WorkerError>;
/// A named callable in the worker's local dispatch table. Invocation is
/// opaque to the session: the handler receives the request's payload
/// frames (the method name already stripped) and returns reply frames.
pub type Handler = Arc<dyn Fn(Vec<Bytes>) -> HandlerResult + Send + Sync>;

/// Client-side session for the worker half of the protocol.
///
/// Construct with [`WorkerSession::new`], [`register`](Self::register) one
/// or more named handlers, then [`start`](Self::start). The session
/// reconnects on its own after a broker liveness timeout; call
/// [`stop`](Self::stop) to tear it down deterministically.
pub struct WorkerSession {
    config: WorkerConfig,
    endpoint: Endpoint,
    options: SocketOptions,
    service: Bytes,
    handlers: Arc<Mutex<HashMap<Bytes, Handler>>>,
    designated: Arc<AtomicBool>,
    stop_tx: Option<flume::Sender<()>>,
    done_rx: Option<flume::Receiver<()>>,
}

impl WorkerSession {
    /// Build a worker session for `service`, connecting to `endpoint` once
    /// [`start`](Self::start) is called.
    #[must_use]
    pub fn new(endpoint: Endpoint, service: impl Into<Bytes>, config: WorkerConfig) -> Self {
        Self::with_options(endpoint, service, config, SocketOptions::default())
    }

    /// As [`new`](Self::new), with custom transport options (e.g. a stable
    /// routing id across reconnects).
    #[must_use]
    pub fn with_options(
        endpoint: Endpoint,
        service: impl Into<Bytes>,
        config: WorkerConfig,
        options: SocketOptions,
    ) -> Self {
        Self {
            config,
            endpoint,
            options,
            service: service.into(),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            designated: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            done_rx: None,
        }
    }

    /// Record a named callable in the local dispatch table. Incoming
    /// requests carry the method name as their first payload frame; the
    /// remaining frames are passed to `handler` unmarshalled (the core
    /// treats argument encoding as opaque, per §1's scope note).
    pub fn register<F>(&self, name: impl Into<Bytes>, handler: F)
    where
        F: Fn(Vec<Bytes>) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .expect("worker handler table poisoned")
            .insert(name.into(), Arc::new(handler));
    }

    /// Whether the most recent heartbeat from the broker carried the
    /// `designated` marker (i.e. this worker is its service's affinity
    /// target). Surfaced for the application layer; the core itself only
    /// tracks it.
    #[must_use]
    pub fn is_designated(&self) -> bool {
        self.designated.load(Ordering::Relaxed)
    }

    /// Start the session's background task: connect, send `READY`, and run
    /// the IDLE/BUSY loop until [`stop`](Self::stop) is called.
    pub fn start(&mut self) {
        let (stop_tx, stop_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded(1);
        self.stop_tx = Some(stop_tx);
        self.done_rx = Some(done_rx);

        let endpoint = self.endpoint.clone();
        let options = self.options.clone();
        let service = self.service.clone();
        let config = self.config.clone();
        let handlers = self.handlers.clone();
        let designated = self.designated.clone();

        compio::runtime::spawn(async move {
            run(endpoint, options, service, config, handlers, designated, stop_rx, done_tx).await;
        })
        .detach();
    }

    /// Signal the background task to send `W_DISCONNECT` and exit, then
    /// wait for it to finish (§5: "on stop, sessions close their transport
    /// and join their background task deterministically").
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(done_rx) = self.done_rx.take() {
            let _ = done_rx.recv_async().await;
        }
    }
}

async fn run(
    endpoint: Endpoint,
    options: SocketOptions,
    service: Bytes,
    config: WorkerConfig,
    handlers: Arc<Mutex<HashMap<Bytes, Handler>>>,
    designated: Arc<AtomicBool>,
    stop_rx: flume::Receiver<()>,
    done_tx: flume::Sender<()>,
) {
    'session: loop {
        if stop_rx.try_recv().is_ok() {
            break 'session;
        }

        let mut dealer = match connect_and_ready(&endpoint, &options, &service).await {
            Ok(dealer) => dealer,
            Err(e) => {
                warn!(service = ?service, error = %e, "worker connect failed, retrying");
                compio::time::sleep(config.reconnect_delay).await;
                continue 'session;
            }
        };
        info!(service = ?service, "worker ready");

        let mut last_seen = Instant::now();
        let mut next_heartbeat = Instant::now() + config.heartbeat_interval;
        let expiry = config.heartbeat_expiry();

        'connected: loop {
            let now = Instant::now();
            if now.duration_since(last_seen) > expiry {
                let err = WorkerError::LivenessExpired;
                warn!(service = ?service, error = %err, "reconnecting");
                break 'connected;
            }
            if now >= next_heartbeat {
                if dealer.send(heartbeat_frames()).await.is_err() {
                    break 'connected;
                }
                next_heartbeat = now + config.heartbeat_interval;
            }

            select! {
                stop = stop_rx.recv_async().fuse() => {
                    if stop.is_ok() {
                        let _ = dealer.send(disconnect_frames()).await;
                        let _ = done_tx.send_async(()).await;
                        return;
                    }
                }
                recv = dealer.recv().fuse() => {
                    match recv {
                        Ok(Some(frames)) => {
                            last_seen = Instant::now();
                            match handle_frame(frames, &mut dealer, &handlers, &designated).await {
                                Ok(true) => {}
                                Ok(false) => break 'connected,
                                Err(e) => warn!(service = ?service, error = %e, "malformed frame from broker"),
                            }
                        }
                        Ok(None) => {
                            warn!(service = ?service, "broker connection closed");
                            break 'connected;
                        }
                        Err(e) => {
                            warn!(service = ?service, error = %e, "recv error, reconnecting");
                            break 'connected;
                        }
                    }
                }
                _ = compio::time::sleep(config.heartbeat_interval).fuse() => {}
            }
        }

        if stop_rx.try_recv().is_ok() {
            break 'session;
        }
        compio::time::sleep(config.reconnect_delay).await;
    }
    let _ = done_tx.send_async(()).await;
}

async fn connect_and_ready(
    endpoint: &Endpoint,
    options: &SocketOptions,
    service: &Bytes,
) -> std::io::Result<DealerSocket> {
    let mut dealer = DealerSocket::connect(endpoint.clone(), options.clone()).await?;
    let mut ready = vec![Bytes::new(), w_worker_frame(), worker_command_bytes(W_READY)];
    ready.push(service.clone());
    dealer.send(ready).await?;
    Ok(dealer)
}

fn heartbeat_frames() -> Vec<Bytes> {
    vec![Bytes::new(), w_worker_frame(), worker_command_bytes(W_HEARTBEAT)]
}

fn disconnect_frames() -> Vec<Bytes> {
    vec![Bytes::new(), w_worker_frame(), worker_command_bytes(W_DISCONNECT)]
}

/// Handle one broker->worker frame. Returns `Ok(false)` when the caller
/// should drop the connection and reconnect (broker-initiated disconnect).
async fn handle_frame(
    mut frames: Vec<Bytes>,
    dealer: &mut DealerSocket,
    handlers: &Arc<Mutex<HashMap<Bytes, Handler>>>,
    designated: &Arc<AtomicBool>,
) -> Result<bool, WorkerError> {
    if frames.is_empty() {
        return Err(WorkerError::Protocol("empty message from broker".into()));
    }
    let empty = frames.remove(0);
    if !empty.is_empty() {
        return Err(WorkerError::Protocol("missing empty delimiter".into()));
    }
    if frames.is_empty() {
        return Err(WorkerError::Protocol("missing protocol header".into()));
    }
    let header = frames.remove(0);
    if !is_tag(&header, W_WORKER) {
        return Err(WorkerError::Protocol("unexpected protocol header".into()));
    }
    if frames.is_empty() {
        return Err(WorkerError::Protocol("missing command".into()));
    }
    let command = frames.remove(0).first().copied().unwrap_or(0);

    match command {
        W_REQUEST => {
            if frames.len() < 3 {
                return Err(WorkerError::Protocol("malformed request envelope".into()));
            }
            let client = frames.remove(0);
            let client_empty = frames.remove(0);
            let request_id = frames.remove(0);
            let payload = frames;

            let (tag, body) = match invoke_handler(handlers, payload) {
                Ok(body) => (REPLY_OK, body),
                Err(e) => (REPLY_ERR, vec![Bytes::from(e.to_string())]),
            };

            let mut reply = vec![
                Bytes::new(),
                w_worker_frame(),
                worker_command_bytes(W_REPLY),
                client,
                client_empty,
                request_id,
                tag_frame(tag),
            ];
            reply.extend(body);
            dealer.send(reply).await.map_err(WorkerError::Connect)?;
        }
        W_HEARTBEAT => {
            let is_designated = frames
                .first()
                .map(|marker| marker.as_ref() == DESIGNATED_MARKER)
                .unwrap_or(false);
            designated.store(is_designated, Ordering::Relaxed);
        }
        W_DISCONNECT => {
            return Ok(false);
        }
        other => {
            warn!(command = other, "unexpected command from broker");
        }
    }
    Ok(true)
}

fn invoke_handler(
    handlers: &Arc<Mutex<HashMap<Bytes, Handler>>>,
    mut payload: Vec<Bytes>,
) -> HandlerResult {
    if payload.is_empty() {
        return Err(WorkerError::HandlerFailed("empty request payload".into()));
    }
    let name = payload.remove(0);
    let handler = handlers
        .lock()
        .expect("worker handler table poisoned")
        .get(&name)
        .cloned();
    match handler {
        Some(handler) => handler(payload),
        None => Err(WorkerError::HandlerFailed(format!(
            "no handler registered for {:?}",
            String::from_utf8_lossy(&name)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_handler_reports_missing_method() {
        let handlers: Arc<Mutex<HashMap<Bytes, Handler>>> = Arc::new(Mutex::new(HashMap::new()));
        let err = invoke_handler(&handlers, vec![Bytes::from_static(b"echo")]).unwrap_err();
        assert!(matches!(err, WorkerError::HandlerFailed(_)));
    }

    #[test]
    fn invoke_handler_dispatches_by_name() {
        let handlers: Arc<Mutex<HashMap<Bytes, Handler>>> = Arc::new(Mutex::new(HashMap::new()));
        handlers.lock().unwrap().insert(
            Bytes::from_static(b"echo"),
            Arc::new(|args: Vec<Bytes>| Ok(args)),
        );
        let reply =
            invoke_handler(&handlers, vec![Bytes::from_static(b"echo"), Bytes::from_static(b"hi")])
                .unwrap();
        assert_eq!(reply, vec![Bytes::from_static(b"hi")]);
    }

    #[test]
    fn invoke_handler_rejects_empty_payload() {
        let handlers: Arc<Mutex<HashMap<Bytes, Handler>>> = Arc::new(Mutex::new(HashMap::new()));
        assert!(invoke_handler(&handlers, vec![]).is_err());
    }
}
