//! Publish/subscribe sidecar: a topic-tagged fan-out channel riding the
//! same ZMTP transport as the broker, for out-of-band event delivery
//! (service-down notices, designation changes, etc.) that doesn't belong
//! on the request/reply fabric.
//!
//! [`Publisher`] owns a bounded producer queue drained by a background
//! sender task; [`Subscriber`] owns a background receive loop that applies
//! subscription changes sent over a small command channel. Both match the
//! "background task + producer queue" pattern from §9's design notes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{select, FutureExt};
use tracing::warn;

use mdp_core::endpoint::Endpoint;
use mdp_core::options::SocketOptions;
use mdp_core::tcp::enable_tcp_nodelay;
use mdp_zmtp::{PubSocket, SubSocket};

use crate::config::PubSubConfig;
use crate::error::PubSubError;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Publisher half of the sidecar: a single connection to a subscriber (or
/// forwarding) endpoint, fed by a bounded queue.
pub struct Publisher {
    endpoint: Endpoint,
    options: SocketOptions,
    active: std::sync::Arc<AtomicBool>,
    queue_tx: flume::Sender<(Bytes, Bytes)>,
    queue_rx: Option<flume::Receiver<(Bytes, Bytes)>>,
    stop_tx: Option<flume::Sender<()>>,
    done_rx: Option<flume::Receiver<()>>,
}

impl Publisher {
    /// Build a publisher that will connect to `endpoint` once
    /// [`start`](Self::start) is called. `active` starts `true`.
    #[must_use]
    pub fn new(endpoint: Endpoint, config: PubSubConfig) -> Self {
        Self::with_options(endpoint, config, SocketOptions::default())
    }

    /// As [`new`](Self::new), with custom transport options.
    #[must_use]
    pub fn with_options(endpoint: Endpoint, config: PubSubConfig, options: SocketOptions) -> Self {
        let (queue_tx, queue_rx) = flume::bounded(config.queue_capacity);
        Self {
            endpoint,
            options,
            active: std::sync::Arc::new(AtomicBool::new(true)),
            queue_tx,
            queue_rx: Some(queue_rx),
            stop_tx: None,
            done_rx: None,
        }
    }

    /// Start the background sender task.
    pub fn start(&mut self) {
        let Some(queue_rx) = self.queue_rx.take() else {
            return;
        };
        let (stop_tx, stop_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded(1);
        self.stop_tx = Some(stop_tx);
        self.done_rx = Some(done_rx);

        let endpoint = self.endpoint.clone();
        let options = self.options.clone();

        compio::runtime::spawn(async move {
            run_publisher(endpoint, options, queue_rx, stop_rx, done_tx).await;
        })
        .detach();
    }

    /// Atomically disable publishing; subsequent [`publish`](Self::publish)
    /// calls become silent no-ops until [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Re-enable publishing after [`suspend`](Self::suspend).
    pub fn resume(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// Push `(topic, event)` onto the send queue. Silently dropped while
    /// suspended, per §4.6.
    pub fn publish(
        &self,
        topic: impl Into<Bytes>,
        event: impl Into<Bytes>,
    ) -> Result<(), PubSubError> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.queue_tx
            .send((topic.into(), event.into()))
            .map_err(|_| PubSubError::QueueClosed)
    }

    /// Clear `active`, stop the background task once it has drained the
    /// queue, and release the socket.
    pub async fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(done_rx) = self.done_rx.take() {
            let _ = done_rx.recv_async().await;
        }
    }
}

async fn run_publisher(
    endpoint: Endpoint,
    options: SocketOptions,
    queue_rx: flume::Receiver<(Bytes, Bytes)>,
    stop_rx: flume::Receiver<()>,
    done_tx: flume::Sender<()>,
) {
    'reconnect: loop {
        if stop_rx.try_recv().is_ok() {
            drain_and_stop(None, &queue_rx).await;
            break 'reconnect;
        }

        let mut socket = match connect_pub(&endpoint, &options).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "publisher connect failed, retrying");
                compio::time::sleep(RECONNECT_DELAY).await;
                continue 'reconnect;
            }
        };

        loop {
            select! {
                stop = stop_rx.recv_async().fuse() => {
                    if stop.is_ok() {
                        drain_and_stop(Some(&mut socket), &queue_rx).await;
                        break 'reconnect;
                    }
                }
                item = queue_rx.recv_async().fuse() => {
                    match item {
                        Ok((topic, payload)) => {
                            if let Err(e) = socket.send(vec![topic, payload]).await {
                                warn!(error = %e, "publish failed, rebuilding socket");
                                break;
                            }
                        }
                        Err(_) => break 'reconnect,
                    }
                }
            }
        }

        compio::time::sleep(RECONNECT_DELAY).await;
    }
    let _ = done_tx.send_async(()).await;
}

async fn drain_and_stop(mut socket: Option<&mut PubSocket>, queue_rx: &flume::Receiver<(Bytes, Bytes)>) {
    while let Ok((topic, payload)) = queue_rx.try_recv() {
        if let Some(socket) = socket.as_deref_mut() {
            let _ = socket.send(vec![topic, payload]).await;
        }
    }
}

async fn connect_pub(endpoint: &Endpoint, options: &SocketOptions) -> std::io::Result<PubSocket> {
    PubSocket::connect(endpoint.clone(), options.clone()).await
}

/// Subscriber half of the sidecar: applies subscription changes and
/// dispatches decoded `(topic, payload)` pairs to a user callback.
pub struct Subscriber {
    endpoint: Endpoint,
    options: SocketOptions,
    config: PubSubConfig,
    cmd_tx: flume::Sender<SubCommand>,
    cmd_rx: Option<flume::Receiver<SubCommand>>,
    stop_tx: Option<flume::Sender<()>>,
    done_rx: Option<flume::Receiver<()>>,
}

enum SubCommand {
    Subscribe(Bytes),
    Unsubscribe(Bytes),
}

impl Subscriber {
    /// Build a subscriber that will connect to `endpoint` once
    /// [`start`](Self::start) is called.
    #[must_use]
    pub fn new(endpoint: Endpoint, config: PubSubConfig) -> Self {
        Self::with_options(endpoint, config, SocketOptions::default())
    }

    /// As [`new`](Self::new), with custom transport options.
    #[must_use]
    pub fn with_options(endpoint: Endpoint, config: PubSubConfig, options: SocketOptions) -> Self {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        Self {
            endpoint,
            options,
            config,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            stop_tx: None,
            done_rx: None,
        }
    }

    /// Subscribe to messages whose topic starts with `prefix`. An empty
    /// prefix subscribes to everything. Can be called before or after
    /// [`start`](Self::start).
    pub fn subscribe(&self, prefix: impl Into<Bytes>) {
        let _ = self.cmd_tx.send(SubCommand::Subscribe(prefix.into()));
    }

    /// Remove a previously added subscription prefix.
    pub fn unsubscribe(&self, prefix: impl Into<Bytes>) {
        let _ = self.cmd_tx.send(SubCommand::Unsubscribe(prefix.into()));
    }

    /// Start the background receive loop, invoking `on_message(topic,
    /// payload)` for every matching message.
    pub fn start<F>(&mut self, on_message: F)
    where
        F: Fn(Bytes, Bytes) + Send + Sync + 'static,
    {
        let Some(cmd_rx) = self.cmd_rx.take() else {
            return;
        };
        let (stop_tx, stop_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded(1);
        self.stop_tx = Some(stop_tx);
        self.done_rx = Some(done_rx);

        let endpoint = self.endpoint.clone();
        let options = self.options.clone();
        let tolerance = self.config.keep_alive_tolerance;

        compio::runtime::spawn(async move {
            run_subscriber(endpoint, options, tolerance, cmd_rx, stop_rx, on_message).await;
            let _ = done_tx.send_async(()).await;
        })
        .detach();
    }

    /// Stop the background receive loop and release the socket.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(done_rx) = self.done_rx.take() {
            let _ = done_rx.recv_async().await;
        }
    }
}

async fn run_subscriber<F>(
    endpoint: Endpoint,
    options: SocketOptions,
    tolerance: Duration,
    cmd_rx: flume::Receiver<SubCommand>,
    stop_rx: flume::Receiver<()>,
    on_message: F,
) where
    F: Fn(Bytes, Bytes) + Send + Sync + 'static,
{
    let mut pending_subs: Vec<Bytes> = Vec::new();

    'reconnect: loop {
        if stop_rx.try_recv().is_ok() {
            break 'reconnect;
        }

        let mut socket = match connect_sub(&endpoint, &options).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "subscriber connect failed, retrying");
                compio::time::sleep(RECONNECT_DELAY).await;
                continue 'reconnect;
            }
        };
        for prefix in pending_subs.drain(..) {
            socket.subscribe(prefix);
        }

        loop {
            select! {
                stop = stop_rx.recv_async().fuse() => {
                    if stop.is_ok() {
                        break 'reconnect;
                    }
                }
                cmd = cmd_rx.recv_async().fuse() => {
                    match cmd {
                        Ok(SubCommand::Subscribe(prefix)) => socket.subscribe(prefix),
                        Ok(SubCommand::Unsubscribe(prefix)) => socket.unsubscribe(&prefix),
                        Err(_) => break 'reconnect,
                    }
                }
                recv = socket.recv().fuse() => {
                    match recv {
                        Ok(Some(mut frames)) => {
                            if frames.len() != 2 {
                                warn!(frames = frames.len(), "malformed pub/sub frame, dropping");
                                continue;
                            }
                            let payload = frames.pop().unwrap();
                            let topic = frames.pop().unwrap();
                            on_message(topic, payload);
                        }
                        Ok(None) => {
                            warn!("publisher connection closed, reconnecting");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "subscriber recv error, reconnecting");
                            break;
                        }
                    }
                }
                _ = compio::time::sleep(tolerance).fuse() => {}
            }
        }

        compio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_sub(endpoint: &Endpoint, options: &SocketOptions) -> std::io::Result<SubSocket> {
    let addr = match endpoint {
        Endpoint::Tcp(addr) => *addr,
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("SUB connect over TCP requires a tcp:// endpoint, got {other}"),
            ))
        }
    };
    let stream = compio::net::TcpStream::connect(addr).await?;
    enable_tcp_nodelay(&stream)?;
    SubSocket::with_options(stream, options.clone()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspended_publisher_drops_silently() {
        let publisher = Publisher::new(
            Endpoint::parse("tcp://127.0.0.1:0").unwrap(),
            PubSubConfig::default(),
        );
        publisher.suspend();
        assert!(publisher.publish(Bytes::from_static(b"topic"), Bytes::from_static(b"x")).is_ok());
        // Queue stays empty: nothing was pushed while suspended.
        assert!(publisher.queue_rx.as_ref().unwrap().is_empty());
    }

    #[test]
    fn active_publisher_queues_events() {
        let publisher = Publisher::new(
            Endpoint::parse("tcp://127.0.0.1:0").unwrap(),
            PubSubConfig::default(),
        );
        publisher
            .publish(Bytes::from_static(b"topic"), Bytes::from_static(b"x"))
            .unwrap();
        assert_eq!(publisher.queue_rx.as_ref().unwrap().len(), 1);
    }
}
