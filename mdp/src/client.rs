//! Asynchronous client session: request/reply correlation over one
//! background-owned [`DealerSocket`].
//!
//! [`AsyncClient::send`] only ever touches a producer-facing queue — the
//! actual socket I/O happens on the session's one background task, per §5.
//! Outstanding-request bookkeeping (mapping an id back to its submission
//! time or service) is explicitly left to the caller (§4.5): the core only
//! guarantees request ids are unique and that replies carry the id back.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{select, FutureExt};
use tracing::warn;

use mdp_core::endpoint::Endpoint;
use mdp_core::options::SocketOptions;
use mdp_zmtp::DealerSocket;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::{c_client_frame, is_tag, C_CLIENT};

/// Callback invoked on the background task whenever a reply arrives.
pub type ReplyCallback = dyn Fn(Bytes, Vec<Bytes>) + Send + Sync;

/// Asynchronous client session, correlating replies to requests by id.
pub struct AsyncClient {
    config: ClientConfig,
    endpoint: Endpoint,
    options: SocketOptions,
    request_tx: flume::Sender<Vec<Bytes>>,
    request_rx: Option<flume::Receiver<Vec<Bytes>>>,
    reply_tx: flume::Sender<(Bytes, Vec<Bytes>)>,
    reply_rx: flume::Receiver<(Bytes, Vec<Bytes>)>,
    on_reply: Arc<Mutex<Option<Box<ReplyCallback>>>>,
    stop_tx: Option<flume::Sender<()>>,
    done_rx: Option<flume::Receiver<()>>,
}

impl AsyncClient {
    /// Build a client session that will connect to `endpoint` once
    /// [`start`](Self::start) is called.
    #[must_use]
    pub fn new(endpoint: Endpoint, config: ClientConfig) -> Self {
        Self::with_options(endpoint, config, SocketOptions::default())
    }

    /// As [`new`](Self::new), with custom transport options.
    #[must_use]
    pub fn with_options(endpoint: Endpoint, config: ClientConfig, options: SocketOptions) -> Self {
        let (request_tx, request_rx) = flume::unbounded();
        let (reply_tx, reply_rx) = flume::unbounded();
        Self {
            config,
            endpoint,
            options,
            request_tx,
            request_rx: Some(request_rx),
            reply_tx,
            reply_rx,
            on_reply: Arc::new(Mutex::new(None)),
            stop_tx: None,
            done_rx: None,
        }
    }

    /// Register a callback invoked (on the background task) as soon as a
    /// reply is decoded, in addition to it being queued for [`recv`](Self::recv).
    pub fn on_reply<F>(&self, callback: F)
    where
        F: Fn(Bytes, Vec<Bytes>) + Send + Sync + 'static,
    {
        *self.on_reply.lock().expect("on_reply callback poisoned") = Some(Box::new(callback));
    }

    /// Start the background connect/send/receive task. Calling this twice
    /// is a no-op after the first call consumes the internal request
    /// channel.
    pub fn start(&mut self) {
        let Some(request_rx) = self.request_rx.take() else {
            return;
        };
        let (stop_tx, stop_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded(1);
        self.stop_tx = Some(stop_tx);
        self.done_rx = Some(done_rx);

        let endpoint = self.endpoint.clone();
        let options = self.options.clone();
        let reply_tx = self.reply_tx.clone();
        let on_reply = self.on_reply.clone();

        compio::runtime::spawn(async move {
            run(endpoint, options, request_rx, reply_tx, on_reply, stop_rx, done_tx).await;
        })
        .detach();
    }

    /// Enqueue a request for `service` and return the id the broker will
    /// echo back on the matching reply. Non-blocking: the actual send
    /// happens on the background task.
    pub fn send(&self, service: impl Into<Bytes>, payload: Vec<Bytes>) -> Bytes {
        let request_id = generate_request_id();
        let mut frames = vec![
            Bytes::new(),
            c_client_frame(),
            service.into(),
            request_id.clone(),
        ];
        frames.extend(payload);
        // The background task owns the only consumer of this channel; if
        // it has exited the request is simply dropped, matching "no
        // retransmission by the core" in §4.5.
        let _ = self.request_tx.send(frames);
        request_id
    }

    /// Pop the next reply, waiting up to [`ClientConfig::recv_timeout`].
    /// Returns `None` on timeout or if the session has been closed; see
    /// [`try_recv`](Self::try_recv) to distinguish the two.
    pub async fn recv(&self) -> Option<(Bytes, Vec<Bytes>)> {
        self.try_recv().await.ok()
    }

    /// As [`recv`](Self::recv), surfacing *why* no reply came back:
    /// [`ClientError::Timeout`] if [`ClientConfig::recv_timeout`] elapsed
    /// first, [`ClientError::Closed`] if the background task has exited.
    pub async fn try_recv(&self) -> Result<(Bytes, Vec<Bytes>), ClientError> {
        match compio::time::timeout(self.config.recv_timeout, self.reply_rx.recv_async()).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Stop the background task and release the transport.
    pub async fn close(&mut self) {
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
    request_rx: flume::Receiver<Vec<Bytes>>,
    reply_tx: flume::Sender<(Bytes, Vec<Bytes>)>,
    on_reply: Arc<Mutex<Option<Box<ReplyCallback>>>>,
    stop_rx: flume::Receiver<()>,
    done_tx: flume::Sender<()>,
) {
    'reconnect: loop {
        if stop_rx.try_recv().is_ok() {
            break 'reconnect;
        }

        let mut dealer = match DealerSocket::connect(endpoint.clone(), options.clone()).await {
            Ok(dealer) => dealer,
            Err(e) => {
                warn!(error = %e, "client connect failed, retrying");
                compio::time::sleep(std::time::Duration::from_millis(500)).await;
                continue 'reconnect;
            }
        };

        loop {
            select! {
                stop = stop_rx.recv_async().fuse() => {
                    if stop.is_ok() {
                        break 'reconnect;
                    }
                }
                outgoing = request_rx.recv_async().fuse() => {
                    match outgoing {
                        Ok(frames) => {
                            if let Err(e) = dealer.send(frames).await {
                                warn!(error = %e, "client send failed, rebuilding socket");
                                break;
                            }
                        }
                        Err(_) => break 'reconnect,
                    }
                }
                incoming = dealer.recv().fuse() => {
                    match incoming {
                        Ok(Some(mut frames)) => {
                            if let Some((request_id, payload)) = decode_reply(&mut frames) {
                                if let Some(cb) = on_reply.lock().expect("on_reply callback poisoned").as_ref() {
                                    cb(request_id.clone(), payload.clone());
                                }
                                let _ = reply_tx.send((request_id, payload));
                            }
                        }
                        Ok(None) => {
                            warn!("broker connection closed, reconnecting");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "client recv error, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        compio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    let _ = done_tx.send_async(()).await;
}

/// Strip `[EMPTY, C_CLIENT, service_name, request_id]` off a broker reply,
/// returning the request id and the remaining opaque payload frames.
fn decode_reply(frames: &mut Vec<Bytes>) -> Option<(Bytes, Vec<Bytes>)> {
    if frames.len() < 4 {
        return None;
    }
    let empty = frames.remove(0);
    if !empty.is_empty() {
        return None;
    }
    let header = frames.remove(0);
    if !is_tag(&header, C_CLIENT) {
        return None;
    }
    let _service = frames.remove(0);
    let request_id = frames.remove(0);
    Some((request_id, frames.drain(..).collect()))
}

/// A compact, unique request id: a v4 UUID in plain hex (no hyphens).
fn generate_request_id() -> Bytes {
    Bytes::from(uuid::Uuid::new_v4().simple().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }

    #[test]
    fn decode_reply_strips_envelope() {
        let mut frames = vec![
            Bytes::new(),
            c_client_frame(),
            Bytes::from_static(b"ECHO"),
            Bytes::from_static(b"req-1"),
            Bytes::from_static(b"payload"),
        ];
        let (id, payload) = decode_reply(&mut frames).unwrap();
        assert_eq!(id, Bytes::from_static(b"req-1"));
        assert_eq!(payload, vec![Bytes::from_static(b"payload")]);
    }

    #[test]
    fn decode_reply_rejects_short_messages() {
        let mut frames = vec![Bytes::new(), c_client_frame()];
        assert!(decode_reply(&mut frames).is_none());
    }

    #[compio::test]
    async fn try_recv_times_out_when_no_reply_arrives() {
        let client = AsyncClient::new(
            mdp_core::endpoint::Endpoint::parse("tcp://127.0.0.1:0").unwrap(),
            ClientConfig { recv_timeout: std::time::Duration::from_millis(10) },
        );
        let err = client.try_recv().await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
    }
}
