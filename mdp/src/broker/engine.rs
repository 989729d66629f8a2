//! The broker event loop.
//!
//! `Broker` owns every piece of mutable state (service registry, worker
//! registry, per-peer outbound channels) and only ever touches it from the
//! single task that runs [`Broker::mediate`]. Everything else — accepted
//! connections, decoded frames, disconnects — arrives as an [`Inbound`]
//! event over a channel, the same funnel pattern the router hub in the
//! teacher crate uses for its peer table.

use std::time::Instant;

use bytes::Bytes;
use hashbrown::HashMap;
use tracing::{info, warn};

use compio::net::TcpListener;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::protocol::{
    c_client_frame, is_reserved_service, is_tag, w_worker_frame, worker_command_bytes, C_CLIENT,
    MMI_SERVICE, MMI_STATUS_NOT_FOUND, MMI_STATUS_NOT_IMPLEMENTED, MMI_STATUS_OK, W_DISCONNECT,
    W_HEARTBEAT, W_READY, W_REPLY, W_REQUEST, W_WORKER,
};

use super::service::{RequestEnvelope, Service};
use super::transport::{accept_loop, Inbound};
use super::worker::Worker;

/// The Majordomo-style broker: a single ROUTER-style listener fanning into
/// one event loop, dispatching client requests to workers per-service with
/// optional workholic affinity.
pub struct Broker {
    config: BrokerConfig,
    services: HashMap<Bytes, Service>,
    workers: HashMap<Bytes, Worker>,
    /// Broker-wide idle queue. Re-sorted by expiry at the top of every
    /// `purge_workers` call — a heartbeat refreshes a worker's expiry in
    /// place without repositioning it here, so append order alone does not
    /// track expiry order.
    waiting: std::collections::VecDeque<Bytes>,
    /// One outbound sender per connected peer, written to by the broker,
    /// drained by that peer's connection task (see `transport::serve_peer`).
    peers: HashMap<Bytes, flume::Sender<Vec<Bytes>>>,
    inbound_tx: flume::Sender<Inbound>,
    inbound_rx: flume::Receiver<Inbound>,
    heartbeat_at: Instant,
    service_timeout_at: Instant,
}

impl Broker {
    /// Construct a broker with the given timing configuration. Call
    /// [`Broker::bind`] to start accepting connections, then
    /// [`Broker::mediate`] to run the event loop.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let (inbound_tx, inbound_rx) = flume::unbounded();
        let now = Instant::now();
        Self {
            heartbeat_at: now + config.heartbeat_interval,
            service_timeout_at: now + config.service_timeout,
            services: HashMap::new(),
            workers: HashMap::new(),
            waiting: std::collections::VecDeque::new(),
            peers: HashMap::new(),
            inbound_tx,
            inbound_rx,
            config,
        }
    }

    /// Bind the listener and spawn the accept loop. Can only be called once
    /// per broker; binding multiple endpoints would need one listener task
    /// each feeding the same `inbound_tx`, which this method does not
    /// preclude if called again with a fresh `TcpListener`.
    pub async fn bind(&self, endpoint: &str) -> Result<(), BrokerError> {
        let addr = parse_tcp_endpoint(endpoint)?;
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(%endpoint, "address in use, attempting to reclaim port");
                if crate::port_reclaim::try_reclaim(&mdp_core::endpoint::Endpoint::Tcp(addr)) {
                    TcpListener::bind(addr)
                        .await
                        .map_err(|_| BrokerError::EndpointInUse(endpoint.to_string()))?
                } else {
                    return Err(BrokerError::EndpointInUse(endpoint.to_string()));
                }
            }
            Err(e) => return Err(BrokerError::Transport(e)),
        };
        info!(%endpoint, "broker listening");
        let tx = self.inbound_tx.clone();
        compio::runtime::spawn(async move {
            accept_loop(listener, tx).await;
        })
        .detach();
        Ok(())
    }

    /// Run the broker's main loop. Returns once the inbound channel closes,
    /// which only happens if every sender (held by this struct and every
    /// peer task) has been dropped.
    pub async fn mediate(&mut self) {
        loop {
            use futures::{select, FutureExt};

            select! {
                msg = self.inbound_rx.recv_async().fuse() => {
                    match msg {
                        Ok(event) => self.handle_inbound(event),
                        Err(_) => break,
                    }
                }
                _ = compio::time::sleep(self.config.heartbeat_interval).fuse() => {}
            }

            self.purge_workers();
            self.send_heartbeats();

            let now = Instant::now();
            if now > self.service_timeout_at {
                self.check_service_timeouts(now);
                self.service_timeout_at = now + self.config.service_timeout;
            }
        }
    }

    /// Disconnect every known worker and drop all peer channels. Intended
    /// for graceful shutdown paths (tests, signal handlers).
    pub fn destroy(&mut self) {
        let identities: Vec<Bytes> = self.workers.keys().cloned().collect();
        for identity in identities {
            self.delete_worker(&identity, true);
        }
        self.peers.clear();
    }

    fn handle_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Connected { identity, outbound } => {
                self.peers.insert(identity, outbound);
            }
            Inbound::Disconnected { identity } => {
                self.peers.remove(&identity);
                if self.workers.contains_key(&identity) {
                    self.delete_worker(&identity, false);
                }
            }
            Inbound::Message { identity, frames } => self.handle_message(identity, frames),
        }
    }

    fn handle_message(&mut self, sender: Bytes, mut frames: Vec<Bytes>) {
        if frames.is_empty() {
            let err = BrokerError::MalformedMultipart("empty message".into());
            warn!(identity = ?sender, error = %err, "dropping message");
            return;
        }
        let empty = frames.remove(0);
        if !empty.is_empty() {
            let err = BrokerError::MalformedMultipart("missing empty delimiter".into());
            warn!(identity = ?sender, error = %err, "dropping message");
            return;
        }
        if frames.is_empty() {
            let err = BrokerError::MalformedMultipart("no protocol header".into());
            warn!(identity = ?sender, error = %err, "dropping message");
            return;
        }
        let header = frames.remove(0);
        if is_tag(&header, C_CLIENT) {
            self.process_client(sender, frames);
        } else if is_tag(&header, W_WORKER) {
            self.process_worker(sender, frames);
        } else {
            warn!(identity = ?sender, header = ?header, "invalid protocol header");
        }
    }

    /// Handle a request coming from a client.
    fn process_client(&mut self, sender: Bytes, mut msg: Vec<Bytes>) {
        if msg.len() < 2 {
            warn!(identity = ?sender, "client message missing service name or body");
            return;
        }
        let service_name = msg.remove(0);
        let mut envelope: RequestEnvelope = vec![sender, Bytes::new()];
        envelope.extend(msg);

        if is_reserved_service(&service_name) {
            self.service_internal(&service_name, envelope);
        } else {
            let now = Instant::now();
            self.require_service(service_name.clone(), now);
            self.dispatch(service_name, Some(envelope));
        }
    }

    /// Handle a command coming from a worker.
    fn process_worker(&mut self, sender: Bytes, mut msg: Vec<Bytes>) {
        if msg.is_empty() {
            warn!(identity = ?sender, "worker message missing command");
            return;
        }
        let command = msg.remove(0);
        let command = command.first().copied().unwrap_or(0);

        let worker_ready = self.workers.contains_key(&sender);
        self.require_worker(sender.clone());

        match command {
            W_READY => {
                if msg.is_empty() {
                    warn!(identity = ?sender, "READY missing service name");
                    return;
                }
                let service_name = msg.remove(0);
                if worker_ready || is_reserved_service(&service_name) {
                    self.delete_worker(&sender, true);
                } else {
                    let now = Instant::now();
                    self.require_service(service_name.clone(), now);
                    if let Some(worker) = self.workers.get_mut(&sender) {
                        worker.service = service_name;
                    }
                    info!(identity = ?sender, service = ?self.workers.get(&sender).map(|w| w.service.clone()), "worker ready");
                    self.worker_waiting(&sender);
                }
            }
            W_REPLY => {
                if worker_ready {
                    if msg.len() < 2 {
                        warn!(identity = ?sender, "REPLY missing client envelope");
                        return;
                    }
                    let client = msg.remove(0);
                    let _empty = msg.remove(0);
                    let service_name = self
                        .workers
                        .get(&sender)
                        .map(|w| w.service.clone())
                        .unwrap_or_default();

                    let mut reply = vec![client, Bytes::new(), c_client_frame(), service_name];
                    reply.extend(msg);
                    self.send_frames(&sender_of(&reply), reply);
                    self.worker_waiting(&sender);
                } else {
                    self.delete_worker(&sender, true);
                }
            }
            W_HEARTBEAT => {
                if worker_ready {
                    if let Some(worker) = self.workers.get_mut(&sender) {
                        worker.refresh_expiry(Instant::now(), self.config.heartbeat_expiry());
                    }
                } else {
                    self.delete_worker(&sender, true);
                }
            }
            W_DISCONNECT => {
                self.delete_worker(&sender, false);
            }
            other => {
                warn!(identity = ?sender, command = other, "invalid worker command");
            }
        }
    }

    /// Answer the reserved `mmi.*` meta-service directly, without involving
    /// a worker.
    fn service_internal(&mut self, service_name: &Bytes, mut envelope: RequestEnvelope) {
        let status: &[u8] = if service_name.as_ref() == MMI_SERVICE {
            let queried = envelope.last().cloned().unwrap_or_default();
            if self.services.contains_key(&queried) {
                MMI_STATUS_OK
            } else {
                MMI_STATUS_NOT_FOUND
            }
        } else {
            MMI_STATUS_NOT_IMPLEMENTED
        };
        if let Some(last) = envelope.last_mut() {
            *last = Bytes::copy_from_slice(status);
        } else {
            envelope.push(Bytes::copy_from_slice(status));
        }

        // envelope is [client, empty, ...body]; splice the protocol header
        // and service name in after the routing prefix.
        let client = envelope[0].clone();
        let empty = envelope[1].clone();
        let mut reply = vec![client.clone(), empty, c_client_frame(), service_name.clone()];
        reply.extend(envelope.into_iter().skip(2));
        self.send_frames(&client, reply);
    }

    /// Find or create the worker entry for `identity`.
    fn require_worker(&mut self, identity: Bytes) {
        self.workers.entry(identity.clone()).or_insert_with(|| {
            info!(identity = ?identity, "registering new worker");
            Worker::new(identity, Bytes::new(), Instant::now() + self.config.heartbeat_expiry())
        });
    }

    /// Find or create the service entry named `name`, refreshing its
    /// activity timestamp either way.
    fn require_service(&mut self, name: Bytes, now: Instant) {
        let service = self.services.entry(name.clone()).or_insert_with(|| {
            info!(service = ?name, "adding new service");
            Service::new(name, now)
        });
        service.touch(now);
    }

    /// Remove `identity` from every data structure that references it.
    fn delete_worker(&mut self, identity: &Bytes, disconnect: bool) {
        if disconnect {
            self.send_to_worker(identity, W_DISCONNECT, None, None);
        }

        if let Some(worker) = self.workers.remove(identity) {
            if !worker.service.is_empty() {
                if let Some(service) = self.services.get_mut(&worker.service) {
                    service.waiting.retain(|w| w != identity);
                    if service.workholic_mode && service.designated_worker.as_ref() == Some(identity) {
                        service.designated_worker = service.waiting.front().cloned();
                        info!(service = ?service.name, designated = ?service.designated_worker, "designated worker changed");
                    }
                    // Only reclaim the service immediately if nothing is
                    // left to serve. A service with a non-empty request
                    // queue outlives its last worker so a reconnecting
                    // worker can drain the backlog; it's still subject to
                    // `check_service_timeouts` if nobody ever reconnects.
                    let now_idle = service.waiting.is_empty() && service.requests.is_empty();
                    if now_idle {
                        let name = service.name.clone();
                        self.services.remove(&name);
                        info!(service = ?name, "deleting service");
                    }
                }
            }
            info!(identity = ?identity, "deleting worker");
        }

        self.waiting.retain(|w| w != identity);
    }

    /// Look for and purge expired workers. A heartbeat refreshes a worker's
    /// expiry in place without moving it within `waiting`, so oldest-expiry
    /// isn't necessarily at the front; re-sort by expiry first, as the
    /// original `mdbroker.py` does, then pop-front while the candidate has
    /// expired.
    fn purge_workers(&mut self) {
        let now = Instant::now();
        let workers = &self.workers;
        self.waiting
            .make_contiguous()
            .sort_by_key(|identity| workers.get(identity).map(|w| w.expiry));
        while let Some(identity) = self.waiting.front().cloned() {
            let expired = self
                .workers
                .get(&identity)
                .map(|w| w.expiry < now)
                .unwrap_or(true);
            if expired {
                info!(identity = ?identity, "deleting expired worker");
                self.delete_worker(&identity, false);
            } else {
                break;
            }
        }
    }

    /// Send heartbeats to every idle worker once per heartbeat interval.
    fn send_heartbeats(&mut self) {
        let now = Instant::now();
        if now <= self.heartbeat_at {
            return;
        }
        let waiting: Vec<Bytes> = self.waiting.iter().cloned().collect();
        for identity in waiting {
            let designated = self
                .workers
                .get(&identity)
                .and_then(|w| self.services.get(&w.service))
                .map(|s| s.designated_worker.as_ref() == Some(&identity))
                .unwrap_or(false);
            let marker = if designated {
                Some(Bytes::from_static(crate::protocol::DESIGNATED_MARKER))
            } else {
                None
            };
            self.send_to_worker(&identity, W_HEARTBEAT, marker, None);
        }
        self.heartbeat_at = now + self.config.heartbeat_interval;
    }

    /// Delete any service that has no waiting workers and has not been
    /// touched for longer than `service_timeout`.
    fn check_service_timeouts(&mut self, now: Instant) {
        let expired: Vec<Bytes> = self
            .services
            .values()
            .filter(|s| s.is_expired(now, self.config.service_timeout))
            .map(|s| s.name.clone())
            .collect();
        for name in expired {
            self.services.remove(&name);
            info!(service = ?name, "deleting timed-out service");
        }
    }

    /// Mark `identity` as idle, designating it as its service's affinity
    /// target if none is set yet, then attempt dispatch.
    fn worker_waiting(&mut self, identity: &Bytes) {
        let service_name = match self.workers.get(identity) {
            Some(w) => w.service.clone(),
            None => return,
        };
        if let Some(service) = self.services.get_mut(&service_name) {
            if service.workholic_mode && service.designated_worker.is_none() {
                service.designated_worker = Some(identity.clone());
                info!(service = ?service.name, designated = ?identity, "designated worker assigned");
            }
            service.waiting.push_back(identity.clone());
        }
        self.waiting.push_back(identity.clone());
        if let Some(worker) = self.workers.get_mut(identity) {
            worker.refresh_expiry(Instant::now(), self.config.heartbeat_expiry());
        }
        self.dispatch(service_name, None);
    }

    /// Match queued requests against waiting workers for `service_name`.
    /// With `msg` provided, first enqueue it.
    fn dispatch(&mut self, service_name: Bytes, msg: Option<RequestEnvelope>) {
        if let Some(msg) = msg {
            if let Some(service) = self.services.get_mut(&service_name) {
                service.requests.push_back(msg);
            }
        }
        self.purge_workers();

        let workholic = self
            .services
            .get(&service_name)
            .map(|s| s.workholic_mode)
            .unwrap_or(false);

        if workholic {
            self.dispatch_workholic(&service_name);
        } else {
            loop {
                let next = match self.services.get_mut(&service_name) {
                    Some(service) if !service.waiting.is_empty() && !service.requests.is_empty() => {
                        let worker = service.waiting.pop_front().unwrap();
                        let req = service.requests.pop_front().unwrap();
                        Some((worker, req))
                    }
                    _ => None,
                };
                match next {
                    Some((worker, req)) => {
                        self.waiting.retain(|w| w != &worker);
                        self.send_to_worker(&worker, W_REQUEST, None, Some(req));
                    }
                    None => break,
                }
            }
        }
    }

    /// Workholic affinity dispatch: pin all requests to the designated
    /// worker when it is reachable, otherwise promote the next idle worker
    /// to become the new designated worker.
    fn dispatch_workholic(&mut self, service_name: &Bytes) {
        let has_requests = self
            .services
            .get(service_name)
            .map(|s| !s.requests.is_empty())
            .unwrap_or(false);
        if !has_requests {
            return;
        }

        let designated = self
            .services
            .get(service_name)
            .and_then(|s| s.designated_worker.clone());

        match designated {
            Some(designated) if self.workers.contains_key(&designated) => {
                let service = match self.services.get_mut(service_name) {
                    Some(s) => s,
                    None => return,
                };
                if let Some(pos) = service.waiting.iter().position(|w| w == &designated) {
                    service.waiting.remove(pos);
                    let req = service.requests.pop_front();
                    if let Some(req) = req {
                        self.waiting.retain(|w| w != &designated);
                        self.send_to_worker(&designated, W_REQUEST, None, Some(req));
                    }
                }
                // Designated worker online but busy: leave the request queued.
            }
            _ => {
                let service = match self.services.get_mut(service_name) {
                    Some(s) => s,
                    None => return,
                };
                if service.requests.is_empty() || service.waiting.is_empty() {
                    return;
                }
                let worker = service.waiting.pop_front().unwrap();
                let req = service.requests.pop_front().unwrap();
                service.designated_worker = Some(worker.clone());
                info!(service = ?service_name, designated = ?worker, "designated worker promoted");
                self.waiting.retain(|w| w != &worker);
                self.send_to_worker(&worker, W_REQUEST, None, Some(req));
            }
        }
    }

    /// Build and send a `[empty, W_WORKER, command, option?, msg...]`
    /// envelope to `identity`'s connection task.
    fn send_to_worker(
        &mut self,
        identity: &Bytes,
        command: u8,
        option: Option<Bytes>,
        msg: Option<RequestEnvelope>,
    ) {
        let mut frames = vec![identity.clone(), Bytes::new(), w_worker_frame(), worker_command_bytes(command)];
        if let Some(option) = option {
            frames.push(option);
        }
        if let Some(msg) = msg {
            frames.extend(msg);
        }
        self.send_frames(identity, frames);
    }

    /// Hand `frames` to `identity`'s connection task, dropping silently if
    /// the peer is no longer connected (mirrors ZMQ ROUTER's "unknown
    /// identity" behavior).
    fn send_frames(&self, identity: &Bytes, frames: Vec<Bytes>) {
        if let Some(tx) = self.peers.get(identity) {
            let _ = tx.send(frames);
        }
    }
}

fn sender_of(frames: &[Bytes]) -> Bytes {
    frames[0].clone()
}

fn parse_tcp_endpoint(endpoint: &str) -> Result<std::net::SocketAddr, BrokerError> {
    let rest = endpoint
        .strip_prefix("tcp://")
        .ok_or_else(|| BrokerError::InvalidEndpoint(endpoint.to_string()))?;
    let rest = rest.replace("*", "0.0.0.0");
    rest.parse()
        .map_err(|_| BrokerError::InvalidEndpoint(endpoint.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_endpoint() {
        let addr = parse_tcp_endpoint("tcp://*:5555").unwrap();
        assert_eq!(addr.port(), 5555);
    }

    #[test]
    fn rejects_non_tcp_endpoint() {
        assert!(parse_tcp_endpoint("ipc:///tmp/x").is_err());
    }
}
