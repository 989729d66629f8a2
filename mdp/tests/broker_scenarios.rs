//! End-to-end broker scenarios: a real bound listener, real worker and
//! client sessions, and a live event loop task, all talking over loopback
//! TCP. Timing configs are tightened well below the production defaults so
//! heartbeat/expiry/GC behavior is observable on a short test budget.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use mdp::config::{BrokerConfig, ClientConfig, WorkerConfig};
use mdp::protocol::{w_worker_frame, worker_command_bytes, W_READY, W_REPLY, W_REQUEST, REPLY_OK};
use mdp::{AsyncClient, Broker, WorkerSession};
use mdp_core::endpoint::Endpoint;
use mdp_core::options::SocketOptions;
use mdp_zmtp::DealerSocket;

fn broker_config() -> BrokerConfig {
    BrokerConfig {
        heartbeat_liveness: 3,
        heartbeat_interval: Duration::from_millis(30),
        service_timeout: Duration::from_millis(150),
        endpoint: String::new(),
    }
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        heartbeat_liveness: 3,
        heartbeat_interval: Duration::from_millis(30),
        reconnect_delay: Duration::from_millis(100),
    }
}

fn client_config() -> ClientConfig {
    ClientConfig { recv_timeout: Duration::from_millis(1000) }
}

/// Bind a broker to a free loopback port and run its event loop on a
/// detached task, returning the endpoint workers/clients dial into.
async fn spawn_broker(config: BrokerConfig) -> Endpoint {
    let port = portpicker::pick_unused_port().expect("no free port available");
    let endpoint_str = format!("tcp://127.0.0.1:{port}");
    let mut broker = Broker::new(config);
    broker.bind(&endpoint_str).await.expect("broker bind");
    compio::runtime::spawn(async move {
        broker.mediate().await;
    })
    .detach();
    Endpoint::parse(&endpoint_str).unwrap()
}

/// Connect a bare `DealerSocket` and send `READY` for `service`, bypassing
/// `WorkerSession` entirely. Used where a test needs to control exactly
/// when (or whether) heartbeats and replies go out.
async fn raw_ready(endpoint: Endpoint, service: &str) -> DealerSocket {
    let mut dealer = DealerSocket::connect(endpoint, SocketOptions::default())
        .await
        .expect("raw dealer connect");
    dealer
        .send(vec![
            Bytes::new(),
            w_worker_frame(),
            worker_command_bytes(W_READY),
            Bytes::copy_from_slice(service.as_bytes()),
        ])
        .await
        .expect("raw READY send");
    dealer
}

/// Receive one `W_REQUEST` off `dealer`, returning `(client, client_empty,
/// request_id, payload)`.
async fn raw_recv_request(dealer: &mut DealerSocket) -> (Bytes, Bytes, Bytes, Vec<Bytes>) {
    let mut frames = dealer
        .recv()
        .await
        .expect("raw recv")
        .expect("broker connection open");
    let _empty = frames.remove(0);
    let _header = frames.remove(0);
    let command = frames.remove(0).first().copied().unwrap_or(0);
    assert_eq!(command, W_REQUEST);
    let client = frames.remove(0);
    let client_empty = frames.remove(0);
    let request_id = frames.remove(0);
    (client, client_empty, request_id, frames)
}

/// Send a `W_REPLY` for `request_id` back to `client` with `body`.
async fn raw_reply(
    dealer: &mut DealerSocket,
    client: Bytes,
    client_empty: Bytes,
    request_id: Bytes,
    body: Vec<Bytes>,
) {
    let mut reply = vec![
        Bytes::new(),
        w_worker_frame(),
        worker_command_bytes(W_REPLY),
        client,
        client_empty,
        request_id,
        Bytes::copy_from_slice(&[REPLY_OK]),
    ];
    reply.extend(body);
    dealer.send(reply).await.expect("raw reply send");
}

#[compio::test]
async fn happy_path_free_for_all() {
    let endpoint = spawn_broker(broker_config()).await;

    let mut w1 = WorkerSession::new(endpoint.clone(), "APP", worker_config());
    w1.register("echo", |args: Vec<Bytes>| Ok(args));
    w1.start();

    let mut w2 = WorkerSession::new(endpoint.clone(), "APP", worker_config());
    w2.register("echo", |args: Vec<Bytes>| Ok(args));
    w2.start();

    compio::time::sleep(Duration::from_millis(80)).await;

    let mut client = AsyncClient::new(endpoint, client_config());
    client.start();

    let id_a = client.send("APP", vec![Bytes::from_static(b"echo"), Bytes::from_static(b"hello-a")]);
    let id_b = client.send("APP", vec![Bytes::from_static(b"echo"), Bytes::from_static(b"hello-b")]);

    let mut replies = HashMap::new();
    for _ in 0..2 {
        let (id, payload) = client.recv().await.expect("reply");
        replies.insert(id, payload);
    }

    let reply_a = replies.get(&id_a).expect("reply correlated to request a");
    assert_eq!(reply_a[0].as_ref(), &[REPLY_OK]);
    assert_eq!(reply_a[1], Bytes::from_static(b"hello-a"));

    let reply_b = replies.get(&id_b).expect("reply correlated to request b");
    assert_eq!(reply_b[0].as_ref(), &[REPLY_OK]);
    assert_eq!(reply_b[1], Bytes::from_static(b"hello-b"));

    client.close().await;
    w1.stop().await;
    w2.stop().await;
}

#[compio::test]
async fn workholic_designation_pins_every_request_to_one_worker() {
    let endpoint = spawn_broker(broker_config()).await;

    let mut w1 = WorkerSession::new(endpoint.clone(), "TICK", worker_config());
    w1.register("who", |_args: Vec<Bytes>| Ok(vec![Bytes::from_static(b"w1")]));
    w1.start();

    let mut w2 = WorkerSession::new(endpoint.clone(), "TICK", worker_config());
    w2.register("who", |_args: Vec<Bytes>| Ok(vec![Bytes::from_static(b"w2")]));
    w2.start();

    // Let both register; w1 connects first so it becomes the designated
    // worker, and a couple of heartbeat ticks so each session's
    // `designated` flag reflects the broker's current view.
    compio::time::sleep(Duration::from_millis(120)).await;

    assert!(w1.is_designated(), "first-registered worker should be designated");
    assert!(!w2.is_designated(), "standby worker should not be marked designated");

    let mut client = AsyncClient::new(endpoint, client_config());
    client.start();

    for _ in 0..3 {
        client.send("TICK", vec![Bytes::from_static(b"who")]);
        let (_id, payload) = client.recv().await.expect("reply");
        assert_eq!(payload[1], Bytes::from_static(b"w1"), "every request should land on the designated worker");
    }

    client.close().await;
    w1.stop().await;
    w2.stop().await;
}

#[compio::test]
async fn designated_worker_failover_promotes_standby() {
    let endpoint = spawn_broker(broker_config()).await;

    // A bare dealer that READYs for TICK and then never heartbeats again,
    // standing in for a worker that has wedged or crashed outright.
    let frozen = raw_ready(endpoint.clone(), "TICK").await;

    let mut standby = WorkerSession::new(endpoint.clone(), "TICK", worker_config());
    standby.register("who", |_args: Vec<Bytes>| Ok(vec![Bytes::from_static(b"standby")]));
    standby.start();

    // Let both become idle; the frozen worker registered first so it is
    // designated.
    compio::time::sleep(Duration::from_millis(60)).await;

    // Wait past heartbeat_expiry (heartbeat_interval * heartbeat_liveness =
    // 90ms) for the broker to purge the silent worker and promote the
    // standby.
    compio::time::sleep(Duration::from_millis(200)).await;

    let mut client = AsyncClient::new(endpoint, client_config());
    client.start();

    client.send("TICK", vec![Bytes::from_static(b"who")]);
    let (_id, payload) = client.recv().await.expect("reply after failover");
    assert_eq!(payload[1], Bytes::from_static(b"standby"));

    assert!(standby.is_designated());

    client.close().await;
    standby.stop().await;
    // `frozen` stays connected-but-silent for the whole test; it's the
    // broker's heartbeat expiry that purges it, not a TCP disconnect.
    drop(frozen);
}

#[compio::test]
async fn worker_crash_holds_undispatched_requests_for_the_next_worker() {
    let endpoint = spawn_broker(broker_config()).await;

    let mut w1 = raw_ready(endpoint.clone(), "TICK").await;
    compio::time::sleep(Duration::from_millis(40)).await;

    let mut client = AsyncClient::new(endpoint.clone(), client_config());
    client.start();

    // Three requests; in workholic mode only one is ever in flight to the
    // designated worker at a time, so only the first is actually delivered
    // to w1 before it disappears.
    let id_a = client.send("TICK", vec![Bytes::from_static(b"a")]);
    let id_b = client.send("TICK", vec![Bytes::from_static(b"b")]);
    let id_c = client.send("TICK", vec![Bytes::from_static(b"c")]);

    let (_client_id, _empty, request_id, _payload) = raw_recv_request(&mut w1).await;
    assert_eq!(request_id, id_a);

    // w1 crashes mid-request: it never replies to A and never disconnects
    // cleanly. The broker only finds out once the TCP connection drops.
    drop(w1);
    compio::time::sleep(Duration::from_millis(60)).await;

    // A fresh worker takes over the service. It should be designated and
    // receive the still-queued requests B and C, in order; A was lost with
    // the worker that was holding it, matching at-most-once delivery.
    let mut w1_prime = raw_ready(endpoint, "TICK").await;

    let (client_id, client_empty, request_id, _payload) = raw_recv_request(&mut w1_prime).await;
    assert_eq!(request_id, id_b, "the reconnecting worker should drain the oldest queued request first");
    raw_reply(&mut w1_prime, client_id, client_empty, request_id, vec![Bytes::from_static(b"reply-b")]).await;

    let (client_id, client_empty, request_id, _payload) = raw_recv_request(&mut w1_prime).await;
    assert_eq!(request_id, id_c);
    raw_reply(&mut w1_prime, client_id, client_empty, request_id, vec![Bytes::from_static(b"reply-c")]).await;

    let (reply_id_1, payload_1) = client.recv().await.expect("reply to B");
    let (reply_id_2, payload_2) = client.recv().await.expect("reply to C");

    let mut replies = HashMap::new();
    replies.insert(reply_id_1, payload_1);
    replies.insert(reply_id_2, payload_2);

    assert_eq!(replies.get(&id_b).unwrap()[1], Bytes::from_static(b"reply-b"));
    assert_eq!(replies.get(&id_c).unwrap()[1], Bytes::from_static(b"reply-c"));
    assert!(!replies.contains_key(&id_a), "the request the crashed worker was holding is not redelivered");

    client.close().await;
}

#[compio::test]
async fn mmi_service_reports_known_and_unknown_services() {
    let endpoint = spawn_broker(broker_config()).await;

    let mut worker = WorkerSession::new(endpoint.clone(), "APP", worker_config());
    worker.register("noop", |_args: Vec<Bytes>| Ok(vec![]));
    worker.start();
    compio::time::sleep(Duration::from_millis(60)).await;

    let mut client = AsyncClient::new(endpoint, client_config());
    client.start();

    client.send("mmi.service", vec![Bytes::from_static(b"APP")]);
    let (_id, payload) = client.recv().await.expect("mmi.service reply");
    assert_eq!(payload, vec![Bytes::from_static(b"200")]);

    client.send("mmi.service", vec![Bytes::from_static(b"NO_SUCH_SERVICE")]);
    let (_id, payload) = client.recv().await.expect("mmi.service reply");
    assert_eq!(payload, vec![Bytes::from_static(b"404")]);

    client.send("mmi.whoami", vec![Bytes::from_static(b"irrelevant")]);
    let (_id, payload) = client.recv().await.expect("mmi.whoami reply");
    assert_eq!(payload, vec![Bytes::from_static(b"501")]);

    client.close().await;
    worker.stop().await;
}

#[compio::test]
async fn service_is_garbage_collected_once_its_last_worker_disconnects_cleanly() {
    let endpoint = spawn_broker(broker_config()).await;

    let mut worker = WorkerSession::new(endpoint.clone(), "GCTEST", worker_config());
    worker.register("noop", |_args: Vec<Bytes>| Ok(vec![]));
    worker.start();
    compio::time::sleep(Duration::from_millis(60)).await;

    let mut client = AsyncClient::new(endpoint.clone(), client_config());
    client.start();

    client.send("mmi.service", vec![Bytes::from_static(b"GCTEST")]);
    let (_id, payload) = client.recv().await.expect("mmi.service reply before disconnect");
    assert_eq!(payload, vec![Bytes::from_static(b"200")]);

    // Clean disconnect: no pending requests, so the service has nothing
    // left to serve and is reclaimed without waiting on the timeout sweep.
    worker.stop().await;
    compio::time::sleep(Duration::from_millis(60)).await;

    client.send("mmi.service", vec![Bytes::from_static(b"GCTEST")]);
    let (_id, payload) = client.recv().await.expect("mmi.service reply after disconnect");
    assert_eq!(payload, vec![Bytes::from_static(b"404")]);

    client.close().await;
}
