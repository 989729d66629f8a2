//! Multi-peer fan-in for the broker's router transport.
//!
//! `mdp_zmtp::router::RouterSocket` is a direct-stream socket bound to a
//! single accepted connection (see its module docs). To get genuine
//! multi-peer ROUTER semantics we run one `RouterSocket` per accepted TCP
//! connection, each on its own task, and fan every fully-decoded multipart
//! message into a single channel the broker's event loop drains. Replies are
//! routed back the same way: the broker looks up the peer's per-connection
//! outbound sender and hands it the frames to write.
//!
//! This is exactly the design called for in §5 of the spec ("no locks are
//! required inside the broker"): the peer table itself only ever changes on
//! the broker's own task, driven by `Connected`/`Disconnected` events that
//! flow through the same channel as ordinary messages.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use compio::net::{TcpListener, TcpStream};
use futures::{select, FutureExt};
use tracing::{debug, info, warn};

use mdp_zmtp::RouterSocket;

/// Everything the broker's event loop can learn about from the transport
/// layer: a peer connecting, a peer's message, or a peer disconnecting.
pub enum Inbound {
    /// A new peer completed its ZMTP handshake and is ready to receive.
    Connected {
        identity: Bytes,
        outbound: flume::Sender<Vec<Bytes>>,
    },
    /// A peer sent a multipart message. `frames` has already had the
    /// router's own per-connection identity frame stripped.
    Message { identity: Bytes, frames: Vec<Bytes> },
    /// A peer's connection closed (EOF or I/O error).
    Disconnected { identity: Bytes },
}

/// Hex-encode a peer's socket address into the canonical identity form used
/// as the worker/client registry key (§3: "hex-encoded canonical form of the
/// transport-assigned routing address").
#[must_use]
pub fn identity_for_addr(addr: SocketAddr) -> Bytes {
    Bytes::from(hex::encode(addr.to_string().as_bytes()))
}

/// Accept connections on `listener` forever, spawning one task per peer.
/// Each task forwards decoded frames into `inbound_tx` until the broker
/// shuts down (detected when `inbound_tx` is closed) or the peer hangs up.
pub async fn accept_loop(listener: TcpListener, inbound_tx: flume::Sender<Inbound>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let tx = inbound_tx.clone();
                compio::runtime::spawn(async move {
                    if let Err(e) = serve_peer(stream, addr, tx).await {
                        warn!(peer = %addr, error = %e, "peer connection ended with error");
                    }
                })
                .detach();
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn serve_peer(
    stream: TcpStream,
    addr: SocketAddr,
    inbound_tx: flume::Sender<Inbound>,
) -> io::Result<()> {
    let mut router = RouterSocket::from_tcp(stream).await?;
    let identity = identity_for_addr(addr);
    let (outbound_tx, outbound_rx) = flume::unbounded::<Vec<Bytes>>();

    debug!(peer = %addr, identity = ?identity, "peer handshake complete");

    if inbound_tx
        .send_async(Inbound::Connected {
            identity: identity.clone(),
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        return Ok(());
    }

    loop {
        select! {
            recv_result = router.recv().fuse() => {
                match recv_result {
                    Ok(Some(mut frames)) => {
                        if !frames.is_empty() {
                            frames.remove(0); // drop the router's own per-connection identity
                        }
                        if inbound_tx
                            .send_async(Inbound::Message { identity: identity.clone(), frames })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %addr, error = %e, "read error, dropping connection");
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv_async().fuse() => {
                match outbound {
                    Ok(frames) => {
                        if let Err(e) = router.send(frames).await {
                            warn!(peer = %addr, error = %e, "write error, dropping connection");
                            break;
                        }
                    }
                    Err(_) => break, // broker dropped our outbound sender
                }
            }
        }
    }

    let _ = inbound_tx
        .send_async(Inbound::Disconnected { identity })
        .await;
    info!(peer = %addr, "peer disconnected");
    Ok(())
}
