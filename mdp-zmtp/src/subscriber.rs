//! Direct-stream SUB socket implementation.
//!
//! SUB sockets receive messages from PUB sockets and filter them locally
//! based on subscription prefixes.

use bytes::Bytes;
use compio::io::{AsyncRead, AsyncWrite};
use compio::net::TcpStream;
use mdp_core::endpoint::Endpoint;
use mdp_core::options::SocketOptions;
use mdp_core::socket_type::SocketType;
use smallvec::SmallVec;
use std::io;
use tracing::{debug, trace};

use crate::base::SocketBase;
use crate::handshake::perform_handshake_with_timeout;

/// Direct-stream SUB socket.
pub struct SubSocket<S = TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    base: SocketBase<S>,
    frames: SmallVec<[Bytes; 4]>,
    /// List of subscription prefixes (sorted for efficient matching)
    subscriptions: Vec<Bytes>,
}

impl<S> SubSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new SUB socket from an already-connected stream.
    pub async fn new(stream: S) -> io::Result<Self> {
        Self::with_options(stream, SocketOptions::default()).await
    }

    /// Create a new SUB socket with custom socket options.
    pub async fn with_options(mut stream: S, options: SocketOptions) -> io::Result<Self> {
        debug!("[SUB] Performing ZMTP handshake...");
        let handshake_result = perform_handshake_with_timeout(
            &mut stream,
            SocketType::Sub,
            None,
            Some(options.handshake_timeout),
        )
        .await
        .map_err(|e| io::Error::other(format!("Handshake failed: {}", e)))?;

        debug!(
            peer_socket_type = ?handshake_result.peer_socket_type,
            "[SUB] Handshake complete"
        );

        Ok(Self {
            base: SocketBase::new(stream, SocketType::Sub, options),
            frames: SmallVec::new(),
            subscriptions: Vec::new(),
        })
    }

    /// Subscribe to messages with the given prefix.
    ///
    /// An empty prefix subscribes to all messages.
    pub fn subscribe(&mut self, prefix: Bytes) {
        trace!("[SUB] Adding subscription: {:?}", prefix);
        if !self.subscriptions.contains(&prefix) {
            self.subscriptions.push(prefix);
            self.subscriptions.sort();
        }
    }

    /// Unsubscribe from messages with the given prefix.
    pub fn unsubscribe(&mut self, prefix: &Bytes) {
        trace!("[SUB] Removing subscription: {:?}", prefix);
        self.subscriptions.retain(|s| s != prefix);
    }

    fn matches_subscription(&self, msg: &[Bytes]) -> bool {
        matches_subscription(&self.subscriptions, msg)
    }

    /// Receive a message that matches subscriptions.
    ///
    /// Keeps reading and filtering messages until one matches the active
    /// subscriptions.
    pub async fn recv(&mut self) -> io::Result<Option<Vec<Bytes>>> {
        loop {
            trace!("[SUB] Waiting for message");

            loop {
                loop {
                    match self.base.decoder.decode(&mut self.base.recv)? {
                        Some(frame) => {
                            let more = frame.more();
                            self.frames.push(frame.payload);

                            if !more {
                                let msg: Vec<Bytes> = self.frames.drain(..).collect();
                                trace!("[SUB] Received {} frames", msg.len());

                                if self.matches_subscription(&msg) {
                                    return Ok(Some(msg));
                                }
                                trace!("[SUB] Message filtered out (no matching subscription)");
                                break;
                            }
                        }
                        None => break,
                    }
                }

                let n = self.base.read_raw().await?;
                if n == 0 {
                    trace!("[SUB] Connection closed");
                    return Ok(None);
                }
            }
        }
    }
}

impl SubSocket<TcpStream> {
    /// Create a new SUB socket from a TCP stream with TCP_NODELAY enabled.
    pub async fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        mdp_core::tcp::enable_tcp_nodelay(&stream)?;
        debug!("[SUB] TCP_NODELAY enabled");
        Self::new(stream).await
    }
}

fn matches_subscription(subscriptions: &[Bytes], msg: &[Bytes]) -> bool {
    if subscriptions.is_empty() {
        return false;
    }

    if subscriptions.iter().any(|s| s.is_empty()) {
        return true;
    }

    if let Some(first_frame) = msg.first() {
        subscriptions
            .iter()
            .any(|sub| first_frame.len() >= sub.len() && first_frame[..sub.len()] == sub[..])
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_subscription_list_matches_nothing() {
        assert!(!matches_subscription(&[], &[Bytes::from_static(b"topic")]));
    }

    #[test]
    fn test_empty_prefix_matches_everything() {
        let subs = vec![Bytes::new()];
        assert!(matches_subscription(&subs, &[Bytes::from_static(b"anything")]));
    }

    #[test]
    fn test_prefix_matching() {
        let subs = vec![Bytes::from_static(b"weather.")];
        assert!(matches_subscription(
            &subs,
            &[Bytes::from_static(b"weather.london")]
        ));
        assert!(!matches_subscription(
            &subs,
            &[Bytes::from_static(b"sports.football")]
        ));
    }
}
