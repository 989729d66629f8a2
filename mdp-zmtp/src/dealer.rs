//! Direct-stream DEALER socket implementation.
//!
//! The DEALER socket provides asynchronous request-reply patterns with load
//! balancing: messages are sent as-is, with no envelope modification, and are
//! compatible with ROUTER and REP peers.

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
use crate::codec::encode_multipart;
use crate::handshake::perform_handshake_with_timeout;

/// Direct-stream DEALER socket.
pub struct DealerSocket<S = TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    base: SocketBase<S>,
    frames: SmallVec<[Bytes; 4]>,
}

impl<S> DealerSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new DEALER socket from an already-connected stream, performing
    /// the ZMTP handshake with default options.
    pub async fn new(stream: S) -> io::Result<Self> {
        Self::with_options(stream, SocketOptions::default()).await
    }

    /// Create a new DEALER socket with custom socket options.
    pub async fn with_options(mut stream: S, options: SocketOptions) -> io::Result<Self> {
        debug!("[DEALER] Performing ZMTP handshake...");
        let identity = options.routing_id.clone();
        let handshake_result = perform_handshake_with_timeout(
            &mut stream,
            SocketType::Dealer,
            identity.as_deref(),
            Some(options.handshake_timeout),
        )
        .await
        .map_err(|e| io::Error::other(format!("Handshake failed: {}", e)))?;

        debug!(
            peer_socket_type = ?handshake_result.peer_socket_type,
            "[DEALER] Handshake complete"
        );

        Ok(Self {
            base: SocketBase::new(stream, SocketType::Dealer, options),
            frames: SmallVec::new(),
        })
    }

    /// Receive a multipart message.
    pub async fn recv(&mut self) -> io::Result<Option<Vec<Bytes>>> {
        trace!("[DEALER] Waiting for message");

        loop {
            loop {
                match self.base.decoder.decode(&mut self.base.recv)? {
                    Some(frame) => {
                        let more = frame.more();
                        self.frames.push(frame.payload);

                        if !more {
                            let msg: Vec<Bytes> = self.frames.drain(..).collect();
                            trace!("[DEALER] Received {} frames", msg.len());
                            return Ok(Some(msg));
                        }
                    }
                    None => break,
                }
            }

            let n = self.base.read_raw().await?;
            if n == 0 {
                trace!("[DEALER] Connection closed");
                return Ok(None);
            }
        }
    }

    /// Send a multipart message immediately.
    pub async fn send(&mut self, msg: Vec<Bytes>) -> io::Result<()> {
        trace!("[DEALER] Sending {} frames", msg.len());

        self.base.write_buf.clear();
        encode_multipart(&msg, &mut self.base.write_buf);
        self.base.write_from_buf().await?;

        trace!("[DEALER] Message sent successfully");
        Ok(())
    }

    /// Buffer a message without flushing; call `flush()` to send.
    pub fn send_buffered(&mut self, msg: Vec<Bytes>) {
        encode_multipart(&msg, &mut self.base.send_buffer);
    }

    /// Flush all buffered messages to the network.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.base.flush_send_buffer().await
    }

    /// Whether the underlying connection is currently established.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.base.is_connected()
    }

    /// Get a reference to the socket options.
    #[inline]
    pub fn options(&self) -> &SocketOptions {
        &self.base.options
    }
}

impl DealerSocket<TcpStream> {
    /// Connect to a ROUTER endpoint and complete the ZMTP handshake.
    ///
    /// The socket stores the endpoint and reconnects automatically (with
    /// exponential backoff) if the connection drops.
    pub async fn connect(endpoint: Endpoint, options: SocketOptions) -> io::Result<Self> {
        let addr = match &endpoint {
            Endpoint::Tcp(addr) => *addr,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("DEALER connect over TCP requires a tcp:// endpoint, got {}", other),
                ))
            }
        };

        let mut stream = TcpStream::connect(addr).await?;
        mdp_core::tcp::enable_tcp_nodelay(&stream)?;

        let identity = options.routing_id.clone();
        perform_handshake_with_timeout(
            &mut stream,
            SocketType::Dealer,
            identity.as_deref(),
            Some(options.handshake_timeout),
        )
        .await
        .map_err(|e| io::Error::other(format!("Handshake failed: {}", e)))?;

        Ok(Self {
            base: SocketBase::with_endpoint(stream, SocketType::Dealer, endpoint, options),
            frames: SmallVec::new(),
        })
    }

    /// Reconnect to the stored endpoint after a connection failure.
    pub async fn reconnect(&mut self) -> io::Result<()> {
        self.base.try_reconnect(SocketType::Dealer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdp_core::endpoint::Endpoint;

    #[test]
    fn test_dealer_connect_requires_tcp_endpoint() {
        compio::runtime::Runtime::new().unwrap().block_on(async {
            let endpoint: Endpoint = "ipc:///tmp/nonexistent.sock".parse().unwrap();
            let result = DealerSocket::connect(endpoint, SocketOptions::default()).await;
            assert!(result.is_err());
        });
    }
}
