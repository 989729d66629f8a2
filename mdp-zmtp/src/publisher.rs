//! Direct-stream PUB socket implementation.
//!
//! PUB sockets are send-only broadcast sockets; filtering happens on the SUB
//! side.

use bytes::Bytes;
use compio::io::{AsyncRead, AsyncWrite};
use compio::net::TcpStream;
use mdp_core::endpoint::Endpoint;
use mdp_core::options::SocketOptions;
use mdp_core::socket_type::SocketType;
use std::io;
use tracing::{debug, trace};

use crate::base::SocketBase;
use crate::codec::encode_multipart;
use crate::handshake::perform_handshake_with_timeout;

/// Direct-stream PUB socket.
pub struct PubSocket<S = TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    base: SocketBase<S>,
}

impl<S> PubSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new PUB socket from an already-connected stream.
    pub async fn new(stream: S) -> io::Result<Self> {
        Self::with_options(stream, SocketOptions::default()).await
    }

    /// Create a new PUB socket with custom socket options.
    pub async fn with_options(mut stream: S, options: SocketOptions) -> io::Result<Self> {
        debug!("[PUB] Performing ZMTP handshake...");
        let handshake_result = perform_handshake_with_timeout(
            &mut stream,
            SocketType::Pub,
            None,
            Some(options.handshake_timeout),
        )
        .await
        .map_err(|e| io::Error::other(format!("Handshake failed: {}", e)))?;

        debug!(
            peer_socket_type = ?handshake_result.peer_socket_type,
            "[PUB] Handshake complete"
        );

        Ok(Self {
            base: SocketBase::new(stream, SocketType::Pub, options),
        })
    }

    /// Broadcast a message to this subscriber connection.
    pub async fn send(&mut self, msg: Vec<Bytes>) -> io::Result<()> {
        trace!("[PUB] Sending {} frames", msg.len());

        self.base.write_buf.clear();
        encode_multipart(&msg, &mut self.base.write_buf);
        self.base.write_from_buf().await?;

        trace!("[PUB] Message sent successfully");
        Ok(())
    }

    /// Whether the underlying connection is currently established.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.base.is_connected()
    }
}

impl PubSocket<TcpStream> {
    /// Create a new PUB socket from a TCP stream with TCP_NODELAY enabled.
    pub async fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        mdp_core::tcp::enable_tcp_nodelay(&stream)?;
        debug!("[PUB] TCP_NODELAY enabled");
        Self::new(stream).await
    }

    /// Connect to a SUB endpoint and complete the ZMTP handshake.
    pub async fn connect(endpoint: Endpoint, options: SocketOptions) -> io::Result<Self> {
        let addr = match &endpoint {
            Endpoint::Tcp(addr) => *addr,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("PUB connect over TCP requires a tcp:// endpoint, got {}", other),
                ))
            }
        };

        let stream = TcpStream::connect(addr).await?;
        mdp_core::tcp::enable_tcp_nodelay(&stream)?;
        Self::with_options(stream, options).await
    }
}
