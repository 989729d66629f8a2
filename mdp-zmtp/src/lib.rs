//! # mdp-zmtp
//!
//! ZMTP 3.x wire protocol implementation with direct stream I/O.
//!
//! This crate handles greeting exchange, READY negotiation, and frame
//! encoding/decoding for the four socket patterns the broker needs: DEALER,
//! ROUTER, PUB, and SUB. Higher-level broker/worker/client semantics live in
//! the `mdp` crate; this crate only speaks the wire protocol.
//!
//! ## Socket Types
//!
//! - **ROUTER**: one socket per accepted peer connection, prepends sender
//!   identity on `recv()`
//! - **DEALER**: asynchronous request/reply, reconnects with backoff
//! - **PUB** / **SUB**: broadcast with client-side prefix filtering
//!
//! ## Features
//!
//! - Zero-copy sends: already-encoded frames go straight to compio without
//!   an extra copy (`mdp_core::alloc::IoBytes`)
//! - `io_uring`-backed async I/O via `compio`
//! - Generic over the underlying stream type (`AsyncRead + AsyncWrite + Unpin`)
//! - No unsafe code outside the orphan-rule bridge in `mdp_core::alloc`

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::unused_async)]
#![allow(clippy::let_underscore_future)]
#![allow(clippy::future_not_send)] // Runtime-agnostic design
#![allow(clippy::uninlined_format_args)] // Style preference
#![allow(clippy::missing_errors_doc)] // Will add gradually
#![allow(clippy::doc_markdown)] // Too many false positives
#![allow(clippy::while_let_loop)] // Sometimes clearer as explicit loop
#![allow(clippy::option_if_let_else)] // Sometimes clearer as if/else

mod base;
mod codec;
mod config;
mod greeting;
mod handshake;
mod utils;

// Socket implementations
pub mod dealer;
pub mod publisher;
pub mod router;
pub mod subscriber;

// Re-export socket types for clean API
pub use dealer::DealerSocket;
pub use publisher::PubSocket;
pub use router::RouterSocket;
pub use subscriber::SubSocket;

pub use handshake::HandshakeResult;

/// Prelude module for convenient imports
///
/// ```rust
/// use mdp_zmtp::prelude::*;
/// ```
pub mod prelude {
    pub use super::{DealerSocket, PubSocket, RouterSocket, SubSocket};
    pub use bytes::Bytes;
    pub use mdp_core::socket_type::SocketType;
}
