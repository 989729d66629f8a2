//! mdp-core
//!
//! Runtime-agnostic building blocks shared by the ZMTP wire protocol crate and
//! the broker/worker/client crate:
//! - Zero-copy write buffer adapter for compio (`alloc`)
//! - Transport-agnostic endpoint addressing (`endpoint`)
//! - Socket configuration options (`options`)
//! - Reconnection backoff (`reconnect`)
//! - Multipart message builder (`message`)
//! - Segmented receive buffer (`buffer`)
//! - I/O timeout helpers (`timeout`)
//! - TCP socket tuning (`tcp`)
//! - Socket type enumeration (`socket_type`)
//! - Socket lifecycle event monitoring (`monitor`)
//! - Cancellation-safety guard for partial writes (`poison`)
//! - Error types (`error`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]

pub mod alloc;
pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod monitor;
pub mod options;
pub mod poison;
pub mod reconnect;
pub mod socket_type;
pub mod tcp;
pub mod timeout;

pub mod prelude {
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{CoreError, Result};
    pub use crate::message::Message;
    pub use crate::options::SocketOptions;
    pub use crate::reconnect::ReconnectState;
    pub use crate::socket_type::SocketType;
}
