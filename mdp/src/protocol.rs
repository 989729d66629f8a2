//! Wire-level protocol constants for the broker/worker/client fabric.
//!
//! Every tag is a single byte wrapped in a `Bytes` so it can be pushed onto a
//! multipart message without an allocation at the call site. Values are
//! opaque and only need to be stable within one deployment.

use bytes::Bytes;

/// Client protocol header, first frame after the empty delimiter in every
/// client↔broker message.
pub const C_CLIENT: u8 = 0x10;

/// Worker protocol header, first frame after the empty delimiter in every
/// worker↔broker message.
pub const W_WORKER: u8 = 0x20;

/// Worker → broker: attach to a service.
pub const W_READY: u8 = 0x01;
/// Broker → worker: deliver a request.
pub const W_REQUEST: u8 = 0x02;
/// Worker → broker: deliver a reply.
pub const W_REPLY: u8 = 0x03;
/// Both directions: liveness tick.
pub const W_HEARTBEAT: u8 = 0x04;
/// Both directions: teardown.
pub const W_DISCONNECT: u8 = 0x05;

/// Marker frame piggybacked on heartbeats sent to a service's designated
/// worker.
pub const DESIGNATED_MARKER: &[u8] = b"designated";

/// Reserved service-name prefix for the broker's internal meta-service.
pub const MMI_PREFIX: &[u8] = b"mmi.";

/// Sub-service name answering "does this service exist?".
pub const MMI_SERVICE: &[u8] = b"mmi.service";

/// Wrap a single tag byte as a frame, ready to push onto a multipart
/// message.
#[must_use]
pub fn tag_frame(tag: u8) -> Bytes {
    Bytes::copy_from_slice(&[tag])
}

/// A worker command tag (`W_READY`, `W_REQUEST`, ...) as a frame.
#[must_use]
pub fn worker_command_bytes(cmd: u8) -> Bytes {
    tag_frame(cmd)
}

/// The `C_CLIENT` header as a frame.
#[must_use]
pub fn c_client_frame() -> Bytes {
    tag_frame(C_CLIENT)
}

/// The `W_WORKER` header as a frame.
#[must_use]
pub fn w_worker_frame() -> Bytes {
    tag_frame(W_WORKER)
}

/// Status code returned by `mmi.service` for a service that is registered.
pub const MMI_STATUS_OK: &[u8] = b"200";
/// Status code returned by `mmi.service` for a service that is unknown.
pub const MMI_STATUS_NOT_FOUND: &[u8] = b"404";
/// Status code returned for any MMI sub-service other than `mmi.service`.
pub const MMI_STATUS_NOT_IMPLEMENTED: &[u8] = b"501";

/// First payload frame of a `W_REPLY` tags whether the worker's request
/// handler succeeded; see §7's "user handler raised inside worker" policy.
pub const REPLY_OK: u8 = 0x00;
/// First payload frame tags a handler failure (see [`crate::error::WorkerError::HandlerFailed`]).
pub const REPLY_ERR: u8 = 0x01;

/// Returns true if `name` falls in the reserved MMI namespace.
#[must_use]
pub fn is_reserved_service(name: &[u8]) -> bool {
    name.starts_with(MMI_PREFIX)
}

/// True if `frame` is exactly the one-byte tag `tag`.
#[must_use]
pub fn is_tag(frame: &[u8], tag: u8) -> bool {
    frame.len() == 1 && frame[0] == tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_service_detection() {
        assert!(is_reserved_service(b"mmi.service"));
        assert!(is_reserved_service(b"mmi.anything"));
        assert!(!is_reserved_service(b"APP"));
        assert!(!is_reserved_service(b"mm"));
    }

    #[test]
    fn test_worker_command_roundtrip() {
        assert_eq!(worker_command_bytes(W_READY).as_ref(), &[0x01]);
        assert_eq!(worker_command_bytes(W_REQUEST).as_ref(), &[0x02]);
    }

    #[test]
    fn test_header_tags_distinguish_client_and_worker() {
        assert!(is_tag(&c_client_frame(), C_CLIENT));
        assert!(is_tag(&w_worker_frame(), W_WORKER));
        assert_ne!(C_CLIENT, W_WORKER);
    }
}
