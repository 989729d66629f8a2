//! Zero-copy write buffer adapter for compio.
//!
//! `compio`'s write operations take ownership of an `IoBuf`. `bytes::Bytes`
//! doesn't implement that trait directly (orphan rules), so this thin wrapper
//! bridges the two without an extra copy.

#![allow(unsafe_code)]

use bytes::Bytes;

/// Zero-copy `IoBuf` wrapper for `Bytes`.
///
/// Lets already-encoded frames be handed straight to compio write operations
/// without a `.to_vec()` copy.
pub struct IoBytes(Bytes);

impl IoBytes {
    pub const fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Bytes> for IoBytes {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<IoBytes> for Bytes {
    fn from(io_bytes: IoBytes) -> Self {
        io_bytes.0
    }
}

// SAFETY: IoBytes wraps Bytes which is immutable and refcounted, so exposing
// it as a read-only IoBuf does not alias any mutable access.
unsafe impl compio::buf::IoBuf for IoBytes {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.0.len()
    }
}
