//! Shared buffer-sizing constants for ZMTP sockets.

/// Initial staging buffer capacity for decoder reassembly (256 bytes).
///
/// Pre-allocated to avoid initial reallocation on fragmented frames. Only
/// used when a frame spans multiple read segments (slow path).
pub const STAGING_BUF_INITIAL_CAP: usize = 256;
