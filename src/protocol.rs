//! Shared protocol constants for the etd control and data channels

// Control-channel replies are tiny; a single-reply command never needs more
// than this much buffered input before a complete line shows up.
pub const CONTROL_BUF_SIZE: usize = 2 * 1024;

// Directory listings stream many "OK <entry>" lines; give them more room.
pub const LISTING_BUF_SIZE: usize = 16 * 1024;

// A data connection must produce its "{ ... }" command header within this
// many bytes or it is considered abusive and dropped.
pub const MAX_HEADER_SIZE: usize = 4 * 1024;

// Scratch buffer for the payload phase, both directions.
pub const DATA_BUF_SIZE: usize = 10 * 1024 * 1024;

// Single-byte acknowledgement the receiving side emits once the last
// payload byte has hit its file.
pub const ACK_BYTE: u8 = b'y';

// Back-off between acquire-both attempts when a per-transfer lock is
// contended. The exact value is immaterial as long as it stays small.
pub const LOCK_RETRY_US: u64 = 42;

// Centralized timeout constants
pub mod timeouts {
    use std::time::Duration;

    // Connection establishment timeout per data-channel candidate (ms)
    pub const CONNECT_MS: u64 = 200;

    pub fn connect_timeout() -> Duration {
        Duration::from_millis(CONNECT_MS)
    }
}
