//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Header byte is not a definite-length byte-string head
    #[error("not a byte-string head: initial byte {0:#04x}")]
    Header(u8),

    /// Reserved additional-information value in the head
    #[error("reserved length encoding {0:#04x}")]
    Reserved(u8),

    /// Declared frame length exceeds the configured limit
    #[error("frame length {0} exceeds limit")]
    Size(u64),

    /// Unknown bundle version discriminator
    #[error("unknown bundle version discriminator {0:#04x}")]
    Version(u8),
}
