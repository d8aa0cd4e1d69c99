//! Wire-format error types.

use thiserror::Error;

/// Result type for wire codec operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Errors produced while decoding packets off the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than a full header were available.
    #[error("truncated header: got {0} bytes, need {}", crate::HEADER_SIZE)]
    TruncatedHeader(usize),

    /// The command word is outside the protocol vocabulary.
    #[error("unknown command word {0:#010x}")]
    UnknownCommand(u32),

    /// The magic field is not the complement of the command word.
    #[error("magic mismatch: command {command:#010x}, magic {magic:#010x}")]
    MagicMismatch { command: u32, magic: u32 },

    /// The payload length does not match the header's length field.
    #[error("payload length mismatch: header declares {declared}, got {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    /// The payload checksum does not match the header's checksum field.
    #[error("checksum mismatch: header declares {declared:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { declared: u32, computed: u32 },

    /// The header declares a payload larger than the negotiated maximum.
    #[error("declared payload of {declared} bytes exceeds limit of {limit}")]
    PayloadTooLong { declared: u32, limit: usize },
}
