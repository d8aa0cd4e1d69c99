//! Dispatcher and socket error types.

use thiserror::Error;

use crate::wire::WireError;

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type encompassing all dispatcher failure modes.
///
/// Transport and wire failures are fatal to the dispatcher; the remaining
/// variants are local to one operation or one stream and leave the
/// dispatcher running.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure on the underlying transport. Fatal: the dispatcher
    /// disposes and every dependent operation fails.
    #[error("transport failed: {0}")]
    Transport(#[from] std::io::Error),

    /// Inbound bytes did not decode as a valid packet. Fatal, since the
    /// framing can no longer be trusted.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// An outbound payload exceeds the negotiated maximum. Local to the
    /// offending send.
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// The peer refused a locally-initiated stream open.
    #[error("peer rejected stream open for service {service:?}")]
    OpenRejected { service: String },

    /// Operation on a stream that has been torn down.
    #[error("stream is closed")]
    StreamClosed,

    /// The dispatcher has shut down.
    #[error("connection closed")]
    ConnectionClosed,

    /// An inbound packet carried fields that are impossible in the current
    /// state. Reported on the error channel; the packet is discarded.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            Error::Transport(inner) => inner.kind(),
            Error::Wire(_) | Error::Protocol(_) => ErrorKind::InvalidData,
            Error::PayloadTooLarge { .. } => ErrorKind::InvalidInput,
            Error::OpenRejected { .. } => ErrorKind::ConnectionRefused,
            Error::StreamClosed => ErrorKind::BrokenPipe,
            Error::ConnectionClosed => ErrorKind::ConnectionAborted,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kind_mapping() {
        let err: std::io::Error = Error::StreamClosed.into();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        let err: std::io::Error = Error::ConnectionClosed.into();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);

        let err: std::io::Error = Error::PayloadTooLarge { len: 5000, max: 4096 }.into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
