//! Domain-specific error types for the mirroring pipeline.
//!
//! All fallible operations return `Result<T, MiraError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the mirroring receiver core.
#[derive(Debug, Error)]
pub enum MiraError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The configured port was zero or otherwise unusable.
    #[error("invalid port: {0}")]
    InvalidPort(u32),

    /// Binding the listening socket failed.
    #[error("listener bind failed: {0}")]
    Bind(std::io::Error),

    /// The listener failed after a successful bind.
    #[error("listener failed: {0}")]
    Listener(std::io::Error),

    /// Dialing the remote endpoint failed.
    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    /// The socket read side reported an error mid-stream.
    #[error("receive error: {0}")]
    Receive(std::io::Error),

    /// The session was stopped while an operation was in flight.
    #[error("connection cancelled")]
    Cancelled,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A wire record violated protocol rules.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The advertised codec identifier is not supported.
    #[error("unsupported codec fourcc: {0:#010x}")]
    UnsupportedCodec(u32),

    // ── Delivery Errors ──────────────────────────────────────────
    /// A registered frame sink failed to open.
    #[error("sink open failed: {0}")]
    SinkOpen(String),

    /// The broadcaster is already holding its maximum number of sinks.
    #[error("sink limit reached: {0} sinks")]
    SinkLimit(usize),

    /// An mpsc/watch channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Fallback ─────────────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MiraError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MiraError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = MiraError::InvalidPort(0);
        assert!(e.to_string().contains("invalid port"));

        let e = MiraError::Timeout(Duration::from_secs(3));
        assert!(e.to_string().contains("3s"));

        let e = MiraError::UnsupportedCodec(0x68323634);
        assert!(e.to_string().contains("0x68323634"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: MiraError = io_err.into();
        assert!(matches!(e, MiraError::Io(_)));
    }
}
