//! Error types for DCC sessions.
//!
//! A single [`DccError`] value is delivered to every lifecycle signal a
//! failure touches (`ready`, `started`, `closed`), so the type is `Clone`
//! and wraps I/O errors in an [`Arc`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Why a DCC session (or a request to open one) failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DccError {
    /// Nobody connected to an offer before its wait window elapsed.
    #[error("no connection before the offer window elapsed")]
    OfferTimeout,

    /// An active session saw no traffic for the configured duration.
    #[error("no traffic for {0:?}")]
    IdleTimeout(Duration),

    /// Sender and receiver disagree on where a resumed transfer starts.
    #[error("resume offset mismatch: expected {expected}, got {actual}")]
    ResumeMismatch { expected: u64, actual: u64 },

    /// Reading the source or writing the destination file failed.
    #[error("file i/o failed: {0}")]
    TransferIo(Arc<io::Error>),

    /// Socket-level failure: refused, reset, or closed early.
    #[error("transport failed: {0}")]
    Transport(Arc<io::Error>),

    /// A DCC control line did not match any known grammar.
    #[error("malformed DCC line: {0}")]
    Protocol(String),

    /// The session was closed on request.
    #[error("session cancelled")]
    Cancelled,

    /// `connection_established` has not been called yet.
    #[error("IRC connection not established")]
    NotConnected,

    /// Too many live entries of this type, overall or for one mask.
    #[error("DCC session limit reached: {0}")]
    LimitReached(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The IRC layer refused a control line.
    #[error("could not send CTCP line: {0}")]
    Ctcp(String),
}

impl DccError {
    pub(crate) fn file(err: io::Error) -> Self {
        Self::TransferIo(Arc::new(err))
    }

    pub(crate) fn transport(err: io::Error) -> Self {
        Self::Transport(Arc::new(err))
    }

    /// The peer closed the socket before `expected` bytes arrived.
    pub(crate) fn early_eof(received: u64, expected: u64) -> Self {
        Self::transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("peer closed after {received} of {expected} bytes"),
        ))
    }
}
