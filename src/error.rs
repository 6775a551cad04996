//! Error types for kvpbc.

use thiserror::Error;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during connect/send/receive.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error from the translator.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (corrupt length prefix, unknown message code, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error response returned by the server.
    #[error("Server error {code}: {message}")]
    Remote { message: String, code: u32 },

    /// Operation attempted without an established connection.
    #[error("Not connected")]
    NotConnected,

    /// Connect attempt timed out.
    #[error("Connect timed out")]
    ConnectTimeout,

    /// Connection closed while an operation was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Whether this error originated on the server side (error-type frame).
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote { .. })
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
