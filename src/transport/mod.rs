//! Transport module - TCP connection management.
//!
//! The pipeline never touches sockets directly: it hands outbound bytes to
//! a [`Transport`] and receives inbound bytes from the client's read loop.

mod tcp;

use std::future::Future;

pub use tcp::{ConnectOptions, Connection};

use crate::error::Result;

/// Outbound byte sink the pipeline dispatches through.
pub(crate) trait Transport: Send + Sync + 'static {
    /// Transmit one encoded request frame.
    fn send(&self, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;
}
