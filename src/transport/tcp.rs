//! TCP connection manager.
//!
//! Owns the write half of the socket; the read half is handed to the
//! client, which runs the read loop. A connection epoch counter lets a
//! stale read loop detect that it has been superseded by a reconnect, so
//! its shutdown handling cannot disturb the new connection's state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::Transport;
use crate::error::{Error, Result};

/// Default server host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_PORT: u16 = 8087;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Timeout for establishing the TCP connection.
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// TCP connection manager: connect, transmit, disconnect.
pub struct Connection {
    opts: ConnectOptions,
    writer: Mutex<Option<OwnedWriteHalf>>,
    epoch: AtomicU64,
}

impl Connection {
    /// Create a connection manager (not yet connected).
    pub fn new(opts: ConnectOptions) -> Self {
        Self {
            opts,
            writer: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// Establish the TCP connection.
    ///
    /// Returns the read half and the new connection epoch; the write half
    /// is retained for [`Connection::send`]. Replaces any previous
    /// connection.
    pub async fn connect(&self) -> Result<(OwnedReadHalf, u64)> {
        let addr = format!("{}:{}", self.opts.host, self.opts.port);
        let stream = tokio::time::timeout(self.opts.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        stream.set_nodelay(true)?;

        tracing::debug!("Connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        *self.writer.lock().await = Some(writer);
        Ok((reader, epoch))
    }

    /// Transmit one encoded request frame.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Whether a write half is currently held.
    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Current connection epoch.
    pub(crate) fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Shut the connection down.
    pub async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Discard the write half after the read loop observed a loss.
    ///
    /// Only acts when `epoch` is still current: a superseded read loop
    /// must not tear down its successor's connection.
    pub(crate) async fn drop_writer(&self, epoch: u64) {
        if self.current_epoch() == epoch {
            self.writer.lock().await.take();
        }
    }
}

impl Transport for Connection {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        Connection::send(self, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn local_server() -> (TcpListener, ConnectOptions) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let opts = ConnectOptions {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(1),
        };
        (listener, opts)
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let (listener, opts) = local_server().await;
        let conn = Connection::new(opts);

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let _ = conn.connect().await.unwrap();
        assert!(conn.is_connected().await);

        conn.send(b"hello").await.unwrap();
        assert_eq!(accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let conn = Connection::new(ConnectOptions::default());
        // Nothing listening and never connected.
        let err = conn.send(b"x").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_disconnect_clears_writer() {
        let (listener, opts) = local_server().await;
        let conn = Connection::new(opts);

        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let _ = conn.connect().await.unwrap();
        conn.disconnect().await;
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_epoch_advances_per_connect() {
        let (listener, opts) = local_server().await;
        let conn = Connection::new(opts);

        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let (_r1, e1) = conn.connect().await.unwrap();
        let (_r2, e2) = conn.connect().await.unwrap();
        assert!(e2 > e1);

        // A stale loop's drop_writer is a no-op.
        conn.drop_writer(e1).await;
        assert!(conn.is_connected().await);

        conn.drop_writer(e2).await;
        assert!(!conn.is_connected().await);
    }
}
