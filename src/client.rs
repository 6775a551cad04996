//! Client builder, connection lifecycle, and operation wrappers.
//!
//! The [`ClientBuilder`] provides a fluent API for configuration; the
//! [`Client`] wires the pieces together: operations encode their request
//! through the translator, enqueue a task on the pipeline, and the read
//! loop feeds inbound bytes through the frame buffer back into the
//! pipeline.
//!
//! # Example
//!
//! ```ignore
//! use kvpbc::Client;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> kvpbc::Result<()> {
//!     let client = Client::builder().host("10.0.0.5").port(8087).build();
//!
//!     client.put(json!({
//!         "bucket": "users",
//!         "key": "u1",
//!         "content": { "value": "{\"name\":\"ada\"}" },
//!     }))
//!     .await?;
//!
//!     let mut keys = client.list_keys_stream(json!({ "bucket": "users" })).await?;
//!     while let Some(fragment) = keys.next().await {
//!         println!("{:?}", fragment?.get("keys"));
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{JsonTranslator, Translator};
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, Task, TaskOutput};
use crate::protocol::{catalog, encode_request, FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::reply::Reply;
use crate::streaming::{MapReduceStream, ReplyStream};
use crate::transport::{ConnectOptions, Connection};

/// Default capacity of a streaming operation's output channel.
pub const DEFAULT_STREAM_CAPACITY: usize = 32;

/// Default bound on transmissions of one task across reconnects.
pub const DEFAULT_MAX_DISPATCH_ATTEMPTS: u32 = 3;

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    opts: ConnectOptions,
    auto_connect: bool,
    stream_capacity: usize,
    max_payload_size: u32,
    max_dispatch_attempts: u32,
    translator: Option<Arc<dyn Translator>>,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            opts: ConnectOptions::default(),
            auto_connect: true,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_dispatch_attempts: DEFAULT_MAX_DISPATCH_ATTEMPTS,
            translator: None,
        }
    }

    /// Set the server host. Default: `127.0.0.1`.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.opts.host = host.into();
        self
    }

    /// Set the server port. Default: 8087.
    pub fn port(mut self, port: u16) -> Self {
        self.opts.port = port;
        self
    }

    /// Set the connect timeout. Default: 1 second.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.opts.connect_timeout = timeout;
        self
    }

    /// Connect transparently on first use and after disconnects.
    /// Default: enabled.
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    /// Set the streaming channel capacity (backpressure bound).
    /// Default: 32 fragments.
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity.max(1);
        self
    }

    /// Set the maximum accepted payload size. Default: 64 MiB.
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Bound how many times one request may be transmitted across
    /// reconnects before it fails with [`Error::ConnectionClosed`].
    ///
    /// Redelivery is at-least-once: a non-idempotent operation (put,
    /// delete, counter update) re-queued across a connection loss can
    /// take effect twice on the server. Set to 1 to disable redelivery
    /// entirely. Default: 3.
    pub fn max_dispatch_attempts(mut self, attempts: u32) -> Self {
        self.max_dispatch_attempts = attempts.max(1);
        self
    }

    /// Replace the payload translator (e.g. a full protobuf codec).
    /// Default: [`JsonTranslator`].
    pub fn translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Build the client. No connection is made until [`Client::connect`]
    /// or, with auto-connect, the first operation.
    pub fn build(self) -> Client {
        let translator = self
            .translator
            .unwrap_or_else(|| Arc::new(JsonTranslator::new()));
        let conn = Arc::new(Connection::new(self.opts));
        let pipeline = Arc::new(Pipeline::new(
            conn.clone(),
            translator.clone(),
            self.max_dispatch_attempts,
        ));

        Client {
            conn,
            pipeline,
            translator,
            auto_connect: self.auto_connect,
            stream_capacity: self.stream_capacity,
            max_payload_size: self.max_payload_size,
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Client for the key-value store protocol.
///
/// All operations share one TCP connection and are strictly serialized:
/// the pipeline transmits at most one request at a time and associates
/// every inbound frame with the request at the head of the queue.
pub struct Client {
    conn: Arc<Connection>,
    pipeline: Arc<Pipeline<Connection>>,
    translator: Arc<dyn Translator>,
    auto_connect: bool,
    stream_capacity: usize,
    max_payload_size: u32,
}

impl Client {
    /// Create a client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a client with default settings.
    pub fn new() -> Self {
        ClientBuilder::new().build()
    }

    /// Establish the connection and start the read loop.
    ///
    /// Any request re-queued across a previous disconnect is dispatched
    /// immediately.
    pub async fn connect(&self) -> Result<()> {
        let (reader, epoch) = self.conn.connect().await?;
        tokio::spawn(read_loop(
            reader,
            epoch,
            self.pipeline.clone(),
            self.conn.clone(),
            self.max_payload_size,
        ));
        self.pipeline.dispatch().await;
        Ok(())
    }

    /// Disconnect from the server.
    ///
    /// An in-flight request is re-queued at the head of the queue, not
    /// discarded; it is retried on the next connection.
    pub async fn disconnect(&self) {
        self.pipeline.requeue_active().await;
        self.conn.disconnect().await;
    }

    /// Whether the connection is currently established.
    pub async fn is_connected(&self) -> bool {
        self.conn.is_connected().await
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Check that the server is reachable and responding.
    pub async fn ping(&self) -> Result<()> {
        self.request("RpbPingReq", None, false).await.map(|_| ())
    }

    /// Fetch the server's node and version information.
    pub async fn get_server_info(&self) -> Result<Reply> {
        self.request("RpbGetServerInfoReq", None, false).await
    }

    /// Fetch the client id registered on this connection.
    pub async fn get_client_id(&self) -> Result<Reply> {
        self.request("RpbGetClientIdReq", None, false).await
    }

    /// Register a client id on this connection.
    pub async fn set_client_id(&self, params: Value) -> Result<Reply> {
        self.request("RpbSetClientIdReq", Some(params), false).await
    }

    /// Fetch an object by bucket and key.
    pub async fn get(&self, params: Value) -> Result<Reply> {
        self.request("RpbGetReq", Some(params), false).await
    }

    /// Store an object.
    pub async fn put(&self, params: Value) -> Result<Reply> {
        self.request("RpbPutReq", Some(params), false).await
    }

    /// Delete an object.
    pub async fn del(&self, params: Value) -> Result<Reply> {
        self.request("RpbDelReq", Some(params), false).await
    }

    /// List all buckets.
    pub async fn list_buckets(&self) -> Result<Reply> {
        self.request("RpbListBucketsReq", None, false).await
    }

    /// List the keys in a bucket, aggregated into one reply.
    ///
    /// The server delivers keys in batches; the batches are merged, so
    /// the returned reply's `keys` field holds the full listing.
    pub async fn list_keys(&self, params: Value) -> Result<Reply> {
        self.request("RpbListKeysReq", Some(params), true).await
    }

    /// List the keys in a bucket as a stream of batch fragments.
    pub async fn list_keys_stream(&self, params: Value) -> Result<ReplyStream> {
        self.request_stream("RpbListKeysReq", Some(params)).await
    }

    /// Fetch a bucket's properties.
    pub async fn get_bucket(&self, params: Value) -> Result<Reply> {
        self.request("RpbGetBucketReq", Some(params), false).await
    }

    /// Set a bucket's properties.
    pub async fn set_bucket(&self, params: Value) -> Result<Reply> {
        self.request("RpbSetBucketReq", Some(params), false).await
    }

    /// Reset a bucket's properties to the defaults.
    pub async fn reset_bucket(&self, params: Value) -> Result<Reply> {
        self.request("RpbResetBucketReq", Some(params), false).await
    }

    /// Run a map-reduce job and return the flattened result rows.
    pub async fn map_reduce(&self, params: Value) -> Result<Vec<Value>> {
        let reply = self.request("RpbMapRedReq", Some(params), true).await?;
        Ok(flatten_rows(reply))
    }

    /// Run a map-reduce job as a stream of individual result rows.
    pub async fn map_reduce_stream(&self, params: Value) -> Result<MapReduceStream> {
        let inner = self.request_stream("RpbMapRedReq", Some(params)).await?;
        Ok(MapReduceStream::new(inner))
    }

    /// Query a secondary index.
    pub async fn get_index(&self, params: Value) -> Result<Reply> {
        self.request("RpbIndexReq", Some(params), false).await
    }

    /// Query a secondary index as a stream of match fragments.
    ///
    /// Sets the request's `stream` parameter so the server delivers
    /// matches incrementally.
    pub async fn get_index_stream(&self, mut params: Value) -> Result<ReplyStream> {
        if let Value::Object(map) = &mut params {
            map.insert("stream".to_string(), Value::Bool(true));
        }
        self.request_stream("RpbIndexReq", Some(params)).await
    }

    /// Run a search query.
    pub async fn search(&self, params: Value) -> Result<Reply> {
        self.request("RpbSearchQueryReq", Some(params), false).await
    }

    /// Fetch a counter's value.
    pub async fn get_counter(&self, params: Value) -> Result<Reply> {
        self.request("RpbCounterGetReq", Some(params), false).await
    }

    /// Increment or decrement a counter.
    pub async fn update_counter(&self, params: Value) -> Result<Reply> {
        self.request("RpbCounterUpdateReq", Some(params), false)
            .await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn request(
        &self,
        name: &str,
        params: Option<Value>,
        expect_multiple: bool,
    ) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        let task = self.build_task(name, params, expect_multiple, TaskOutput::Callback(tx))?;
        self.ensure_connected().await?;
        self.pipeline.enqueue(task).await;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    async fn request_stream(&self, name: &str, params: Option<Value>) -> Result<ReplyStream> {
        let (tx, rx) = mpsc::channel(self.stream_capacity);
        let task = self.build_task(name, params, true, TaskOutput::Stream(tx))?;
        self.ensure_connected().await?;
        self.pipeline.enqueue(task).await;
        Ok(ReplyStream::new(rx))
    }

    fn build_task(
        &self,
        name: &str,
        params: Option<Value>,
        expect_multiple: bool,
        output: TaskOutput,
    ) -> Result<Task> {
        let code = catalog::code_of(name)?;
        let payload = self.translator.encode(name, params.as_ref())?;
        Ok(Task {
            message: encode_request(code, &payload),
            expect_multiple,
            output,
            attempts: 0,
        })
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.conn.is_connected().await || !self.auto_connect {
            // Without auto-connect an unsent task resolves with the
            // transmission error, same as any transport failure.
            return Ok(());
        }
        self.connect().await
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Read inbound bytes, reassemble frames, and drive the pipeline.
///
/// The epoch guard keeps a superseded loop (after a reconnect) from
/// touching the pipeline's state.
async fn read_loop(
    mut reader: OwnedReadHalf,
    epoch: u64,
    pipeline: Arc<Pipeline<Connection>>,
    conn: Arc<Connection>,
    max_payload_size: u32,
) {
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Connection closed by peer");
                break;
            }
            Ok(n) => match frame_buffer.push(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        pipeline.on_frame(frame).await;
                    }
                }
                Err(err) => {
                    if conn.current_epoch() == epoch {
                        tracing::error!("Fatal framing error: {}", err);
                        conn.drop_writer(epoch).await;
                        pipeline.fail_active(err).await;
                    }
                    return;
                }
            },
            Err(err) => {
                tracing::error!("Read failed: {}", err);
                break;
            }
        }
    }

    if conn.current_epoch() == epoch {
        conn.drop_writer(epoch).await;
        pipeline.connection_lost().await;
    }
}

/// Flatten a merged map-reduce reply into its result rows.
///
/// Row batches accumulate under their phase number during the merge;
/// rows follow phase order, and arrival order within a phase.
fn flatten_rows(reply: Reply) -> Vec<Value> {
    let mut phases: Vec<(u64, Vec<Value>)> = Vec::new();
    for (name, value) in reply.iter() {
        let Ok(phase) = name.parse::<u64>() else {
            continue;
        };
        if let Value::Array(rows) = value {
            phases.push((phase, rows.clone()));
        }
    }
    phases.sort_by_key(|(phase, _)| *phase);
    phases.into_iter().flat_map(|(_, rows)| rows).collect()
}
