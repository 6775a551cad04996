//! # kvpbc
//!
//! Async TCP client for a clustered key-value store speaking a
//! length-prefixed binary request/response protocol.
//!
//! The protocol multiplexes every operation over one connection without
//! request identifiers, so the client enforces a strict single-flight
//! discipline: requests queue FIFO, at most one is outstanding, and each
//! inbound frame belongs to the request at the head. Multi-frame
//! responses are merged into one logical reply, or delivered as a
//! backpressure-aware stream for listing, index, and map-reduce
//! operations.
//!
//! ## Architecture
//!
//! - **protocol**: message catalog, frame layout, partial-read reassembly
//! - **pipeline**: FIFO queue, single-flight dispatch, reply assembly
//! - **codec**: payload translation seam (JSON by default, pluggable)
//! - **streaming**: push-based fragment streams and map-reduce row
//!   flattening
//! - **transport**: TCP connect/send/disconnect
//!
//! ## Example
//!
//! ```ignore
//! use kvpbc::Client;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> kvpbc::Result<()> {
//!     let client = Client::builder().port(8087).build();
//!     client.ping().await?;
//!
//!     let reply = client
//!         .get(json!({ "bucket": "users", "key": "u1" }))
//!         .await?;
//!     println!("{:?}", reply.get("content"));
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod protocol;
pub mod transport;

mod client;
mod error;
mod pipeline;
mod reply;
mod streaming;

pub use client::{Client, ClientBuilder, DEFAULT_MAX_DISPATCH_ATTEMPTS, DEFAULT_STREAM_CAPACITY};
pub use codec::{JsonTranslator, Translator};
pub use error::{Error, Result};
pub use reply::Reply;
pub use streaming::{MapReduceStream, ReplyStream};
