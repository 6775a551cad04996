//! Streaming output for multi-response operations.
//!
//! Key listing, secondary-index queries and map-reduce deliver their reply
//! as a sequence of fragments. The pipeline pushes each decoded fragment
//! into a bounded channel as it arrives; [`ReplyStream`] is the consumer
//! end. The channel bound is the backpressure mechanism: when the consumer
//! falls behind, the pipeline's frame processing stalls and TCP stops
//! pulling.
//!
//! The stream ends when the pipeline resolves the task (the terminal done
//! marker is consumed, not forwarded). A server-side error arrives as an
//! `Err` item and closes the stream.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::codec::MAPRED_RESPONSE_FIELD;
use crate::error::{Error, Result};
use crate::reply::Reply;

/// Push-based sequence of decoded reply fragments.
pub struct ReplyStream {
    rx: mpsc::Receiver<Result<Reply>>,
}

impl ReplyStream {
    pub(crate) fn new(rx: mpsc::Receiver<Result<Reply>>) -> Self {
        Self { rx }
    }

    /// Next fragment, or `None` once the operation has completed.
    pub async fn next(&mut self) -> Option<Result<Reply>> {
        self.rx.recv().await
    }

    /// Drain the stream, failing on the first error item.
    pub async fn collect(mut self) -> Result<Vec<Reply>> {
        let mut fragments = Vec::new();
        while let Some(item) = self.next().await {
            fragments.push(item?);
        }
        Ok(fragments)
    }
}

/// Row-flattening adapter for streaming map-reduce.
///
/// Each underlying fragment carries a JSON-encoded array of result rows in
/// its `response` field; the adapter parses the batch and re-emits each row
/// as an individual item, turning phase batching into a flat row sequence.
/// Errors from the base stream are forwarded unchanged.
pub struct MapReduceStream {
    inner: ReplyStream,
    pending: VecDeque<Value>,
    finished: bool,
}

impl MapReduceStream {
    pub(crate) fn new(inner: ReplyStream) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Next result row, or `None` once the operation has completed.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Some(Ok(row));
            }
            if self.finished {
                return None;
            }

            match self.inner.next().await {
                None => {
                    self.finished = true;
                    return None;
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                Some(Ok(fragment)) => {
                    if let Err(err) = self.queue_rows(&fragment) {
                        self.finished = true;
                        return Some(Err(err));
                    }
                }
            }
        }
    }

    /// Drain the stream into a flat row vector.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        while let Some(item) = self.next().await {
            rows.push(item?);
        }
        Ok(rows)
    }

    fn queue_rows(&mut self, fragment: &Reply) -> Result<()> {
        let raw = match fragment.get(MAPRED_RESPONSE_FIELD) {
            Some(Value::String(s)) => s,
            // Bookkeeping fragment without a row batch.
            _ => return Ok(()),
        };

        match serde_json::from_str(raw)? {
            Value::Array(rows) => {
                self.pending.extend(rows);
                Ok(())
            }
            _ => Err(Error::Protocol(
                "Map-reduce response is not a JSON array".to_string(),
            )),
        }
    }
}
