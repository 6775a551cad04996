//! Request pipeline: FIFO queue, single-flight dispatch, reply assembly.
//!
//! The protocol multiplexes every operation over one TCP connection with
//! no request identifiers, so correctness rests on a strict discipline: at
//! most one task is in flight per connection, and inbound frames always
//! belong to the task at the head. The pipeline owns the only two pieces
//! of shared mutable state (the queue and the active-task slot) behind one
//! async mutex.
//!
//! State machine per connection:
//!
//! ```text
//! Idle ──dispatch──► Dispatching ──transmit ok──► AwaitingReply
//!  ▲                      │                            │
//!  └──────transmit error──┴────────task resolved───────┘
//! ```
//!
//! A task resolves exactly once; resolution consumes it.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::codec::Translator;
use crate::error::{Error, Result};
use crate::protocol::catalog::{self, ERROR_RESP_CODE};
use crate::protocol::Frame;
use crate::reply::Reply;
use crate::transport::Transport;

/// Where a task's outcome goes: a one-shot completion or a push sink.
pub(crate) enum TaskOutput {
    /// Single aggregated reply (or error) once the task resolves.
    Callback(oneshot::Sender<Result<Reply>>),
    /// Fragment-by-fragment delivery; the bound provides backpressure.
    Stream(mpsc::Sender<Result<Reply>>),
}

/// One queued operation.
pub(crate) struct Task {
    /// Fully encoded request frame, ready for the wire.
    pub message: Bytes,
    /// Whether the response spans multiple frames (until a done marker).
    pub expect_multiple: bool,
    /// Completion handle or stream sink.
    pub output: TaskOutput,
    /// Transmissions so far; bounds redelivery across reconnects.
    pub attempts: u32,
}

/// The active task plus its reply accumulation state.
struct ActiveTask {
    task: Task,
    accumulated: Reply,
    pending_error: Option<Error>,
    /// A stream error was emitted; no further fragments may be pushed.
    stream_failed: bool,
}

impl ActiveTask {
    fn new(task: Task) -> Self {
        Self {
            task,
            accumulated: Reply::new(),
            pending_error: None,
            stream_failed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Idle,
    Dispatching,
    AwaitingReply,
}

struct Inner {
    queue: VecDeque<Task>,
    active: Option<ActiveTask>,
    state: DispatchState,
}

/// Per-connection request pipeline.
pub(crate) struct Pipeline<T: Transport> {
    inner: Mutex<Inner>,
    transport: Arc<T>,
    translator: Arc<dyn Translator>,
    max_attempts: u32,
}

impl<T: Transport> Pipeline<T> {
    pub(crate) fn new(transport: Arc<T>, translator: Arc<dyn Translator>, max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                active: None,
                state: DispatchState::Idle,
            }),
            transport,
            translator,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Append a task to the queue and dispatch if the pipeline is idle.
    pub(crate) async fn enqueue(self: &Arc<Self>, task: Task) {
        self.inner.lock().await.queue.push_back(task);
        self.dispatch().await;
    }

    /// Transmit the head task if the pipeline is idle.
    ///
    /// A transmit failure resolves the failed task with the transmission
    /// error and moves on to the next queued task, so a broken transport
    /// never leaves the queue hanging behind an unsent head.
    pub(crate) async fn dispatch(self: &Arc<Self>) {
        loop {
            let message = {
                let mut inner = self.inner.lock().await;
                if inner.state != DispatchState::Idle {
                    return;
                }
                let Some(task) = inner.queue.pop_front() else {
                    return;
                };
                inner.state = DispatchState::Dispatching;
                let message = task.message.clone();
                inner.active = Some(ActiveTask::new(task));
                message
            };

            match self.transport.send(&message).await {
                Ok(()) => {
                    let mut inner = self.inner.lock().await;
                    // The reply may already have resolved the task on a
                    // fast connection; only advance from Dispatching.
                    if inner.state == DispatchState::Dispatching {
                        inner.state = DispatchState::AwaitingReply;
                    }
                    return;
                }
                Err(err) => {
                    tracing::error!("Transmit failed: {}", err);
                    let active = {
                        let mut inner = self.inner.lock().await;
                        inner.state = DispatchState::Idle;
                        inner.active.take()
                    };
                    if let Some(mut active) = active {
                        active.pending_error = Some(err);
                        resolve_task(active).await;
                    }
                    // Try the next queued task.
                }
            }
        }
    }

    /// Process one inbound frame for the active task.
    pub(crate) async fn on_frame(self: &Arc<Self>, frame: Frame) {
        let mut inner = self.inner.lock().await;

        let Some(active) = inner.active.as_mut() else {
            tracing::warn!("Dropping frame with code {}: no active task", frame.code);
            return;
        };

        let is_error_frame = frame.code == ERROR_RESP_CODE;
        let decoded = catalog::name_of(frame.code)
            .and_then(|name| self.translator.decode(name, &frame.payload));

        let mut complete = !active.task.expect_multiple || is_error_frame;

        match decoded {
            // Catalog/decode failures complete the task like protocol
            // errors; the frame is unusable.
            Err(err) => {
                match &active.task.output {
                    TaskOutput::Stream(tx) => {
                        if !active.stream_failed {
                            let _ = tx.send(Err(err)).await;
                            active.stream_failed = true;
                        }
                    }
                    TaskOutput::Callback(_) => active.pending_error = Some(err),
                }
                complete = true;
            }
            Ok(reply) => {
                let done = reply.is_done();
                if done {
                    complete = true;
                }

                let embedded = if is_error_frame {
                    Some(reply.embedded_error().unwrap_or_else(|| {
                        ("Server returned an error response".to_string(), 0)
                    }))
                } else {
                    reply.embedded_error()
                };

                if let Some((message, code)) = embedded {
                    let err = Error::Remote { message, code };
                    match &active.task.output {
                        TaskOutput::Stream(tx) => {
                            if !active.stream_failed {
                                let _ = tx.send(Err(err)).await;
                                active.stream_failed = true;
                            }
                        }
                        TaskOutput::Callback(_) => active.pending_error = Some(err),
                    }
                } else if let TaskOutput::Stream(tx) = &active.task.output {
                    // The done marker is consumed, never forwarded.
                    if !done && !active.stream_failed {
                        let _ = tx.send(Ok(reply.clone())).await;
                    }
                }

                match active.task.output {
                    TaskOutput::Stream(_) => active.accumulated = reply,
                    TaskOutput::Callback(_) => active.accumulated.merge(reply),
                }
            }
        }

        if !complete {
            return;
        }

        let active = inner.active.take().expect("active task checked above");
        inner.state = DispatchState::Idle;
        drop(inner);

        resolve_task(active).await;
        self.dispatch().await;
    }

    /// Re-queue the active task at the head after a deliberate disconnect.
    ///
    /// Accumulated reply state is discarded; the task will be transmitted
    /// from scratch on the next connection.
    pub(crate) async fn requeue_active(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = DispatchState::Idle;
        if let Some(active) = inner.active.take() {
            tracing::debug!("Re-queueing in-flight request after disconnect");
            inner.queue.push_front(active.task);
        }
    }

    /// Handle a spontaneous connection loss (EOF or read error).
    ///
    /// The active task is re-queued at the head for redelivery unless its
    /// attempt budget is spent, in which case it resolves with
    /// [`Error::ConnectionClosed`].
    pub(crate) async fn connection_lost(self: &Arc<Self>) {
        let exhausted = {
            let mut inner = self.inner.lock().await;
            inner.state = DispatchState::Idle;
            match inner.active.take() {
                None => {
                    tracing::debug!("Connection lost while idle");
                    None
                }
                Some(mut active) => {
                    active.task.attempts += 1;
                    if active.task.attempts < self.max_attempts {
                        tracing::warn!(
                            attempts = active.task.attempts,
                            "Connection lost; re-queueing in-flight request"
                        );
                        inner.queue.push_front(active.task);
                        None
                    } else {
                        active.pending_error = Some(Error::ConnectionClosed);
                        Some(active)
                    }
                }
            }
        };
        if let Some(active) = exhausted {
            tracing::error!("Dispatch attempts exhausted; failing in-flight request");
            resolve_task(active).await;
        }
    }

    /// Resolve the active task with a fatal connection error (corrupt
    /// framing); the stream cannot be resynchronized, so no redelivery.
    pub(crate) async fn fail_active(self: &Arc<Self>, err: Error) {
        let active = {
            let mut inner = self.inner.lock().await;
            inner.state = DispatchState::Idle;
            inner.active.take()
        };
        match active {
            Some(mut active) => {
                active.pending_error = Some(err);
                resolve_task(active).await;
            }
            None => tracing::error!("Connection failed while idle: {}", err),
        }
    }

    #[cfg(test)]
    async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

/// Deliver a task's outcome. Consuming the task makes double resolution
/// unrepresentable.
async fn resolve_task(active: ActiveTask) {
    match active.task.output {
        TaskOutput::Callback(tx) => {
            let result = match active.pending_error {
                Some(err) => Err(err),
                None => Ok(active.accumulated),
            };
            // The caller may have gone away; nothing to do then.
            let _ = tx.send(result);
        }
        TaskOutput::Stream(tx) => {
            if let Some(err) = active.pending_error {
                if !active.stream_failed {
                    let _ = tx.send(Err(err)).await;
                }
            }
            // Dropping the sender closes the stream.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonTranslator;
    use crate::protocol::encode_request;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport double: records transmissions, optionally failing them.
    struct MockTransport {
        sent: std::sync::Mutex<Vec<Vec<u8>>>,
        fail_sends: AtomicBool,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: std::sync::Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
            })
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        async fn send(&self, bytes: &[u8]) -> Result<()> {
            if self.fail_sends.load(Ordering::Acquire) {
                return Err(Error::NotConnected);
            }
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    fn pipeline(transport: &Arc<MockTransport>) -> Arc<Pipeline<MockTransport>> {
        Arc::new(Pipeline::new(
            transport.clone(),
            Arc::new(JsonTranslator::new()),
            3,
        ))
    }

    fn callback_task(
        tag: u8,
        expect_multiple: bool,
    ) -> (Task, oneshot::Receiver<Result<Reply>>) {
        let (tx, rx) = oneshot::channel();
        let task = Task {
            message: encode_request(tag, &[]),
            expect_multiple,
            output: TaskOutput::Callback(tx),
            attempts: 0,
        };
        (task, rx)
    }

    fn stream_task(tag: u8) -> (Task, mpsc::Receiver<Result<Reply>>) {
        let (tx, rx) = mpsc::channel(8);
        let task = Task {
            message: encode_request(tag, &[]),
            expect_multiple: true,
            output: TaskOutput::Stream(tx),
            attempts: 0,
        };
        (task, rx)
    }

    fn frame(code: u8, json: &str) -> Frame {
        Frame::new(code, Bytes::copy_from_slice(json.as_bytes()))
    }

    #[tokio::test]
    async fn test_single_frame_reply_resolves() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        let (task, rx) = callback_task(9, false);
        pipeline.enqueue(task).await;

        pipeline.on_frame(frame(10, r#"{ "value": "v" }"#)).await;

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.get("value"), Some(&serde_json::json!("v")));
    }

    #[tokio::test]
    async fn test_single_flight_holds_second_task() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        let (a, rx_a) = callback_task(1, false);
        let (b, rx_b) = callback_task(9, false);
        pipeline.enqueue(a).await;
        pipeline.enqueue(b).await;

        // Only the first task's bytes have been transmitted.
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent()[0], encode_request(1, &[]).to_vec());
        assert_eq!(pipeline.queue_len().await, 1);

        pipeline.on_frame(frame(2, "")).await;
        rx_a.await.unwrap().unwrap();

        // Resolution of the first releases the second.
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(transport.sent()[1], encode_request(9, &[]).to_vec());

        pipeline.on_frame(frame(10, r#"{ "value": "v" }"#)).await;
        rx_b.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fifo_dispatch_order() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        let mut receivers = Vec::new();
        for tag in [1u8, 9, 13] {
            let (task, rx) = callback_task(tag, false);
            pipeline.enqueue(task).await;
            receivers.push(rx);
        }

        // Resolve each in turn; dispatch order must match enqueue order
        // regardless of resolution timing.
        for (code, rx) in [2u8, 10, 14].into_iter().zip(receivers) {
            pipeline.on_frame(frame(code, "")).await;
            rx.await.unwrap().unwrap();
        }

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0][4], 1);
        assert_eq!(sent[1][4], 9);
        assert_eq!(sent[2][4], 13);
    }

    #[tokio::test]
    async fn test_multi_frame_reply_merges_until_done() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        let (task, rx) = callback_task(17, true);
        pipeline.enqueue(task).await;

        pipeline
            .on_frame(frame(18, r#"{ "keys": ["a", "b"] }"#))
            .await;
        pipeline.on_frame(frame(18, r#"{ "keys": ["c"] }"#)).await;
        pipeline
            .on_frame(frame(18, r#"{ "done": true }"#))
            .await;

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.get("keys"), Some(&serde_json::json!(["a", "b", "c"])));
        assert!(reply.is_done());
    }

    #[tokio::test]
    async fn test_transmit_failure_resolves_and_unblocks() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        transport.fail_sends.store(true, Ordering::Release);
        let (a, rx_a) = callback_task(1, false);
        pipeline.enqueue(a).await;

        // Head task resolved with the transmission error instead of
        // wedging the queue.
        assert!(matches!(rx_a.await.unwrap(), Err(Error::NotConnected)));

        transport.fail_sends.store(false, Ordering::Release);
        let (b, rx_b) = callback_task(9, false);
        pipeline.enqueue(b).await;
        assert_eq!(transport.sent().len(), 1);

        pipeline.on_frame(frame(10, "")).await;
        rx_b.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transmit_failure_surfaces_on_stream() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        transport.fail_sends.store(true, Ordering::Release);
        let (task, mut rx) = stream_task(17);
        pipeline.enqueue(task).await;

        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_error_frame_resolves_callback_task() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        let (task, rx) = callback_task(9, false);
        pipeline.enqueue(task).await;

        pipeline
            .on_frame(frame(0, r#"{ "errmsg": "not found", "errcode": 4 }"#))
            .await;

        match rx.await.unwrap() {
            Err(Error::Remote { message, code }) => {
                assert_eq!(message, "not found");
                assert_eq!(code, 4);
            }
            other => panic!("expected remote error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_error_frame_mid_stream_terminates() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        let (task, mut rx) = stream_task(17);
        pipeline.enqueue(task).await;

        pipeline.on_frame(frame(18, r#"{ "keys": ["a"] }"#)).await;
        pipeline
            .on_frame(frame(0, r#"{ "errmsg": "overload", "errcode": 1 }"#))
            .await;

        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_err());
        // Stream closed; nothing further can be pushed for this task.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_done_marker_not_forwarded_to_stream() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        let (task, mut rx) = stream_task(17);
        pipeline.enqueue(task).await;

        pipeline.on_frame(frame(18, r#"{ "keys": ["a"] }"#)).await;
        pipeline.on_frame(frame(18, r#"{ "done": true }"#)).await;

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.get("keys"), Some(&serde_json::json!(["a"])));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_code_resolves_with_protocol_error() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        let (task, rx) = callback_task(9, true);
        pipeline.enqueue(task).await;

        pipeline.on_frame(frame(99, "")).await;

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Unknown message code"));
    }

    #[tokio::test]
    async fn test_frame_without_active_task_is_dropped() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        // Must not panic or disturb later operations.
        pipeline.on_frame(frame(2, "")).await;

        let (task, rx) = callback_task(1, false);
        pipeline.enqueue(task).await;
        pipeline.on_frame(frame(2, "")).await;
        rx.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_requeue_active_goes_to_head() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        let (a, rx_a) = callback_task(17, true);
        let (b, rx_b) = callback_task(9, false);
        pipeline.enqueue(a).await;
        pipeline.enqueue(b).await;
        assert_eq!(transport.sent().len(), 1);

        // Disconnect while A is in flight: A returns to the head, ahead
        // of B.
        pipeline.requeue_active().await;
        assert_eq!(pipeline.queue_len().await, 2);

        pipeline.dispatch().await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1][4], 17, "re-queued task dispatched before B");

        pipeline.on_frame(frame(18, r#"{ "done": true }"#)).await;
        rx_a.await.unwrap().unwrap();
        pipeline.on_frame(frame(10, "")).await;
        rx_b.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_lost_bounded_redelivery() {
        let transport = MockTransport::new();
        let pipeline = Arc::new(Pipeline::new(
            transport.clone(),
            Arc::new(JsonTranslator::new()) as Arc<dyn Translator>,
            2,
        ));

        let (task, rx) = callback_task(9, false);
        pipeline.enqueue(task).await;

        // First loss re-queues (attempt budget not yet spent).
        pipeline.connection_lost().await;
        assert_eq!(pipeline.queue_len().await, 1);

        pipeline.dispatch().await;
        pipeline.connection_lost().await;

        // Second loss exhausts the budget.
        assert!(matches!(rx.await.unwrap(), Err(Error::ConnectionClosed)));
        assert_eq!(pipeline.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_fail_active_resolves_with_given_error() {
        let transport = MockTransport::new();
        let pipeline = pipeline(&transport);

        let (task, rx) = callback_task(17, true);
        pipeline.enqueue(task).await;

        pipeline
            .fail_active(Error::Protocol("Frame length prefix is zero".to_string()))
            .await;

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("length prefix is zero"));
    }
}
