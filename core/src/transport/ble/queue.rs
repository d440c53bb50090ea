/// Flow-controlled outbound queue
///
/// Chunks wait in one lane per endpoint. A lane hands its head chunk to the
/// platform only when nothing is outstanding on that endpoint, and the next
/// chunk is released by the platform's acknowledgement. Messages resolve their
/// completion handle when the acknowledged chunk is their EOT chunk.

use crate::transport::abstraction::{EndpointId, LinkError, OperationSink};
use crate::transport::ble::framing::Chunk;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default bound on queued chunks across all endpoints
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000_000;

type Completion = oneshot::Sender<Result<(), LinkError>>;

/// Resolves once a message's final chunk is acknowledged, or with the error
/// that stopped it.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<Result<(), LinkError>>,
}

impl CompletionHandle {
    /// Non-blocking check; `None` while the message is still in flight
    pub fn try_result(&mut self) -> Option<Result<(), LinkError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(LinkError::ConnectionLost)),
        }
    }
}

impl Future for CompletionHandle {
    type Output = Result<(), LinkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(LinkError::ConnectionLost)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug)]
struct QueuedChunk {
    message: u64,
    chunk: Chunk,
}

#[derive(Debug, Default)]
struct Lane {
    pending: VecDeque<QueuedChunk>,
    in_flight: Option<QueuedChunk>,
}

pub struct FlowQueue {
    capacity: usize,
    queued: usize,
    lanes: HashMap<EndpointId, Lane>,
    completions: HashMap<u64, Completion>,
    next_message: u64,
}

impl FlowQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queued: 0,
            lanes: HashMap::new(),
            completions: HashMap::new(),
            next_message: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks waiting to be dispatched (in-flight chunks excluded)
    pub fn len(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0 && self.outstanding() == 0
    }

    /// Chunks currently handed to the platform and not yet acknowledged
    pub fn outstanding(&self) -> usize {
        self.lanes.values().filter(|l| l.in_flight.is_some()).count()
    }

    pub fn is_outstanding(&self, endpoint: &EndpointId) -> bool {
        self.lanes
            .get(endpoint)
            .map(|l| l.in_flight.is_some())
            .unwrap_or(false)
    }

    /// Messages whose completion has not been resolved yet
    pub fn pending_messages(&self) -> usize {
        self.completions.len()
    }

    /// Queue all chunks of one message, or none of them
    pub fn enqueue(
        &mut self,
        endpoint: EndpointId,
        chunks: Vec<Chunk>,
        sink: &dyn OperationSink,
    ) -> Result<CompletionHandle, LinkError> {
        let available = self.capacity.saturating_sub(self.queued);
        if chunks.len() > available {
            return Err(LinkError::QueueFull {
                requested: chunks.len(),
                available,
            });
        }

        let (tx, rx) = oneshot::channel();
        if chunks.is_empty() {
            let _ = tx.send(Ok(()));
            return Ok(CompletionHandle { rx });
        }

        let message = self.next_message;
        self.next_message += 1;
        self.completions.insert(message, tx);

        let lane = self.lanes.entry(endpoint).or_default();
        self.queued += chunks.len();
        lane.pending
            .extend(chunks.into_iter().map(|chunk| QueuedChunk { message, chunk }));

        self.pump(endpoint, sink);
        Ok(CompletionHandle { rx })
    }

    /// The platform acknowledged the outstanding operation on `endpoint`
    pub fn on_operation_complete(
        &mut self,
        endpoint: EndpointId,
        sink: &dyn OperationSink,
    ) -> Result<(), LinkError> {
        let done = self.take_in_flight(endpoint)?;
        debug!("Chunk acknowledged on {} (eot={})", endpoint, done.chunk.eot);

        if done.chunk.eot {
            if let Some(tx) = self.completions.remove(&done.message) {
                let _ = tx.send(Ok(()));
            }
        }

        self.pump(endpoint, sink);
        Ok(())
    }

    /// The platform reported the outstanding operation on `endpoint` failed
    pub fn on_operation_failed(
        &mut self,
        endpoint: EndpointId,
        error: LinkError,
        sink: &dyn OperationSink,
    ) -> Result<(), LinkError> {
        let failed = self.take_in_flight(endpoint)?;
        self.fail_message(endpoint, failed.message, error);
        self.pump(endpoint, sink);
        Ok(())
    }

    /// Reject every pending message and empty all lanes
    pub fn drain(&mut self, error: LinkError) {
        let rejected = self.completions.len();
        for (_, tx) in self.completions.drain() {
            let _ = tx.send(Err(error.clone()));
        }
        self.lanes.clear();
        self.queued = 0;
        if rejected > 0 {
            debug!("Drained {} pending messages: {}", rejected, error);
        }
    }

    fn take_in_flight(&mut self, endpoint: EndpointId) -> Result<QueuedChunk, LinkError> {
        self.lanes
            .get_mut(&endpoint)
            .and_then(|lane| lane.in_flight.take())
            .ok_or_else(|| {
                LinkError::ProtocolViolation(format!(
                    "operation result on {} with nothing outstanding",
                    endpoint
                ))
            })
    }

    fn fail_message(&mut self, endpoint: EndpointId, message: u64, error: LinkError) {
        warn!("Message on {} failed: {}", endpoint, error);

        if let Some(lane) = self.lanes.get_mut(&endpoint) {
            let before = lane.pending.len();
            lane.pending.retain(|q| q.message != message);
            self.queued -= before - lane.pending.len();
        }

        if let Some(tx) = self.completions.remove(&message) {
            let _ = tx.send(Err(error));
        }
    }

    /// Dispatch the lane head if the lane is idle
    fn pump(&mut self, endpoint: EndpointId, sink: &dyn OperationSink) {
        loop {
            let next = match self.lanes.get_mut(&endpoint) {
                Some(lane) if lane.in_flight.is_none() => match lane.pending.pop_front() {
                    Some(next) => next,
                    None => return,
                },
                _ => return,
            };
            self.queued -= 1;

            let bytes = next.chunk.to_bytes();
            match sink.start_operation(endpoint, next.chunk.kind, &bytes) {
                Ok(()) => {
                    debug!(
                        "Dispatched {} byte {} chunk on {}",
                        bytes.len(),
                        next.chunk.kind,
                        endpoint
                    );
                    if let Some(lane) = self.lanes.get_mut(&endpoint) {
                        lane.in_flight = Some(next);
                    }
                    return;
                }
                Err(e) => self.fail_message(endpoint, next.message, e),
            }
        }
    }
}

impl Default for FlowQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
