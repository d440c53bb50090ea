/// Per-connection link state
///
/// A `ConnectionSession` owns everything that must not outlive one link: the
/// reassembly buffers, the outbound queue, subscriptions and read cursors.
/// Dropping it through `teardown` rejects whatever was still in flight.

use crate::message::PayloadCodec;
use crate::transport::abstraction::{EndpointId, LinkError, OperationSink};
use crate::transport::ble::framing::{frame, OperationKind};
use crate::transport::ble::gatt::{EndpointRegistry, Role};
use crate::transport::ble::queue::{CompletionHandle, FlowQueue};
use crate::transport::ble::reassembly::{ReassemblyOutcome, Reassembler};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Monotonic identifier of a session within one controller
pub type SessionId = u64;

pub struct ConnectionSession<C: PayloadCodec> {
    id: SessionId,
    remote: String,
    role: Role,
    endpoints: Arc<EndpointRegistry>,
    codec: Arc<C>,
    reassembler: Reassembler<C>,
    queue: FlowQueue,
    subscribed: HashSet<EndpointId>,
    read_cursors: HashMap<EndpointId, VecDeque<Vec<u8>>>,
}

impl<C: PayloadCodec> ConnectionSession<C> {
    pub fn new(
        id: SessionId,
        remote: impl Into<String>,
        role: Role,
        endpoints: Arc<EndpointRegistry>,
        codec: Arc<C>,
        queue_capacity: usize,
    ) -> Self {
        let remote = remote.into();
        debug!("Session {} opened with {}", id, remote);
        Self {
            id,
            remote,
            role,
            reassembler: Reassembler::new(role, endpoints.clone(), codec.clone()),
            endpoints,
            codec,
            queue: FlowQueue::new(queue_capacity),
            subscribed: HashSet::new(),
            read_cursors: HashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Dispatched chunks not yet acknowledged
    pub fn outstanding(&self) -> usize {
        self.queue.outstanding()
    }

    /// Chunks waiting for dispatch
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_bytes(&self, endpoint: &EndpointId) -> usize {
        self.reassembler.pending_bytes(endpoint)
    }

    pub fn is_subscribed(&self, endpoint: &EndpointId) -> bool {
        self.subscribed.contains(endpoint)
    }

    /// Record a subscription to an indicatable endpoint
    pub fn subscribe(&mut self, endpoint: EndpointId) -> Result<(), LinkError> {
        let registered = self
            .endpoints
            .get(&endpoint)
            .ok_or(LinkError::UnknownEndpoint(endpoint))?;
        if !registered.is_consumable() {
            return Err(LinkError::ProtocolViolation(format!(
                "{} does not support indications",
                registered.name
            )));
        }
        self.subscribed.insert(endpoint);
        Ok(())
    }

    pub fn unsubscribe(&mut self, endpoint: &EndpointId) {
        self.subscribed.remove(endpoint);
    }

    /// Encode, frame and queue one message
    pub fn send(
        &mut self,
        endpoint: EndpointId,
        message: &C::Message,
        kind: OperationKind,
        sink: &dyn OperationSink,
    ) -> Result<CompletionHandle, LinkError> {
        let registered = self
            .endpoints
            .get(&endpoint)
            .ok_or(LinkError::UnknownEndpoint(endpoint))?;

        if self.role.receives(kind) || !registered.accepts(kind) {
            return Err(LinkError::ProtocolViolation(format!(
                "cannot send {} on {}",
                kind, registered.name
            )));
        }
        if kind == OperationKind::Indicate && !self.subscribed.contains(&endpoint) {
            return Err(LinkError::NotSubscribed(endpoint));
        }

        let bytes = self
            .codec
            .encode(message)
            .map_err(|e| LinkError::Encode(e.to_string()))?;
        let chunks = frame(&bytes, registered.max_chunk_size, kind, self.queue.capacity())?;

        debug!(
            "Queueing {} bytes as {} chunks on {}",
            bytes.len(),
            chunks.len(),
            registered.name
        );
        self.queue.enqueue(endpoint, chunks, sink)
    }

    /// Next read-response chunk for `endpoint`; frames `value` when the
    /// previous read sequence has been fully served
    pub fn next_read_chunk(
        &mut self,
        endpoint: EndpointId,
        value: &C::Message,
    ) -> Result<Vec<u8>, LinkError> {
        let registered = self
            .endpoints
            .get(&endpoint)
            .ok_or(LinkError::UnknownEndpoint(endpoint))?;

        let cursor = self.read_cursors.entry(endpoint).or_default();
        if cursor.is_empty() {
            let bytes = self
                .codec
                .encode(value)
                .map_err(|e| LinkError::Encode(e.to_string()))?;
            let chunks = frame(
                &bytes,
                registered.max_chunk_size,
                OperationKind::ReadResponse,
                self.queue.capacity(),
            )?;
            cursor.extend(chunks.iter().map(|c| c.to_bytes()));
        }

        cursor
            .pop_front()
            .ok_or_else(|| LinkError::Operation("empty read sequence".to_string()))
    }

    /// Feed bytes received from the remote side
    pub fn on_data(
        &mut self,
        endpoint: EndpointId,
        data: &[u8],
        now: Instant,
    ) -> ReassemblyOutcome<C::Message> {
        self.reassembler.on_bytes(endpoint, data, now)
    }

    /// Forget a partially received message on `endpoint`
    pub fn discard_partial(&mut self, endpoint: EndpointId, kind: OperationKind) {
        let dropped = self.reassembler.discard(endpoint, kind);
        if dropped > 0 {
            debug!("Dropped {} partial bytes on {}", dropped, endpoint);
        }
    }

    pub fn on_operation_complete(
        &mut self,
        endpoint: EndpointId,
        sink: &dyn OperationSink,
    ) -> Result<(), LinkError> {
        self.queue.on_operation_complete(endpoint, sink)
    }

    pub fn on_operation_failed(
        &mut self,
        endpoint: EndpointId,
        error: LinkError,
        sink: &dyn OperationSink,
    ) -> Result<(), LinkError> {
        self.queue.on_operation_failed(endpoint, error, sink)
    }

    pub fn expire_stale(&mut self, now: Instant, timeout: Duration) -> Vec<LinkError> {
        self.reassembler.expire_stale(now, timeout)
    }

    /// Release all per-connection state and reject pending completions
    pub fn teardown(mut self) {
        let pending = self.queue.pending_messages();
        self.queue.drain(LinkError::ConnectionLost);
        self.reassembler.clear();
        self.subscribed.clear();
        self.read_cursors.clear();
        info!(
            "Session {} with {} closed ({} messages rejected)",
            self.id, self.remote, pending
        );
    }
}

/// Anything holding sessions whose partial messages can go stale
pub trait StaleSweep: Send + Sync {
    fn expire_stale(&self, now: Instant) -> Vec<LinkError>;
}

/// Run `expire_stale` on a fixed interval until the task is aborted
pub fn spawn_sweeper<T: StaleSweep + 'static>(target: Arc<T>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let expired = target.expire_stale(Instant::now());
            if !expired.is_empty() {
                debug!("Sweeper reclaimed {} stale buffers", expired.len());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::JsonCodec;
    use crate::transport::ble::framing::Chunk;
    use crate::transport::ble::gatt::{
        default_endpoints, COMMAND_CHAR_UUID, DEFAULT_MTU, DEV_INFO_CHAR_UUID,
    };
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl OperationSink for Recorder {
        fn start_operation(
            &self,
            _endpoint: EndpointId,
            _kind: OperationKind,
            data: &[u8],
        ) -> Result<(), LinkError> {
            self.sent.lock().push(data.to_vec());
            Ok(())
        }
    }

    fn session(role: Role) -> ConnectionSession<JsonCodec> {
        let registry = EndpointRegistry::new(default_endpoints(DEFAULT_MTU)).unwrap();
        ConnectionSession::new(
            1,
            "aa:bb:cc:dd:ee:ff",
            role,
            Arc::new(registry),
            Arc::new(JsonCodec),
            64,
        )
    }

    #[test]
    fn test_indicate_requires_subscription() {
        let sink = Recorder::default();
        let mut s = session(Role::Peripheral);

        let result = s.send(
            DEV_INFO_CHAR_UUID,
            &json!({"v": 1}),
            OperationKind::Indicate,
            &sink,
        );
        assert!(matches!(result, Err(LinkError::NotSubscribed(_))));

        s.subscribe(DEV_INFO_CHAR_UUID).unwrap();
        s.send(
            DEV_INFO_CHAR_UUID,
            &json!({"v": 1}),
            OperationKind::Indicate,
            &sink,
        )
        .unwrap();
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[test]
    fn test_send_rejects_wrong_direction() {
        let sink = Recorder::default();
        let mut s = session(Role::Central);

        // a central never indicates
        let result = s.send(
            COMMAND_CHAR_UUID,
            &json!("x"),
            OperationKind::Indicate,
            &sink,
        );
        assert!(matches!(result, Err(LinkError::ProtocolViolation(_))));

        // dev-info is not writable
        let result = s.send(DEV_INFO_CHAR_UUID, &json!("x"), OperationKind::Write, &sink);
        assert!(matches!(result, Err(LinkError::ProtocolViolation(_))));
    }

    #[test]
    fn test_send_oversize() {
        let sink = Recorder::default();
        let mut s = session(Role::Central);
        let big = json!("y".repeat(19 * 80));

        let result = s.send(COMMAND_CHAR_UUID, &big, OperationKind::Write, &sink);
        assert!(matches!(result, Err(LinkError::Oversize { .. })));
        assert_eq!(s.queued(), 0);
        assert!(sink.sent.lock().is_empty());
    }

    #[test]
    fn test_read_chunks_cycle() {
        let mut s = session(Role::Peripheral);
        let value = json!({"device": "lock-0001", "fw": "1.2.3"});
        let encoded = serde_json::to_vec(&value).unwrap();

        let mut collected = Vec::new();
        loop {
            let bytes = s.next_read_chunk(DEV_INFO_CHAR_UUID, &value).unwrap();
            let chunk = Chunk::from_bytes(&bytes).unwrap();
            assert_eq!(chunk.kind, OperationKind::ReadResponse);
            collected.extend_from_slice(&chunk.payload);
            if chunk.eot {
                break;
            }
        }
        assert_eq!(collected, encoded);

        // The next read starts a fresh sequence
        let first = Chunk::from_bytes(&s.next_read_chunk(DEV_INFO_CHAR_UUID, &value).unwrap())
            .unwrap();
        assert_eq!(first.payload, encoded[..19].to_vec());
    }

    #[test]
    fn test_teardown_rejects_pending() {
        let sink = Recorder::default();
        let mut s = session(Role::Central);
        let mut handle = s
            .send(
                COMMAND_CHAR_UUID,
                &json!({"long": "z".repeat(50)}),
                OperationKind::Write,
                &sink,
            )
            .unwrap();

        s.on_data(
            DEV_INFO_CHAR_UUID,
            &[OperationKind::Indicate.bits(), b'{'],
            Instant::now(),
        );
        assert_eq!(s.pending_bytes(&DEV_INFO_CHAR_UUID), 1);

        s.teardown();
        assert_eq!(handle.try_result(), Some(Err(LinkError::ConnectionLost)));
    }
}
