/// Reassembly of chunked messages
///
/// One buffer per (endpoint, operation kind) accumulates payload slices until
/// an EOT chunk arrives. Buffers that stop receiving chunks are reclaimed by
/// `expire_stale` so a dropped continuation cannot leak into the next message.

use crate::message::{PayloadCodec, MAX_MESSAGE_SIZE};
use crate::transport::abstraction::{EndpointId, LinkError};
use crate::transport::ble::framing::{Chunk, OperationKind};
use crate::transport::ble::gatt::{EndpointRegistry, Role};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Result of feeding one chunk
#[derive(Debug, Clone, PartialEq)]
pub enum ReassemblyOutcome<M> {
    /// More chunks are expected
    Incomplete,
    /// The message is complete and decoded
    Complete(M),
    /// The chunk or the message was rejected
    Error(LinkError),
}

#[derive(Debug)]
struct ReassemblyBuffer {
    data: Vec<u8>,
    last_update: Instant,
}

pub struct Reassembler<C: PayloadCodec> {
    role: Role,
    endpoints: Arc<EndpointRegistry>,
    codec: Arc<C>,
    buffers: HashMap<(EndpointId, OperationKind), ReassemblyBuffer>,
    max_message_size: usize,
}

impl<C: PayloadCodec> Reassembler<C> {
    pub fn new(role: Role, endpoints: Arc<EndpointRegistry>, codec: Arc<C>) -> Self {
        Self {
            role,
            endpoints,
            codec,
            buffers: HashMap::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Cap on bytes buffered for one message before EOT
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Parse wire bytes and feed the resulting chunk
    pub fn on_bytes(
        &mut self,
        endpoint: EndpointId,
        bytes: &[u8],
        now: Instant,
    ) -> ReassemblyOutcome<C::Message> {
        match Chunk::from_bytes(bytes) {
            Ok(chunk) => self.on_chunk(endpoint, chunk, now),
            Err(e) => ReassemblyOutcome::Error(e),
        }
    }

    /// Feed one chunk received on `endpoint`
    pub fn on_chunk(
        &mut self,
        endpoint: EndpointId,
        chunk: Chunk,
        now: Instant,
    ) -> ReassemblyOutcome<C::Message> {
        if let Err(e) = self.check_direction(endpoint, chunk.kind) {
            warn!("Rejected chunk on {}: {}", endpoint, e);
            return ReassemblyOutcome::Error(e);
        }

        let key = (endpoint, chunk.kind);
        let buffer = self.buffers.entry(key).or_insert_with(|| ReassemblyBuffer {
            data: Vec::new(),
            last_update: now,
        });
        buffer.data.extend_from_slice(&chunk.payload);
        buffer.last_update = now;

        if buffer.data.len() > self.max_message_size {
            let size = buffer.data.len();
            self.buffers.remove(&key);
            return ReassemblyOutcome::Error(LinkError::ProtocolViolation(format!(
                "message on {} exceeds {} bytes ({} buffered)",
                endpoint, self.max_message_size, size
            )));
        }

        if !chunk.eot {
            return ReassemblyOutcome::Incomplete;
        }

        let data = self
            .buffers
            .remove(&key)
            .map(|b| b.data)
            .unwrap_or_default();

        match self.codec.decode(&data) {
            Ok(message) => {
                debug!("Reassembled {} bytes on {}", data.len(), endpoint);
                ReassemblyOutcome::Complete(message)
            }
            Err(e) => ReassemblyOutcome::Error(LinkError::Decode {
                endpoint,
                reason: e.to_string(),
            }),
        }
    }

    fn check_direction(&self, endpoint: EndpointId, kind: OperationKind) -> Result<(), LinkError> {
        let registered = self.endpoints.get(&endpoint).ok_or_else(|| {
            LinkError::ProtocolViolation(format!("chunk for unregistered endpoint {}", endpoint))
        })?;

        if !self.role.receives(kind) || !registered.accepts(kind) {
            return Err(LinkError::ProtocolViolation(format!(
                "{} chunk not accepted on {} ({:?})",
                kind, registered.name, self.role
            )));
        }

        Ok(())
    }

    /// Drop every buffer idle for longer than `timeout`
    pub fn expire_stale(&mut self, now: Instant, timeout: Duration) -> Vec<LinkError> {
        let mut expired = Vec::new();
        self.buffers.retain(|(endpoint, _), buffer| {
            if now.saturating_duration_since(buffer.last_update) > timeout {
                warn!(
                    "Discarding {} stale bytes on {}",
                    buffer.data.len(),
                    endpoint
                );
                expired.push(LinkError::ReassemblyTimeout {
                    endpoint: *endpoint,
                });
                false
            } else {
                true
            }
        });
        expired
    }

    /// Bytes buffered for an endpoint across all operation kinds
    pub fn pending_bytes(&self, endpoint: &EndpointId) -> usize {
        self.buffers
            .iter()
            .filter(|((id, _), _)| id == endpoint)
            .map(|(_, b)| b.data.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Drop the partial message buffered for one endpoint and kind
    pub fn discard(&mut self, endpoint: EndpointId, kind: OperationKind) -> usize {
        self.buffers
            .remove(&(endpoint, kind))
            .map(|b| b.data.len())
            .unwrap_or(0)
    }

    /// Discard all partial messages
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
