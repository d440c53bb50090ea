//! Transport abstraction layer for blelink
//!
//! Defines the error taxonomy, the events delivered to the application, the
//! radio state reported by the platform, and the low-level send primitive
//! every platform bridge provides.

use crate::transport::ble::framing::OperationKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Stable identifier of an endpoint (a GATT characteristic UUID)
pub type EndpointId = Uuid;

/// Errors surfaced by the link layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Radio not ready (state: {0})")]
    NotReady(RadioState),
    #[error("Message too large: {chunks} chunks exceeds capacity {capacity}")]
    Oversize { chunks: usize, capacity: usize },
    #[error("Queue full: {requested} chunks requested, {available} available")]
    QueueFull { requested: usize, available: usize },
    #[error("Decode failed on {endpoint}: {reason}")]
    Decode { endpoint: EndpointId, reason: String },
    #[error("Encode failed: {0}")]
    Encode(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Reassembly timed out on {endpoint}")]
    ReassemblyTimeout { endpoint: EndpointId },
    #[error("Service registration failed: {0}")]
    Registration(String),
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Missing endpoints after discovery: {0:?}")]
    MissingEndpoints(Vec<EndpointId>),
    #[error("Peer not found: {0}")]
    NotFound(String),
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Not connected")]
    NotConnected,
    #[error("Endpoint {0} has no subscriber")]
    NotSubscribed(EndpointId),
    #[error("Unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("Operation failed: {0}")]
    Operation(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Power/availability state reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    /// Whether advertising, scanning and connections are possible
    pub fn is_ready(&self) -> bool {
        *self == RadioState::PoweredOn
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Unknown => write!(f, "unknown"),
            RadioState::Resetting => write!(f, "resetting"),
            RadioState::Unsupported => write!(f, "unsupported"),
            RadioState::Unauthorized => write!(f, "unauthorized"),
            RadioState::PoweredOff => write!(f, "poweredOff"),
            RadioState::PoweredOn => write!(f, "poweredOn"),
        }
    }
}

/// Events from the link layer to the application
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent<M> {
    /// The radio changed power state
    RadioStateChanged(RadioState),
    /// Advertising started and the service was handed to the stack
    AdvertisingStarted,
    /// Advertising stopped
    AdvertisingStopped,
    /// A link to a remote device is up
    Connected { address: String },
    /// The link to a remote device went away
    Disconnected { address: String },
    /// A complete message was reassembled on an endpoint
    Message { endpoint: EndpointId, message: M },
    /// Something failed; the channel stays usable unless the error says otherwise
    Error(LinkError),
}

/// Low-level send primitive provided by the platform.
///
/// `start_operation` only starts a write/indication; the platform reports the
/// outcome later through the owning controller's `on_operation_complete` or
/// `on_operation_failed`. Implementations must not call back into the
/// controller from inside `start_operation`.
pub trait OperationSink: Send + Sync {
    fn start_operation(
        &self,
        endpoint: EndpointId,
        kind: OperationKind,
        data: &[u8],
    ) -> Result<(), LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_state_ready() {
        assert!(RadioState::PoweredOn.is_ready());
        assert!(!RadioState::PoweredOff.is_ready());
        assert!(!RadioState::Unknown.is_ready());
    }

    #[test]
    fn test_radio_state_display() {
        assert_eq!(RadioState::PoweredOn.to_string(), "poweredOn");
        assert_eq!(RadioState::Unauthorized.to_string(), "unauthorized");
    }

    #[test]
    fn test_error_messages() {
        let err = LinkError::QueueFull {
            requested: 4,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "Queue full: 4 chunks requested, 1 available"
        );
        assert_eq!(
            LinkError::NotReady(RadioState::PoweredOff).to_string(),
            "Radio not ready (state: poweredOff)"
        );
    }
}
