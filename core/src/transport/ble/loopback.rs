//! In-memory bridges for running both roles without radio hardware
//!
//! `LoopbackPeripheral` and `LoopbackCentral` record every operation the core
//! starts and can be scripted to fail. `pump` carries recorded link changes
//! and chunks from one side to the other and acknowledges them.

use crate::message::PayloadCodec;
use crate::transport::abstraction::{EndpointId, LinkError, OperationSink};
use crate::transport::ble::central::{Central, CentralBridge};
use crate::transport::ble::framing::OperationKind;
use crate::transport::ble::gatt::{default_endpoints, EndpointRegistry, DEFAULT_MTU};
use crate::transport::ble::peripheral::{Peripheral, PeripheralBridge};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Address a `LoopbackCentral` reports for itself
pub const LOOPBACK_CENTRAL_ADDRESS: &str = "c0:ff:ee:00:00:01";

/// One operation handed to a loopback bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentOperation {
    pub endpoint: EndpointId,
    pub kind: OperationKind,
    pub data: Vec<u8>,
}

fn record(
    sent: &Mutex<Vec<SentOperation>>,
    failures: &Mutex<VecDeque<LinkError>>,
    endpoint: EndpointId,
    kind: OperationKind,
    data: &[u8],
) -> Result<(), LinkError> {
    if let Some(error) = failures.lock().pop_front() {
        return Err(error);
    }
    sent.lock().push(SentOperation {
        endpoint,
        kind,
        data: data.to_vec(),
    });
    Ok(())
}

// ============================================================================
// PERIPHERAL SIDE
// ============================================================================

#[derive(Default)]
pub struct LoopbackPeripheral {
    sent: Mutex<Vec<SentOperation>>,
    operation_failures: Mutex<VecDeque<LinkError>>,
    services_failures: Mutex<usize>,
    advertising: Mutex<bool>,
    advertising_starts: Mutex<usize>,
    advertising_stops: Mutex<usize>,
    services_set: Mutex<usize>,
    disconnect_requested: Mutex<bool>,
}

impl LoopbackPeripheral {
    /// Fail the next `count` calls to `set_services` synchronously
    pub fn fail_set_services(&self, count: usize) {
        *self.services_failures.lock() = count;
    }

    /// Fail the next `start_operation` call with `error`
    pub fn fail_next_operation(&self, error: LinkError) {
        self.operation_failures.lock().push_back(error);
    }

    pub fn take_sent(&self) -> Vec<SentOperation> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn is_advertising(&self) -> bool {
        *self.advertising.lock()
    }

    pub fn advertising_starts(&self) -> usize {
        *self.advertising_starts.lock()
    }

    pub fn advertising_stops(&self) -> usize {
        *self.advertising_stops.lock()
    }

    pub fn services_set(&self) -> usize {
        *self.services_set.lock()
    }

    /// Whether `disconnect` was called since the last check
    pub fn take_disconnect_request(&self) -> bool {
        std::mem::take(&mut *self.disconnect_requested.lock())
    }
}

impl OperationSink for LoopbackPeripheral {
    fn start_operation(
        &self,
        endpoint: EndpointId,
        kind: OperationKind,
        data: &[u8],
    ) -> Result<(), LinkError> {
        record(&self.sent, &self.operation_failures, endpoint, kind, data)
    }
}

impl PeripheralBridge for LoopbackPeripheral {
    fn start_advertising(&self, name: &str, service: Uuid) -> Result<(), LinkError> {
        debug!("Loopback advertising {} ({})", name, service);
        *self.advertising.lock() = true;
        *self.advertising_starts.lock() += 1;
        Ok(())
    }

    fn stop_advertising(&self) {
        *self.advertising.lock() = false;
        *self.advertising_stops.lock() += 1;
    }

    fn set_services(&self, _service: Uuid, _endpoints: &EndpointRegistry) -> Result<(), LinkError> {
        let mut failures = self.services_failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(LinkError::Registration("loopback rejected service".to_string()));
        }
        *self.services_set.lock() += 1;
        Ok(())
    }

    fn disconnect(&self) {
        *self.disconnect_requested.lock() = true;
    }
}

// ============================================================================
// CENTRAL SIDE
// ============================================================================

/// Link-level changes a central caused, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkChange {
    Connected(String),
    Subscribed(EndpointId),
    Disconnected(String),
}

type ReadHandler = Box<dyn Fn(EndpointId) -> Result<Vec<u8>, LinkError> + Send + Sync>;

pub struct LoopbackCentral {
    address: String,
    peers: Mutex<Vec<String>>,
    endpoints: Mutex<Vec<EndpointId>>,
    connect_failure: Mutex<Option<String>>,
    connect_gate: Mutex<Option<Arc<Notify>>>,
    subscribe_failures: Mutex<HashSet<EndpointId>>,
    operation_failures: Mutex<VecDeque<LinkError>>,
    read_handler: Mutex<Option<ReadHandler>>,
    connected: Mutex<Option<String>>,
    subscriptions: Mutex<Vec<EndpointId>>,
    changes: Mutex<Vec<LinkChange>>,
    sent: Mutex<Vec<SentOperation>>,
    disconnects: Mutex<usize>,
}

impl Default for LoopbackCentral {
    fn default() -> Self {
        Self::new(LOOPBACK_CENTRAL_ADDRESS)
    }
}

impl LoopbackCentral {
    /// A central at `address` that discovers the default service
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            peers: Mutex::new(Vec::new()),
            endpoints: Mutex::new(default_endpoints(DEFAULT_MTU).iter().map(|e| e.id).collect()),
            connect_failure: Mutex::new(None),
            connect_gate: Mutex::new(None),
            subscribe_failures: Mutex::new(HashSet::new()),
            operation_failures: Mutex::new(VecDeque::new()),
            read_handler: Mutex::new(None),
            connected: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            changes: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            disconnects: Mutex::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Make `address` show up in scans
    pub fn add_peer(&self, address: impl Into<String>) {
        self.peers.lock().push(address.into());
    }

    /// Endpoints reported by discovery
    pub fn set_endpoints(&self, endpoints: Vec<EndpointId>) {
        *self.endpoints.lock() = endpoints;
    }

    pub fn fail_connect(&self, reason: impl Into<String>) {
        *self.connect_failure.lock() = Some(reason.into());
    }

    /// Park the next `connect` until the returned gate is notified
    pub fn hold_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.connect_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn fail_subscribe(&self, endpoint: EndpointId) {
        self.subscribe_failures.lock().insert(endpoint);
    }

    pub fn fail_next_operation(&self, error: LinkError) {
        self.operation_failures.lock().push_back(error);
    }

    /// Answer reads with `handler`, typically a peripheral's `on_read_request`
    pub fn set_read_handler<F>(&self, handler: F)
    where
        F: Fn(EndpointId) -> Result<Vec<u8>, LinkError> + Send + Sync + 'static,
    {
        *self.read_handler.lock() = Some(Box::new(handler));
    }

    /// Peripheral currently linked
    pub fn connected(&self) -> Option<String> {
        self.connected.lock().clone()
    }

    /// Successful subscriptions, in order
    pub fn subscriptions(&self) -> Vec<EndpointId> {
        self.subscriptions.lock().clone()
    }

    pub fn disconnects(&self) -> usize {
        *self.disconnects.lock()
    }

    pub fn take_changes(&self) -> Vec<LinkChange> {
        std::mem::take(&mut *self.changes.lock())
    }

    pub fn take_sent(&self) -> Vec<SentOperation> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Drop the link from the peripheral's side
    pub fn drop_link(&self) -> Option<String> {
        self.connected.lock().take()
    }
}

impl OperationSink for LoopbackCentral {
    fn start_operation(
        &self,
        endpoint: EndpointId,
        kind: OperationKind,
        data: &[u8],
    ) -> Result<(), LinkError> {
        record(&self.sent, &self.operation_failures, endpoint, kind, data)
    }
}

#[async_trait]
impl CentralBridge for LoopbackCentral {
    async fn scan(&self, _timeout: Duration) -> Result<Vec<String>, LinkError> {
        Ok(self.peers.lock().clone())
    }

    async fn connect(&self, address: &str) -> Result<(), LinkError> {
        let gate = self.connect_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(reason) = self.connect_failure.lock().clone() {
            return Err(LinkError::Connect(reason));
        }
        *self.connected.lock() = Some(address.to_string());
        self.changes
            .lock()
            .push(LinkChange::Connected(address.to_string()));
        Ok(())
    }

    async fn discover(&self, _address: &str) -> Result<Vec<EndpointId>, LinkError> {
        if self.connected.lock().is_none() {
            return Err(LinkError::ConnectionLost);
        }
        Ok(self.endpoints.lock().clone())
    }

    async fn subscribe(&self, endpoint: EndpointId) -> Result<(), LinkError> {
        if self.subscribe_failures.lock().contains(&endpoint) {
            return Err(LinkError::Operation(format!(
                "subscribe to {} rejected",
                endpoint
            )));
        }
        self.subscriptions.lock().push(endpoint);
        self.changes.lock().push(LinkChange::Subscribed(endpoint));
        Ok(())
    }

    async fn read(&self, endpoint: EndpointId) -> Result<Vec<u8>, LinkError> {
        match self.read_handler.lock().as_ref() {
            Some(handler) => handler(endpoint),
            None => Err(LinkError::Operation(format!(
                "no read handler for {}",
                endpoint
            ))),
        }
    }

    async fn disconnect(&self, address: &str) {
        *self.disconnects.lock() += 1;
        if self.connected.lock().take().is_some() {
            self.changes
                .lock()
                .push(LinkChange::Disconnected(address.to_string()));
        }
    }
}

// ============================================================================
// PUMP
// ============================================================================

/// Deliver everything either side has started until both are idle.
///
/// Returns the number of chunks moved.
pub fn pump<C: PayloadCodec>(
    peripheral: &Peripheral<LoopbackPeripheral, C>,
    central: &Central<LoopbackCentral, C>,
) -> usize {
    let central_address = central.bridge().address().to_string();
    let mut moved = 0;

    loop {
        let mut progressed = false;

        for change in central.bridge().take_changes() {
            progressed = true;
            match change {
                LinkChange::Connected(_) => peripheral.on_accept(&central_address),
                LinkChange::Subscribed(endpoint) => peripheral.on_subscribe(endpoint),
                LinkChange::Disconnected(_) => peripheral.on_disconnect(&central_address),
            }
        }

        if peripheral.bridge().take_disconnect_request() {
            progressed = true;
            if let Some(address) = central.bridge().drop_link() {
                peripheral.on_disconnect(&central_address);
                central.on_disconnect(&address);
            }
        }

        for op in central.bridge().take_sent() {
            progressed = true;
            moved += 1;
            if let Err(e) = peripheral.on_write_request(op.endpoint, &op.data) {
                warn!("Loopback write dropped: {}", e);
            }
            central.on_operation_complete(op.endpoint);
        }

        for op in peripheral.bridge().take_sent() {
            progressed = true;
            moved += 1;
            if let Err(e) = central.on_notification(op.endpoint, &op.data) {
                warn!("Loopback indication dropped: {}", e);
            }
            peripheral.on_operation_complete(op.endpoint);
        }

        if !progressed {
            return moved;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_failures_are_consumed_in_order() {
        let bridge = LoopbackPeripheral::default();
        bridge.fail_next_operation(LinkError::Operation("busy".to_string()));

        let id = Uuid::nil();
        assert!(bridge
            .start_operation(id, OperationKind::Indicate, b"\x06{}")
            .is_err());
        assert!(bridge
            .start_operation(id, OperationKind::Indicate, b"\x06{}")
            .is_ok());
        assert_eq!(bridge.take_sent().len(), 1);
        assert!(bridge.take_sent().is_empty());
    }

    #[test]
    fn test_set_services_failure_budget() {
        let bridge = LoopbackPeripheral::default();
        let registry = EndpointRegistry::new(default_endpoints(DEFAULT_MTU)).unwrap();
        bridge.fail_set_services(1);

        assert!(bridge.set_services(Uuid::nil(), &registry).is_err());
        assert!(bridge.set_services(Uuid::nil(), &registry).is_ok());
        assert_eq!(bridge.services_set(), 1);
    }

    #[tokio::test]
    async fn test_central_records_link_changes() {
        let bridge = LoopbackCentral::default();
        bridge.connect("aa").await.unwrap();
        bridge.subscribe(Uuid::nil()).await.unwrap();
        bridge.disconnect("aa").await;

        assert_eq!(
            bridge.take_changes(),
            vec![
                LinkChange::Connected("aa".to_string()),
                LinkChange::Subscribed(Uuid::nil()),
                LinkChange::Disconnected("aa".to_string()),
            ]
        );
        assert_eq!(bridge.disconnects(), 1);
    }
}
