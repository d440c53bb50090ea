//! Peripheral (GATT server) lifecycle controller
//!
//! Drives advertising and service publication, retries failed service
//! registration a bounded number of times, and owns the single
//! `ConnectionSession` of the current link. Platform code reports every radio
//! callback to the matching `on_*` method; the controller answers through the
//! `PeripheralBridge`.

use crate::message::{JsonCodec, PayloadCodec};
use crate::transport::abstraction::{EndpointId, LinkError, LinkEvent, OperationSink, RadioState};
use crate::transport::ble::config::LinkConfig;
use crate::transport::ble::framing::OperationKind;
use crate::transport::ble::gatt::{Capability, Endpoint, EndpointRegistry, Role};
use crate::transport::ble::queue::CompletionHandle;
use crate::transport::ble::reassembly::ReassemblyOutcome;
use crate::transport::ble::session::{ConnectionSession, SessionId, StaleSweep};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// PLATFORM BRIDGE TRAIT
// ============================================================================

/// Platform GATT server primitives.
///
/// Calls only start the operation; outcomes come back through the
/// controller's `on_*` callbacks. Synchronous errors are treated as if the
/// callback had reported them.
pub trait PeripheralBridge: OperationSink {
    /// Begin advertising `service` under `name`
    fn start_advertising(&self, name: &str, service: Uuid) -> Result<(), LinkError>;

    fn stop_advertising(&self);

    /// Publish the service and its characteristics
    fn set_services(&self, service: Uuid, endpoints: &EndpointRegistry) -> Result<(), LinkError>;

    /// Drop the current link; the stack reports it through `on_disconnect`
    fn disconnect(&self);
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    /// Not advertising
    Idle,
    /// Advertising with the service published
    Advertising,
    /// Registration failed; advertising is being restarted
    RetryingRegistration,
    /// A central is connected
    Connected,
    /// Registration retry budget exhausted
    Failed,
}

struct Inner<C: PayloadCodec> {
    state: PeripheralState,
    radio: RadioState,
    retries_left: u32,
    session: Option<ConnectionSession<C>>,
    next_session: SessionId,
    values: HashMap<EndpointId, C::Message>,
}

pub struct Peripheral<B: PeripheralBridge, C: PayloadCodec = JsonCodec> {
    config: LinkConfig,
    bridge: Arc<B>,
    endpoints: Arc<EndpointRegistry>,
    codec: Arc<C>,
    ack: Option<C::Message>,
    events: mpsc::UnboundedSender<LinkEvent<C::Message>>,
    inner: Mutex<Inner<C>>,
}

impl<B: PeripheralBridge, C: PayloadCodec> Peripheral<B, C> {
    /// Create a controller and the receiving end of its event channel
    pub fn new(
        config: LinkConfig,
        bridge: Arc<B>,
        endpoints: Vec<Endpoint>,
        codec: C,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent<C::Message>>), LinkError> {
        config.validate()?;
        let endpoints = Arc::new(EndpointRegistry::new(endpoints)?);
        let (events, rx) = mpsc::unbounded_channel();

        let peripheral = Self {
            inner: Mutex::new(Inner {
                state: PeripheralState::Idle,
                radio: RadioState::Unknown,
                retries_left: config.registration_retries,
                session: None,
                next_session: 1,
                values: HashMap::new(),
            }),
            config,
            bridge,
            endpoints,
            codec: Arc::new(codec),
            ack: None,
            events,
        };
        Ok((peripheral, rx))
    }

    /// Answer every message written to a command endpoint with `ack`
    pub fn with_ack(mut self, ack: C::Message) -> Self {
        self.ack = Some(ack);
        self
    }

    pub fn bridge(&self) -> &Arc<B> {
        &self.bridge
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn state(&self) -> PeripheralState {
        self.inner.lock().state
    }

    pub fn radio_state(&self) -> RadioState {
        self.inner.lock().radio
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.lock().session.as_ref().map(|s| s.id())
    }

    /// Dispatched chunks not yet confirmed by the central
    pub fn outstanding(&self) -> usize {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.outstanding())
            .unwrap_or(0)
    }

    /// Bytes of partial messages buffered for `endpoint`
    pub fn pending_bytes(&self, endpoint: &EndpointId) -> usize {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.pending_bytes(endpoint))
            .unwrap_or(0)
    }

    fn emit(&self, event: LinkEvent<C::Message>) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: LinkError) {
        warn!("{}", error);
        self.emit(LinkEvent::Error(error));
    }

    // ------------------------------------------------------------------------
    // Advertising and registration
    // ------------------------------------------------------------------------

    /// Start advertising and publish the service
    pub fn start(&self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock();
        if !inner.radio.is_ready() {
            return Err(LinkError::NotReady(inner.radio));
        }
        match inner.state {
            PeripheralState::Advertising
            | PeripheralState::RetryingRegistration
            | PeripheralState::Connected => return Ok(()),
            PeripheralState::Idle | PeripheralState::Failed => {}
        }
        inner.retries_left = self.config.registration_retries;
        self.advertise(&mut inner)
    }

    /// Stop advertising; an open link stays up
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if matches!(
            inner.state,
            PeripheralState::Advertising | PeripheralState::RetryingRegistration
        ) {
            self.bridge.stop_advertising();
            inner.state = PeripheralState::Idle;
            info!("Advertising stopped");
            self.emit(LinkEvent::AdvertisingStopped);
        }
    }

    fn advertise(&self, inner: &mut Inner<C>) -> Result<(), LinkError> {
        loop {
            if let Err(e) = self
                .bridge
                .start_advertising(&self.config.device_name, self.config.service_uuid)
            {
                inner.state = PeripheralState::Idle;
                self.emit_error(e.clone());
                return Err(e);
            }
            inner.state = PeripheralState::Advertising;

            match self.bridge.set_services(self.config.service_uuid, &self.endpoints) {
                Ok(()) => {
                    info!("Advertising as {}", self.config.device_name);
                    self.emit(LinkEvent::AdvertisingStarted);
                    return Ok(());
                }
                Err(e) => {
                    if !self.registration_failed(inner, e.to_string()) {
                        return Err(LinkError::Registration(e.to_string()));
                    }
                }
            }
        }
    }

    /// Returns whether advertising should be restarted
    fn registration_failed(&self, inner: &mut Inner<C>, reason: String) -> bool {
        self.bridge.stop_advertising();

        if inner.retries_left > 0 {
            inner.retries_left -= 1;
            inner.state = PeripheralState::RetryingRegistration;
            warn!(
                "Service registration failed ({}), retrying ({} left)",
                reason, inner.retries_left
            );
            true
        } else {
            inner.state = PeripheralState::Failed;
            error!("Service registration failed ({}), giving up", reason);
            self.emit(LinkEvent::Error(LinkError::Registration(reason)));
            false
        }
    }

    /// The stack rejected the published service
    pub fn on_services_set_error(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.state != PeripheralState::Advertising {
            debug!("Ignoring registration error in state {:?}", inner.state);
            return;
        }
        if self.registration_failed(&mut inner, reason.into()) {
            let _ = self.advertise(&mut inner);
        }
    }

    pub fn on_radio_state(&self, radio: RadioState) {
        let mut inner = self.inner.lock();
        inner.radio = radio;
        info!("Radio state: {}", radio);
        self.emit(LinkEvent::RadioStateChanged(radio));

        if !radio.is_ready()
            && matches!(
                inner.state,
                PeripheralState::Advertising | PeripheralState::RetryingRegistration
            )
        {
            self.bridge.stop_advertising();
            inner.state = PeripheralState::Idle;
            self.emit(LinkEvent::AdvertisingStopped);
        }
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    pub fn on_accept(&self, address: &str) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.session.take() {
            warn!(
                "Accept from {} while {} still connected",
                address,
                previous.remote()
            );
            previous.teardown();
        }

        let id = inner.next_session;
        inner.next_session += 1;
        inner.session = Some(ConnectionSession::new(
            id,
            address,
            Role::Peripheral,
            self.endpoints.clone(),
            self.codec.clone(),
            self.config.queue_capacity,
        ));
        inner.state = PeripheralState::Connected;
        inner.retries_left = self.config.registration_retries;

        info!("Accepted connection from {}", address);
        self.emit(LinkEvent::Connected {
            address: address.to_string(),
        });
    }

    pub fn on_disconnect(&self, address: &str) {
        let mut inner = self.inner.lock();
        let matches = inner
            .session
            .as_ref()
            .map(|s| s.remote() == address)
            .unwrap_or(false);
        if !matches {
            debug!("Disconnect from {} without a matching session", address);
            return;
        }
        if let Some(session) = inner.session.take() {
            session.teardown();
        }

        info!("Disconnected from {}", address);
        self.emit(LinkEvent::Disconnected {
            address: address.to_string(),
        });

        // Session state is gone before advertising resumes
        if inner.radio.is_ready() {
            inner.retries_left = self.config.registration_retries;
            let _ = self.advertise(&mut inner);
        } else {
            inner.state = PeripheralState::Idle;
        }
    }

    /// Ask the stack to drop the current link
    pub fn disconnect(&self) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.bridge.disconnect();
        Ok(())
    }

    pub fn on_subscribe(&self, endpoint: EndpointId) {
        let mut inner = self.inner.lock();
        let result = match inner.session.as_mut() {
            Some(session) => session.subscribe(endpoint),
            None => Err(LinkError::NotConnected),
        };
        drop(inner);
        match result {
            Ok(()) => debug!("Central subscribed to {}", endpoint),
            Err(e) => self.emit_error(e),
        }
    }

    pub fn on_unsubscribe(&self, endpoint: EndpointId) {
        if let Some(session) = self.inner.lock().session.as_mut() {
            session.unsubscribe(&endpoint);
        }
    }

    // ------------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------------

    /// Indicate `message` on `endpoint`
    pub fn send(
        &self,
        endpoint: EndpointId,
        message: &C::Message,
    ) -> Result<CompletionHandle, LinkError> {
        let mut inner = self.inner.lock();
        let session = inner.session.as_mut().ok_or(LinkError::NotConnected)?;
        let result = session.send(endpoint, message, OperationKind::Indicate, &*self.bridge);
        drop(inner);

        if let Err(e @ (LinkError::QueueFull { .. } | LinkError::Oversize { .. })) = &result {
            self.emit_error(e.clone());
        }
        result
    }

    /// Current value served to reads of `endpoint`
    pub fn set_value(&self, endpoint: EndpointId, value: C::Message) -> Result<(), LinkError> {
        let registered = self
            .endpoints
            .get(&endpoint)
            .ok_or(LinkError::UnknownEndpoint(endpoint))?;
        if !registered.has(Capability::Read) {
            return Err(LinkError::ProtocolViolation(format!(
                "{} is not readable",
                registered.name
            )));
        }
        self.inner.lock().values.insert(endpoint, value);
        Ok(())
    }

    pub fn value(&self, endpoint: &EndpointId) -> Option<C::Message> {
        self.inner.lock().values.get(endpoint).cloned()
    }

    /// Serve one read request with the next read-response chunk
    pub fn on_read_request(&self, endpoint: EndpointId) -> Result<Vec<u8>, LinkError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let session = inner.session.as_mut().ok_or(LinkError::NotConnected)?;
        let value = inner
            .values
            .get(&endpoint)
            .ok_or_else(|| LinkError::Operation(format!("no value set for {}", endpoint)))?;
        session.next_read_chunk(endpoint, value)
    }

    /// A chunk was written by the central
    pub fn on_write_request(&self, endpoint: EndpointId, data: &[u8]) -> Result<(), LinkError> {
        let mut inner = self.inner.lock();
        let session = inner.session.as_mut().ok_or(LinkError::NotConnected)?;

        match session.on_data(endpoint, data, Instant::now()) {
            ReassemblyOutcome::Incomplete => Ok(()),
            ReassemblyOutcome::Complete(message) => {
                self.emit(LinkEvent::Message { endpoint, message });

                if let Some(ack) = &self.ack {
                    if session.is_subscribed(&endpoint) {
                        if let Err(e) =
                            session.send(endpoint, ack, OperationKind::Indicate, &*self.bridge)
                        {
                            drop(inner);
                            self.emit_error(e);
                        }
                    }
                }
                Ok(())
            }
            ReassemblyOutcome::Error(e) => {
                drop(inner);
                self.emit_error(e);
                Ok(())
            }
        }
    }

    /// The central confirmed the outstanding indication on `endpoint`
    pub fn on_operation_complete(&self, endpoint: EndpointId) {
        let result = match self.inner.lock().session.as_mut() {
            Some(session) => session.on_operation_complete(endpoint, &*self.bridge),
            None => {
                debug!("Completion on {} after teardown", endpoint);
                Ok(())
            }
        };
        if let Err(e) = result {
            self.emit_error(e);
        }
    }

    /// The outstanding indication on `endpoint` failed
    pub fn on_operation_failed(&self, endpoint: EndpointId, error: LinkError) {
        let result = match self.inner.lock().session.as_mut() {
            Some(session) => session.on_operation_failed(endpoint, error.clone(), &*self.bridge),
            None => Ok(()),
        };
        match result {
            Ok(()) => self.emit(LinkEvent::Error(error)),
            Err(e) => self.emit_error(e),
        }
    }
}

impl<B: PeripheralBridge, C: PayloadCodec> StaleSweep for Peripheral<B, C> {
    /// Reclaim partial messages idle past the reassembly timeout
    fn expire_stale(&self, now: Instant) -> Vec<LinkError> {
        let expired = match self.inner.lock().session.as_mut() {
            Some(session) => session.expire_stale(now, self.config.reassembly_timeout()),
            None => Vec::new(),
        };
        for e in &expired {
            self.emit_error(e.clone());
        }
        expired
    }
}
