//! Central (GATT client) session orchestrator
//!
//! Runs scan → connect → discover → subscribe as one ordered pipeline. Each
//! stage awaits the platform bridge; the first failure aborts the rest,
//! releases the link and tears the session down.

use crate::message::{JsonCodec, PayloadCodec, MAX_MESSAGE_SIZE};
use crate::transport::abstraction::{EndpointId, LinkError, LinkEvent, OperationSink, RadioState};
use crate::transport::ble::config::LinkConfig;
use crate::transport::ble::framing::OperationKind;
use crate::transport::ble::gatt::{Capability, Endpoint, EndpointRegistry, Role};
use crate::transport::ble::queue::CompletionHandle;
use crate::transport::ble::reassembly::ReassemblyOutcome;
use crate::transport::ble::session::{ConnectionSession, SessionId, StaleSweep};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Platform GATT client primitives
#[async_trait]
pub trait CentralBridge: OperationSink {
    /// Addresses advertising the service, collected for at most `timeout`
    async fn scan(&self, timeout: Duration) -> Result<Vec<String>, LinkError>;

    async fn connect(&self, address: &str) -> Result<(), LinkError>;

    /// Endpoint identifiers found on the connected device
    async fn discover(&self, address: &str) -> Result<Vec<EndpointId>, LinkError>;

    /// Enable indications on `endpoint`
    async fn subscribe(&self, endpoint: EndpointId) -> Result<(), LinkError>;

    /// One read of `endpoint`; returns a single read-response chunk
    async fn read(&self, endpoint: EndpointId) -> Result<Vec<u8>, LinkError>;

    async fn disconnect(&self, address: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentralState {
    Idle,
    Scanning,
    Connecting,
    Connected,
}

struct Inner<C: PayloadCodec> {
    state: CentralState,
    radio: RadioState,
    observed: Vec<String>,
    session: Option<ConnectionSession<C>>,
    next_session: SessionId,
}

pub struct Central<B: CentralBridge, C: PayloadCodec = JsonCodec> {
    config: LinkConfig,
    bridge: Arc<B>,
    endpoints: Arc<EndpointRegistry>,
    codec: Arc<C>,
    events: mpsc::UnboundedSender<LinkEvent<C::Message>>,
    inner: Mutex<Inner<C>>,
}

impl<B: CentralBridge, C: PayloadCodec> Central<B, C> {
    /// Create an orchestrator expecting `endpoints` on the remote device
    pub fn new(
        config: LinkConfig,
        bridge: Arc<B>,
        endpoints: Vec<Endpoint>,
        codec: C,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent<C::Message>>), LinkError> {
        config.validate()?;
        let endpoints = Arc::new(EndpointRegistry::new(endpoints)?);
        let (events, rx) = mpsc::unbounded_channel();

        let central = Self {
            config,
            bridge,
            endpoints,
            codec: Arc::new(codec),
            events,
            inner: Mutex::new(Inner {
                state: CentralState::Idle,
                radio: RadioState::Unknown,
                observed: Vec::new(),
                session: None,
                next_session: 1,
            }),
        };
        Ok((central, rx))
    }

    pub fn bridge(&self) -> &Arc<B> {
        &self.bridge
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn state(&self) -> CentralState {
        self.inner.lock().state
    }

    pub fn radio_state(&self) -> RadioState {
        self.inner.lock().radio
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state == CentralState::Connected
    }

    /// Address of the connected peripheral
    pub fn remote(&self) -> Option<String> {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.remote().to_string())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.lock().session.as_ref().map(|s| s.id())
    }

    pub fn is_subscribed(&self, endpoint: &EndpointId) -> bool {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.is_subscribed(endpoint))
            .unwrap_or(false)
    }

    pub fn outstanding(&self) -> usize {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.outstanding())
            .unwrap_or(0)
    }

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

    pub fn on_radio_state(&self, radio: RadioState) {
        self.inner.lock().radio = radio;
        info!("Radio state: {}", radio);
        self.emit(LinkEvent::RadioStateChanged(radio));
    }

    // ------------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------------

    /// Scan for peripherals; the result replaces the previous scan window
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<String>, LinkError> {
        {
            let mut inner = self.inner.lock();
            if !inner.radio.is_ready() {
                return Err(LinkError::NotReady(inner.radio));
            }
            if inner.state == CentralState::Idle {
                inner.state = CentralState::Scanning;
            }
        }

        debug!("Scanning for {:?}", timeout);
        let result = self.bridge.scan(timeout).await;

        let mut inner = self.inner.lock();
        if inner.state == CentralState::Scanning {
            inner.state = CentralState::Idle;
        }
        let found = result?;
        if !inner.radio.is_ready() {
            return Err(LinkError::NotReady(inner.radio));
        }

        info!("Scan found {} peripherals", found.len());
        inner.observed = found.clone();
        Ok(found)
    }

    /// Connect, discover and subscribe; any failure releases the link
    pub async fn connect(&self, address: &str) -> Result<(), LinkError> {
        {
            let mut inner = self.inner.lock();
            if !inner.radio.is_ready() {
                return Err(LinkError::NotReady(inner.radio));
            }
            if let Some(session) = &inner.session {
                return Err(LinkError::Connect(format!(
                    "already connected to {}",
                    session.remote()
                )));
            }
            if inner.state == CentralState::Connecting {
                return Err(LinkError::Connect("connect already in progress".to_string()));
            }
            if !inner.observed.iter().any(|a| a == address) {
                return Err(LinkError::NotFound(address.to_string()));
            }
            inner.state = CentralState::Connecting;
        }

        info!("Connecting to {}", address);
        if let Err(e) = self.bridge.connect(address).await {
            self.inner.lock().state = CentralState::Idle;
            let error = match e {
                LinkError::Connect(_) => e,
                other => LinkError::Connect(other.to_string()),
            };
            self.emit_error(error.clone());
            return Err(error);
        }

        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_session;
            inner.next_session += 1;
            inner.session = Some(ConnectionSession::new(
                id,
                address,
                Role::Central,
                self.endpoints.clone(),
                self.codec.clone(),
                self.config.queue_capacity,
            ));
            id
        };

        match self.establish(id, address).await {
            Ok(()) => {
                self.inner.lock().state = CentralState::Connected;
                info!("Connected to {}", address);
                self.emit(LinkEvent::Connected {
                    address: address.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                self.release(id);
                self.bridge.disconnect(address).await;
                self.emit_error(e.clone());
                Err(e)
            }
        }
    }

    async fn establish(&self, id: SessionId, address: &str) -> Result<(), LinkError> {
        let discovered = self.bridge.discover(address).await?;
        let missing: Vec<EndpointId> = self
            .endpoints
            .ids()
            .into_iter()
            .filter(|id| !discovered.contains(id))
            .collect();
        if !missing.is_empty() {
            return Err(LinkError::MissingEndpoints(missing));
        }

        let consumable: Vec<EndpointId> = self.endpoints.consumable().map(|e| e.id).collect();
        for endpoint in consumable {
            self.bridge.subscribe(endpoint).await?;

            let mut inner = self.inner.lock();
            match inner.session.as_mut() {
                Some(session) if session.id() == id => session.subscribe(endpoint)?,
                _ => return Err(LinkError::ConnectionLost),
            }
            debug!("Subscribed to {}", endpoint);
        }
        Ok(())
    }

    /// Tear down session `id` if it is still the current one
    fn release(&self, id: SessionId) {
        let mut inner = self.inner.lock();
        if inner.session.as_ref().map(|s| s.id()) == Some(id) {
            if let Some(session) = inner.session.take() {
                session.teardown();
            }
        }
        inner.state = CentralState::Idle;
    }

    /// Close the link; pending sends are rejected with `ConnectionLost`
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let session = {
            let mut inner = self.inner.lock();
            inner.state = CentralState::Idle;
            inner.session.take().ok_or(LinkError::NotConnected)?
        };
        let address = session.remote().to_string();
        session.teardown();

        self.bridge.disconnect(&address).await;
        info!("Disconnected from {}", address);
        self.emit(LinkEvent::Disconnected { address });
        Ok(())
    }

    /// The peripheral dropped the link
    pub fn on_disconnect(&self, address: &str) {
        let mut inner = self.inner.lock();
        let matches = inner
            .session
            .as_ref()
            .map(|s| s.remote() == address)
            .unwrap_or(false);
        if !matches {
            debug!("Disconnect from unknown peripheral {}", address);
            return;
        }
        if let Some(session) = inner.session.take() {
            session.teardown();
        }
        inner.state = CentralState::Idle;
        drop(inner);

        info!("Peripheral {} disconnected", address);
        self.emit(LinkEvent::Disconnected {
            address: address.to_string(),
        });
    }

    // ------------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------------

    /// Write `message` to `endpoint`
    pub fn send(
        &self,
        endpoint: EndpointId,
        message: &C::Message,
    ) -> Result<CompletionHandle, LinkError> {
        let mut inner = self.inner.lock();
        if inner.state != CentralState::Connected {
            return Err(LinkError::NotConnected);
        }
        let session = inner.session.as_mut().ok_or(LinkError::NotConnected)?;
        let result = session.send(endpoint, message, OperationKind::Write, &*self.bridge);
        drop(inner);

        if let Err(e @ (LinkError::QueueFull { .. } | LinkError::Oversize { .. })) = &result {
            self.emit_error(e.clone());
        }
        result
    }

    /// Read the full value of `endpoint`, one chunk per bridge read
    pub async fn read(&self, endpoint: EndpointId) -> Result<C::Message, LinkError> {
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

        let id = self.session_id().ok_or(LinkError::NotConnected)?;
        let max_reads = MAX_MESSAGE_SIZE / registered.max_chunk_size + 2;

        let result = self.read_sequence(id, registered, max_reads).await;
        if result.is_err() {
            // A broken sequence must not prefix the next read
            let mut inner = self.inner.lock();
            if let Some(session) = inner.session.as_mut().filter(|s| s.id() == id) {
                session.discard_partial(endpoint, OperationKind::ReadResponse);
            }
        }
        result
    }

    async fn read_sequence(
        &self,
        id: SessionId,
        registered: &Endpoint,
        max_reads: usize,
    ) -> Result<C::Message, LinkError> {
        let endpoint = registered.id;
        for _ in 0..max_reads {
            let bytes = self.bridge.read(endpoint).await?;

            let mut inner = self.inner.lock();
            let session = match inner.session.as_mut() {
                Some(session) if session.id() == id => session,
                _ => return Err(LinkError::ConnectionLost),
            };
            match session.on_data(endpoint, &bytes, Instant::now()) {
                ReassemblyOutcome::Incomplete => continue,
                ReassemblyOutcome::Complete(message) => return Ok(message),
                ReassemblyOutcome::Error(e) => return Err(e),
            }
        }

        Err(LinkError::ProtocolViolation(format!(
            "read of {} did not terminate",
            registered.name
        )))
    }

    /// An indication arrived from the peripheral
    pub fn on_notification(&self, endpoint: EndpointId, data: &[u8]) -> Result<(), LinkError> {
        let mut inner = self.inner.lock();
        let session = inner.session.as_mut().ok_or(LinkError::NotConnected)?;
        let outcome = session.on_data(endpoint, data, Instant::now());
        drop(inner);

        match outcome {
            ReassemblyOutcome::Incomplete => {}
            ReassemblyOutcome::Complete(message) => {
                self.emit(LinkEvent::Message { endpoint, message })
            }
            ReassemblyOutcome::Error(e) => self.emit_error(e),
        }
        Ok(())
    }

    /// The peripheral acknowledged the outstanding write on `endpoint`
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

    /// The outstanding write on `endpoint` failed
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

impl<B: CentralBridge, C: PayloadCodec> StaleSweep for Central<B, C> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::framing::frame;
    use crate::transport::ble::gatt::{
        default_endpoints, COMMAND_CHAR_UUID, CONN_TYPE_CHAR_UUID, DEFAULT_MTU,
        DEV_INFO_CHAR_UUID, DEV_STATUS_CHAR_UUID,
    };
    use crate::transport::ble::loopback::LoopbackCentral;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    const PEER: &str = "11:22:33:44:55:66";

    type Events = mpsc::UnboundedReceiver<LinkEvent<Value>>;

    fn central(bridge: LoopbackCentral) -> (Central<LoopbackCentral>, Events) {
        let (central, rx) = Central::new(
            LinkConfig::default(),
            Arc::new(bridge),
            default_endpoints(DEFAULT_MTU),
            JsonCodec,
        )
        .unwrap();
        central.on_radio_state(RadioState::PoweredOn);
        (central, rx)
    }

    fn with_peer() -> LoopbackCentral {
        let bridge = LoopbackCentral::default();
        bridge.add_peer(PEER);
        bridge
    }

    async fn connected() -> (Central<LoopbackCentral>, Events) {
        let (c, rx) = central(with_peer());
        c.scan(Duration::from_millis(10)).await.unwrap();
        c.connect(PEER).await.unwrap();
        (c, rx)
    }

    #[tokio::test]
    async fn test_scan_requires_radio() {
        let (c, _rx) = Central::<_, JsonCodec>::new(
            LinkConfig::default(),
            Arc::new(with_peer()),
            default_endpoints(DEFAULT_MTU),
            JsonCodec,
        )
        .unwrap();
        assert_eq!(
            c.scan(Duration::from_millis(10)).await,
            Err(LinkError::NotReady(RadioState::Unknown))
        );
    }

    #[tokio::test]
    async fn test_connect_unknown_address() {
        let (c, _rx) = central(with_peer());
        assert_eq!(
            c.connect(PEER).await,
            Err(LinkError::NotFound(PEER.to_string()))
        );

        c.scan(Duration::from_millis(10)).await.unwrap();
        assert_eq!(
            c.connect("ff:ff:ff:ff:ff:ff").await,
            Err(LinkError::NotFound("ff:ff:ff:ff:ff:ff".to_string()))
        );
    }

    #[tokio::test]
    async fn test_pipeline_subscribes_in_order() {
        let (c, _rx) = connected().await;

        assert_eq!(c.state(), CentralState::Connected);
        assert_eq!(c.remote().as_deref(), Some(PEER));
        assert_eq!(
            c.bridge().subscriptions(),
            vec![
                COMMAND_CHAR_UUID,
                CONN_TYPE_CHAR_UUID,
                DEV_INFO_CHAR_UUID,
                DEV_STATUS_CHAR_UUID
            ]
        );
        assert!(c.is_subscribed(&DEV_STATUS_CHAR_UUID));
    }

    #[tokio::test]
    async fn test_connect_rejected_while_connecting() {
        let bridge = with_peer();
        let gate = bridge.hold_connect();
        let (c, _rx) = central(bridge);
        c.scan(Duration::from_millis(10)).await.unwrap();

        let (first, second) = tokio::join!(c.connect(PEER), async {
            assert_eq!(c.state(), CentralState::Connecting);
            let second = c.connect(PEER).await;
            gate.notify_one();
            second
        });

        assert_eq!(first, Ok(()));
        assert_eq!(
            second,
            Err(LinkError::Connect("connect already in progress".to_string()))
        );
        assert_eq!(c.session_id(), Some(1));
        assert_eq!(c.state(), CentralState::Connected);
    }

    #[tokio::test]
    async fn test_link_failure_maps_to_connect() {
        let bridge = with_peer();
        bridge.fail_connect("page timeout");
        let (c, _rx) = central(bridge);
        c.scan(Duration::from_millis(10)).await.unwrap();

        let result = c.connect(PEER).await;
        assert!(matches!(result, Err(LinkError::Connect(_))));
        assert_eq!(c.state(), CentralState::Idle);
        assert!(c.session_id().is_none());
    }

    #[tokio::test]
    async fn test_missing_endpoints_release_link() {
        let bridge = with_peer();
        bridge.set_endpoints(vec![COMMAND_CHAR_UUID, DEV_INFO_CHAR_UUID]);
        let (c, _rx) = central(bridge);
        c.scan(Duration::from_millis(10)).await.unwrap();

        let result = c.connect(PEER).await;
        assert_eq!(
            result,
            Err(LinkError::MissingEndpoints(vec![
                CONN_TYPE_CHAR_UUID,
                DEV_STATUS_CHAR_UUID
            ]))
        );
        assert_eq!(c.bridge().disconnects(), 1);
        assert!(c.bridge().subscriptions().is_empty());
        assert!(!c.is_connected());
    }

    #[tokio::test]
    async fn test_subscription_failure_short_circuits() {
        let bridge = with_peer();
        bridge.fail_subscribe(CONN_TYPE_CHAR_UUID);
        let (c, mut rx) = central(bridge);
        c.scan(Duration::from_millis(10)).await.unwrap();

        assert!(c.connect(PEER).await.is_err());
        assert_eq!(c.bridge().subscriptions(), vec![COMMAND_CHAR_UUID]);
        assert_eq!(c.bridge().disconnects(), 1);
        assert_eq!(c.state(), CentralState::Idle);

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, LinkEvent::Connected { .. }));
            saw_error |= matches!(event, LinkEvent::Error(_));
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let (c, _rx) = central(with_peer());
        assert!(matches!(
            c.send(COMMAND_CHAR_UUID, &json!({})),
            Err(LinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_writes_one_chunk_at_a_time() {
        let (c, _rx) = connected().await;
        let handle = c
            .send(COMMAND_CHAR_UUID, &json!({"cmd": "unlock", "pin": "123456"}))
            .unwrap();

        assert_eq!(c.bridge().take_sent().len(), 1);
        c.on_operation_complete(COMMAND_CHAR_UUID);
        let second = c.bridge().take_sent();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind, OperationKind::Write);
        assert_ne!(second[0].data[0] & 0x04, 0);
        c.on_operation_complete(COMMAND_CHAR_UUID);

        assert_eq!(handle.await, Ok(()));
    }

    #[tokio::test]
    async fn test_notification_reassembles() {
        let (c, mut rx) = connected().await;
        while rx.try_recv().is_ok() {}

        c.on_notification(DEV_STATUS_CHAR_UUID, b"\x02{\"battery\"").unwrap();
        c.on_notification(DEV_STATUS_CHAR_UUID, b"\x06:87}").unwrap();

        assert_eq!(
            rx.try_recv().ok(),
            Some(LinkEvent::Message {
                endpoint: DEV_STATUS_CHAR_UUID,
                message: json!({"battery": 87}),
            })
        );
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending() {
        let (c, _rx) = connected().await;
        let handle = c
            .send(COMMAND_CHAR_UUID, &json!({"blob": "q".repeat(60)}))
            .unwrap();
        c.on_notification(DEV_INFO_CHAR_UUID, b"\x02{\"partial\"").unwrap();

        c.disconnect().await.unwrap();
        assert_eq!(handle.await, Err(LinkError::ConnectionLost));
        assert_eq!(c.pending_bytes(&DEV_INFO_CHAR_UUID), 0);
        assert_eq!(c.disconnect().await, Err(LinkError::NotConnected));
    }

    #[tokio::test]
    async fn test_remote_disconnect_clears_session() {
        let (c, mut rx) = connected().await;
        c.on_disconnect(PEER);

        assert!(!c.is_connected());
        assert!(c.session_id().is_none());
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.contains(&LinkEvent::Disconnected {
            address: PEER.to_string()
        }));
    }

    #[tokio::test]
    async fn test_read_collects_chunks() {
        let value = json!({"model": "L-100", "serial": "000123", "fw": "2.4.1"});
        let bytes = serde_json::to_vec(&value).unwrap();
        let chunks: VecDeque<Vec<u8>> = frame(&bytes, 19, OperationKind::ReadResponse, 64)
            .unwrap()
            .iter()
            .map(|c| c.to_bytes())
            .collect();
        let chunks = Mutex::new(chunks);

        let bridge = with_peer();
        bridge.set_read_handler(move |_| {
            chunks
                .lock()
                .pop_front()
                .ok_or_else(|| LinkError::Operation("exhausted".to_string()))
        });
        let (c, _rx) = central(bridge);
        c.scan(Duration::from_millis(10)).await.unwrap();
        c.connect(PEER).await.unwrap();

        assert_eq!(c.read(DEV_INFO_CHAR_UUID).await, Ok(value));
        assert!(matches!(
            c.read(COMMAND_CHAR_UUID).await,
            Err(LinkError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_read_does_not_prefix_next_read() {
        let value = json!({"fw": "2.4.1", "model": "L-100", "serial": "000123"});
        let bytes = serde_json::to_vec(&value).unwrap();
        let sequence: Vec<Vec<u8>> = frame(&bytes, 19, OperationKind::ReadResponse, 64)
            .unwrap()
            .iter()
            .map(|c| c.to_bytes())
            .collect();
        assert!(sequence.len() > 1);

        // first chunk, a timeout, then a fresh full sequence
        let mut script: VecDeque<Result<Vec<u8>, LinkError>> = VecDeque::new();
        script.push_back(Ok(sequence[0].clone()));
        script.push_back(Err(LinkError::Operation("att timeout".to_string())));
        script.extend(sequence.iter().cloned().map(Ok));
        let script = Mutex::new(script);

        let bridge = with_peer();
        bridge.set_read_handler(move |_| {
            script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LinkError::Operation("exhausted".to_string())))
        });
        let (c, _rx) = central(bridge);
        c.scan(Duration::from_millis(10)).await.unwrap();
        c.connect(PEER).await.unwrap();

        assert_eq!(
            c.read(DEV_INFO_CHAR_UUID).await,
            Err(LinkError::Operation("att timeout".to_string()))
        );
        assert_eq!(c.pending_bytes(&DEV_INFO_CHAR_UUID), 0);
        assert_eq!(c.read(DEV_INFO_CHAR_UUID).await, Ok(value));
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let (c, _rx) = connected().await;
        assert!(matches!(
            c.read(DEV_INFO_CHAR_UUID).await,
            Err(LinkError::Operation(_))
        ));
    }
}
