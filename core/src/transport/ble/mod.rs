/// BLE (Bluetooth Low Energy) link layer
///
/// Moves JSON (or raw) messages over GATT characteristics that carry at most
/// one MTU per operation. It includes:
///
/// - **framing**: status-byte chunk format and the framer
/// - **reassembly**: per-endpoint reassembly with stale-buffer expiry
/// - **queue**: flow-controlled outbound queue, one outstanding chunk per endpoint
/// - **session**: per-connection state torn down as a unit
/// - **peripheral**: GATT server lifecycle with bounded registration retries
/// - **central**: scan → connect → discover → subscribe pipeline
/// - **events**: typed event routing
/// - **loopback**: in-memory bridges for running both roles without a radio
///
/// Platform code (CoreBluetooth, BlueZ, Android) implements the bridge traits
/// and forwards its callbacks; everything here is testable without hardware.

pub mod central;
pub mod config;
pub mod events;
pub mod framing;
pub mod gatt;
pub mod loopback;
pub mod peripheral;
pub mod queue;
pub mod reassembly;
pub mod session;

// Re-export commonly used types
pub use central::{Central, CentralBridge, CentralState};
pub use config::LinkConfig;
pub use events::EventRouter;
pub use framing::{chunk_count, frame, Chunk, OperationKind, EOT_FLAG};
pub use gatt::{
    default_endpoints, Capability, Endpoint, EndpointRegistry, Role, COMMAND_CHAR_UUID,
    CONN_TYPE_CHAR_UUID, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MTU, DEV_INFO_CHAR_UUID,
    DEV_STATUS_CHAR_UUID, GATT_SERVICE_UUID,
};
pub use loopback::{pump, LoopbackCentral, LoopbackPeripheral, SentOperation};
pub use peripheral::{Peripheral, PeripheralBridge, PeripheralState};
pub use queue::{CompletionHandle, FlowQueue, DEFAULT_QUEUE_CAPACITY};
pub use reassembly::{ReassemblyOutcome, Reassembler};
pub use session::{spawn_sweeper, ConnectionSession, SessionId, StaleSweep};
