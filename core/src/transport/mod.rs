// Transport module — link abstraction and the BLE link layer

pub mod abstraction;
pub mod ble;

pub use abstraction::{EndpointId, LinkError, LinkEvent, OperationSink, RadioState};
