// blelink core — message transport over BLE characteristics
#![allow(clippy::empty_line_after_doc_comments)]
//
// Messages are encoded by a payload codec, framed into MTU-sized chunks,
// pushed through a flow-controlled queue one outstanding operation at a time,
// and reassembled on the far side. The radio itself lives behind the
// `PeripheralBridge` / `CentralBridge` traits.

pub mod message;
pub mod transport;

pub use message::{CodecError, JsonCodec, PayloadCodec, RawCodec};
pub use transport::ble::{
    Central, CentralBridge, CompletionHandle, Endpoint, EndpointRegistry, EventRouter,
    LinkConfig, Peripheral, PeripheralBridge,
};
pub use transport::{EndpointId, LinkError, LinkEvent, OperationSink, RadioState};
