// Message module — payload encoding for the link layer

pub mod codec;

pub use codec::{CodecError, JsonCodec, PayloadCodec, RawCodec, MAX_MESSAGE_SIZE};
