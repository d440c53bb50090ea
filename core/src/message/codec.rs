// Message codec — turns application messages into link payload bytes and back

use serde_json::Value;
use thiserror::Error;

/// Maximum decoded message size: 256 KB
/// Buffers larger than this are rejected before parsing.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Serialization failed: {0}")]
    Serialize(String),
    #[error("Deserialization failed: {0}")]
    Deserialize(String),
}

/// Byte encoding of application messages.
///
/// The link layer only moves bytes; a codec decides what a message is.
pub trait PayloadCodec: Send + Sync + 'static {
    type Message: Clone + Send + Sync + 'static;

    fn encode(&self, message: &Self::Message) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Message, CodecError>;
}

/// JSON values encoded as compact UTF-8 text
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    type Message = Value;

    fn encode(&self, message: &Value) -> Result<Vec<u8>, CodecError> {
        let bytes =
            serde_json::to_vec(message).map_err(|e| CodecError::Serialize(e.to_string()))?;

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

/// Raw bytes passed through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl PayloadCodec for RawCodec {
    type Message = Vec<u8>;

    fn encode(&self, message: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(message.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec;
        let value = json!({"a": 1, "b": [true, null, "x"]});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_json_compact_encoding() {
        let bytes = JsonCodec.encode(&json!({"a": 1})).unwrap();
        assert_eq!(bytes, br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn test_reject_malformed_json() {
        let result = JsonCodec.decode(br#"{"a":"#);
        assert!(matches!(result, Err(CodecError::Deserialize(_))));
    }

    #[test]
    fn test_reject_oversized_decode() {
        let big = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            JsonCodec.decode(&big),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_raw_passthrough() {
        let bytes = vec![0u8, 255, 7];
        assert_eq!(RawCodec.encode(&bytes).unwrap(), bytes);
        assert_eq!(RawCodec.decode(&bytes).unwrap(), bytes);
    }
}
