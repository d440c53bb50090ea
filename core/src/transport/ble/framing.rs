/// Chunk framing for characteristic-sized operations
///
/// Every chunk on the wire is `[status | payload...]`. The status byte carries
/// the operation kind in bits 0-1 and the end-of-transmission flag in bit 2;
/// bits 3-7 are reserved and must be zero.

use crate::transport::abstraction::LinkError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mask for the operation kind bits of the status byte
pub const KIND_MASK: u8 = 0x03;

/// End-of-transmission flag
pub const EOT_FLAG: u8 = 0x04;

/// Bits that must be zero in a valid status byte
pub const RESERVED_MASK: u8 = !(KIND_MASK | EOT_FLAG);

/// Size of the status header in bytes
pub const STATUS_SIZE: usize = 1;

/// Low-level operation a chunk travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Response to a characteristic read
    ReadResponse = 0,
    /// Characteristic write (central to peripheral)
    Write = 1,
    /// Indication (peripheral to central)
    Indicate = 2,
}

impl OperationKind {
    /// Decode the kind bits of a status byte
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & KIND_MASK {
            0 => Some(OperationKind::ReadResponse),
            1 => Some(OperationKind::Write),
            2 => Some(OperationKind::Indicate),
            _ => None,
        }
    }

    pub fn bits(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::ReadResponse => write!(f, "read-response"),
            OperationKind::Write => write!(f, "write"),
            OperationKind::Indicate => write!(f, "indicate"),
        }
    }
}

/// One framed unit of a segmented message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Operation this chunk is carried by
    pub kind: OperationKind,
    /// Set on the final chunk of a message only
    pub eot: bool,
    /// Payload slice (may be empty for a terminator)
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn new(kind: OperationKind, eot: bool, payload: Vec<u8>) -> Self {
        Self { kind, eot, payload }
    }

    /// Status byte for this chunk
    pub fn status(&self) -> u8 {
        self.kind.bits() | if self.eot { EOT_FLAG } else { 0 }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(STATUS_SIZE + self.payload.len());
        bytes.push(self.status());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        let (&status, payload) = bytes
            .split_first()
            .ok_or_else(|| LinkError::ProtocolViolation("empty chunk".to_string()))?;

        if status & RESERVED_MASK != 0 {
            return Err(LinkError::ProtocolViolation(format!(
                "reserved status bits set: {:#04x}",
                status
            )));
        }

        let kind = OperationKind::from_bits(status).ok_or_else(|| {
            LinkError::ProtocolViolation(format!("invalid operation kind: {:#04x}", status))
        })?;

        Ok(Self {
            kind,
            eot: status & EOT_FLAG != 0,
            payload: payload.to_vec(),
        })
    }

    /// Length on the wire, status byte included
    pub fn wire_len(&self) -> usize {
        STATUS_SIZE + self.payload.len()
    }
}

/// Number of chunks `frame` produces for a payload of `len` bytes
pub fn chunk_count(len: usize, max_chunk_size: usize) -> usize {
    if len == 0 {
        return 1;
    }
    let data_chunks = len.div_ceil(max_chunk_size);
    if len % max_chunk_size == 0 {
        data_chunks + 1
    } else {
        data_chunks
    }
}

/// Split a payload into chunks of at most `max_chunk_size` payload bytes.
///
/// The last chunk carries EOT. When the payload fills its last data chunk
/// exactly, a zero-length EOT terminator follows it.
pub fn frame(
    payload: &[u8],
    max_chunk_size: usize,
    kind: OperationKind,
    capacity: usize,
) -> Result<Vec<Chunk>, LinkError> {
    if max_chunk_size == 0 {
        return Err(LinkError::InvalidConfig(
            "chunk size must be greater than zero".to_string(),
        ));
    }

    let total = chunk_count(payload.len(), max_chunk_size);
    if total > capacity {
        return Err(LinkError::Oversize {
            chunks: total,
            capacity,
        });
    }

    let mut chunks: Vec<Chunk> = payload
        .chunks(max_chunk_size)
        .map(|slice| Chunk::new(kind, false, slice.to_vec()))
        .collect();

    match chunks.last_mut() {
        Some(last) if last.payload.len() < max_chunk_size => last.eot = true,
        _ => chunks.push(Chunk::new(kind, true, Vec::new())),
    }

    debug_assert_eq!(chunks.len(), total);
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_byte_layout() {
        assert_eq!(Chunk::new(OperationKind::ReadResponse, false, vec![]).status(), 0x00);
        assert_eq!(Chunk::new(OperationKind::Write, false, vec![]).status(), 0x01);
        assert_eq!(Chunk::new(OperationKind::Indicate, false, vec![]).status(), 0x02);
        assert_eq!(Chunk::new(OperationKind::Indicate, true, vec![]).status(), 0x06);
        assert_eq!(Chunk::new(OperationKind::ReadResponse, true, vec![]).status(), 0x04);
    }

    #[test]
    fn test_chunk_wire_roundtrip() {
        let chunk = Chunk::new(OperationKind::Write, true, b"abc".to_vec());
        let bytes = chunk.to_bytes();
        assert_eq!(bytes, vec![0x05, b'a', b'b', b'c']);
        assert_eq!(Chunk::from_bytes(&bytes).expect("valid chunk"), chunk);
    }

    #[test]
    fn test_chunk_rejects_empty_bytes() {
        assert!(matches!(
            Chunk::from_bytes(&[]),
            Err(LinkError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_chunk_rejects_reserved_bits() {
        assert!(Chunk::from_bytes(&[0x08, 1, 2]).is_err());
        assert!(Chunk::from_bytes(&[0x80]).is_err());
    }

    #[test]
    fn test_chunk_rejects_invalid_kind() {
        assert!(Chunk::from_bytes(&[0x03]).is_err());
    }

    #[test]
    fn test_frame_small_json() {
        let chunks = frame(br#"{"a":1}"#, 19, OperationKind::Indicate, 100).expect("frame");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].eot);
        assert_eq!(chunks[0].payload, br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn test_frame_exact_multiple_appends_terminator() {
        let payload = vec![b'x'; 38];
        let chunks = frame(&payload, 19, OperationKind::Write, 100).expect("frame");

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].payload.len(), 19);
        assert_eq!(chunks[1].payload.len(), 19);
        assert!(!chunks[0].eot);
        assert!(!chunks[1].eot);
        assert!(chunks[2].eot);
        assert!(chunks[2].payload.is_empty());
    }

    #[test]
    fn test_frame_partial_last_chunk() {
        let payload = vec![7u8; 20];
        let chunks = frame(&payload, 19, OperationKind::Write, 100).expect("frame");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].payload, vec![7u8]);
        assert!(chunks[1].eot);
        assert!(!chunks[0].eot);
    }

    #[test]
    fn test_frame_empty_payload() {
        let chunks = frame(&[], 19, OperationKind::Write, 100).expect("frame");
        assert_eq!(chunks, vec![Chunk::new(OperationKind::Write, true, vec![])]);
    }

    #[test]
    fn test_frame_oversize() {
        let payload = vec![0u8; 100];
        let result = frame(&payload, 10, OperationKind::Write, 10);

        // 100 bytes / 10 = 10 data chunks + terminator = 11
        assert_eq!(
            result,
            Err(LinkError::Oversize {
                chunks: 11,
                capacity: 10
            })
        );
    }

    #[test]
    fn test_frame_zero_chunk_size() {
        assert!(matches!(
            frame(b"x", 0, OperationKind::Write, 10),
            Err(LinkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_chunk_count_formula() {
        assert_eq!(chunk_count(0, 19), 1);
        assert_eq!(chunk_count(7, 19), 1);
        assert_eq!(chunk_count(19, 19), 2);
        assert_eq!(chunk_count(20, 19), 2);
        assert_eq!(chunk_count(38, 19), 3);
        assert_eq!(chunk_count(39, 19), 3);
    }

    #[test]
    fn test_frame_kind_propagates() {
        let chunks = frame(&[1u8; 50], 19, OperationKind::ReadResponse, 100).expect("frame");
        assert!(chunks.iter().all(|c| c.kind == OperationKind::ReadResponse));
        assert_eq!(chunks.iter().filter(|c| c.eot).count(), 1);
    }
}
