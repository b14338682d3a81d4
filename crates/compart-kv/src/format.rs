//! On-disk record framing for shard log segments
//!
//! Every record is a fixed header followed by its payload:
//! RecordHeader (16 bytes) + key_len(u16) + reserved(u16) + value_len(u32) + key_bytes + value_bytes
//!
//! Integers are little-endian. The header checksum covers the whole payload,
//! so a single flipped bit anywhere after the header is detected on replay.

use std::path::Path;

use crate::error::{KvError, KvResult};

/// Magic bytes opening every record: "CKV1"
pub const RECORD_MAGIC: [u8; 4] = *b"CKV1";

/// Hard upper bound for keys, independent of configuration
pub const MAX_KEY_SIZE: usize = 1024;

/// Hard upper bound for values (64MB)
pub const MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

/// Record header size in bytes
pub const RECORD_HEADER_SIZE: usize = 16;

/// Fixed payload prefix: key_len + reserved + value_len
const PAYLOAD_PREFIX_SIZE: usize = 8;

/// Record operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or replace a value
    Put = 1,
    /// Remove a key
    Delete = 2,
}

impl Operation {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// Fixed-size record header.
///
/// Layout:
///   [0..4]   magic:    [u8;4] - "CKV1"
///   [4..8]   length:   u32    - payload length in bytes
///   [8..12]  checksum: u32    - CRC32C of payload bytes
///   [12]     op:       u8     - operation type
///   [13..16] reserved: [u8;3]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Record magic, used to resync after corruption
    pub magic: [u8; 4],
    /// Payload length (excluding this header)
    pub length: u32,
    /// CRC32C of the payload
    pub checksum: u32,
    /// Raw operation byte
    pub op: u8,
}

impl RecordHeader {
    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.op;
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            magic: [buf[0], buf[1], buf[2], buf[3]],
            length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            checksum: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            op: buf[12],
        }
    }
}

/// A decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// What the record does
    pub op: Operation,
    /// Key bytes
    pub key: Vec<u8>,
    /// Value bytes (empty for deletes)
    pub value: Vec<u8>,
}

impl Record {
    /// Total encoded size of this record
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + PAYLOAD_PREFIX_SIZE + self.key.len() + self.value.len()
    }
}

/// Encode a record, appending it to `out`.
///
/// Sizes are validated against the hard limits before anything is written.
pub fn encode_record(key: &[u8], value: &[u8], op: Operation, out: &mut Vec<u8>) -> KvResult<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(KvError::OversizedRecord {
            size: key.len() as u64,
            max_size: MAX_KEY_SIZE as u64,
            component: "key",
        });
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::OversizedRecord {
            size: value.len() as u64,
            max_size: MAX_VALUE_SIZE as u64,
            component: "value",
        });
    }

    let payload_len = PAYLOAD_PREFIX_SIZE + key.len() + value.len();
    let header_at = out.len();
    out.reserve(RECORD_HEADER_SIZE + payload_len);
    out.extend_from_slice(&[0u8; RECORD_HEADER_SIZE]);

    let payload_at = out.len();
    out.extend_from_slice(&(key.len() as u16).to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);

    let header = RecordHeader {
        magic: RECORD_MAGIC,
        length: payload_len as u32,
        checksum: crc32c::crc32c(&out[payload_at..]),
        op: op as u8,
    };
    out[header_at..payload_at].copy_from_slice(&header.to_bytes());
    Ok(())
}

/// Decode the record starting at `data[0]`.
///
/// Returns the record and the number of bytes it occupies. `origin` and
/// `offset` only feed error context.
pub fn decode_record(data: &[u8], origin: &Path, offset: u64) -> KvResult<(Record, usize)> {
    if data.len() < RECORD_HEADER_SIZE {
        return Err(KvError::TornWrite {
            path: origin.to_path_buf(),
            expected_size: RECORD_HEADER_SIZE as u32,
            available_bytes: data.len() as u64,
            offset,
        });
    }

    let mut header_bytes = [0u8; RECORD_HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..RECORD_HEADER_SIZE]);
    let header = RecordHeader::from_bytes(&header_bytes);

    if header.magic != RECORD_MAGIC {
        return Err(KvError::NoMagicFound {
            path: origin.to_path_buf(),
            offset,
            found: header.magic,
        });
    }

    let payload_end = RECORD_HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(KvError::TornWrite {
            path: origin.to_path_buf(),
            expected_size: header.length,
            available_bytes: (data.len() - RECORD_HEADER_SIZE) as u64,
            offset,
        });
    }

    let payload = &data[RECORD_HEADER_SIZE..payload_end];
    let actual = crc32c::crc32c(payload);
    if actual != header.checksum {
        return Err(KvError::ChecksumMismatch {
            path: origin.to_path_buf(),
            expected: header.checksum,
            actual,
            offset: offset + RECORD_HEADER_SIZE as u64,
        });
    }

    let corrupted = |reason: String| KvError::LogCorrupted {
        path: origin.to_path_buf(),
        offset,
        reason,
    };

    let op = Operation::from_u8(header.op)
        .ok_or_else(|| corrupted(format!("Invalid operation type: {}", header.op)))?;

    if payload.len() < PAYLOAD_PREFIX_SIZE {
        return Err(corrupted("Payload too short for length fields".to_string()));
    }
    let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let value_len = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
    let key_end = PAYLOAD_PREFIX_SIZE + key_len;
    let value_end = key_end + value_len;
    if value_end != payload.len() {
        return Err(corrupted(format!(
            "Payload length {} does not match key({}) + value({})",
            payload.len(),
            key_len,
            value_len
        )));
    }

    let record = Record {
        op,
        key: payload[PAYLOAD_PREFIX_SIZE..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
    };
    Ok((record, payload_end))
}

/// Offset of the next record magic at or after `start`, used to resync.
pub fn find_next_magic(data: &[u8], start: usize) -> Option<usize> {
    if data.len() < RECORD_MAGIC.len() {
        return None;
    }
    (start..=data.len() - RECORD_MAGIC.len()).find(|&i| data[i..i + 4] == RECORD_MAGIC)
}
