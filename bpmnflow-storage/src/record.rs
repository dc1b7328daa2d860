//! Event log records.
//!
//! Each persisted event is stored as one framed record:
//!
//! ```text
//! +----------+----------+----------+----------+----------+
//! | magic    | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 3 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+
//! | sequence            | payload (JSON event)           |
//! | 8 bytes             | length bytes                   |
//! +---------------------+--------------------------------+
//! ```
//!
//! `sequence` is the record's position in its instance log, starting at 0.

use crate::error::StorageError;
use bpmnflow_core::PersistedEvent;
use bytes::{Buf, BufMut, BytesMut};

/// Magic bytes for event records: "BPEV"
pub const RECORD_MAGIC: [u8; 4] = *b"BPEV";

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Maximum record payload size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// A decoded log record.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub sequence: u64,
    pub event: PersistedEvent,
}

impl EventRecord {
    pub fn new(sequence: u64, event: PersistedEvent) -> Self {
        Self { sequence, event }
    }

    /// Appends the encoded record to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), StorageError> {
        let payload = serde_json::to_vec(&self.event)?;
        if payload.len() > MAX_RECORD_SIZE {
            return Err(StorageError::RecordTooLarge {
                size: payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        buf.reserve(RECORD_HEADER_SIZE + payload.len());
        buf.put_slice(&RECORD_MAGIC);
        buf.put_u8(0);
        buf.put_slice(&[0u8; 3]);
        buf.put_u32(payload.len() as u32);
        buf.put_u32(crc32c::crc32c(&payload));
        buf.put_u64(self.sequence);
        buf.put_slice(&payload);
        Ok(())
    }

    /// Decodes one record from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` holds less than a full record. `offset` is
    /// only used for error reporting.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, StorageError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != RECORD_MAGIC {
            return Err(StorageError::Corruption {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        // flags: buf[4], reserved: buf[5..8]
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let sequence = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);

        if payload_len > MAX_RECORD_SIZE {
            return Err(StorageError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }
        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(StorageError::Corruption {
                offset,
                reason: format!(
                    "checksum mismatch (expected {:08x}, got {:08x})",
                    crc_expected, crc_actual
                ),
            });
        }

        let event: PersistedEvent = serde_json::from_slice(&payload)?;
        Ok(Some(Self { sequence, event }))
    }
}

/// Decodes every complete record in `data`.
///
/// A trailing partial record is ignored; a damaged record is an error.
pub fn decode_all(data: &[u8]) -> Result<Vec<EventRecord>, StorageError> {
    let mut buf = BytesMut::from(data);
    let mut records = Vec::new();
    let mut offset = 0u64;

    loop {
        let before = buf.len();
        match EventRecord::decode(&mut buf, offset)? {
            Some(record) => {
                offset += (before - buf.len()) as u64;
                records.push(record);
            }
            None => break,
        }
    }

    if !buf.is_empty() {
        tracing::warn!(
            "Ignoring {} trailing bytes of a partial record at offset {}",
            buf.len(),
            offset
        );
    }
    Ok(records)
}
