//! Record types and on-disk framing.
//!
//! Frame layout: `u32 length (big-endian, counts from the type byte through
//! the crc) | u8 type | payload | u32 crc32 (over type + payload)`.

use crc32c::crc32c;

use super::{WalError, WalResult};

/// Log sequence number. Monotone per log, starting at 1.
pub type Lsn = u64;

pub(crate) const LENGTH_PREFIX_LEN: usize = 4;
/// Length field + type byte + crc.
pub(crate) const FRAME_OVERHEAD: usize = LENGTH_PREFIX_LEN + 1 + 4;
/// Smallest legal value of the length field (type byte + crc).
pub(crate) const MIN_FRAME_LENGTH: u32 = 5;

const TYPE_DATA: u8 = 0x01;
const TYPE_CHECKPOINT: u8 = 0x02;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Data { lsn: Lsn, key: String, value: String },
    Checkpoint { lsn: Lsn },
}

impl Record {
    pub fn lsn(&self) -> Lsn {
        match self {
            Record::Data { lsn, .. } => *lsn,
            Record::Checkpoint { lsn } => *lsn,
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            Record::Data { .. } => TYPE_DATA,
            Record::Checkpoint { .. } => TYPE_CHECKPOINT,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Record::Data { lsn, key, value } => {
                let mut buf = Vec::with_capacity(8 + 2 + key.len() + value.len());
                buf.extend_from_slice(&lsn.to_be_bytes());
                buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
                buf.extend_from_slice(key.as_bytes());
                buf.extend_from_slice(value.as_bytes());
                buf
            }
            Record::Checkpoint { lsn } => lsn.to_be_bytes().to_vec(),
        }
    }

    /// Encode the full frame, including length prefix and crc.
    pub fn encode(&self, max_record_bytes: usize) -> WalResult<Vec<u8>> {
        let payload = self.encode_payload();
        let frame_len = FRAME_OVERHEAD + payload.len();
        if frame_len > max_record_bytes {
            return Err(WalError::RecordTooLarge {
                max_bytes: max_record_bytes,
                got_bytes: frame_len,
            });
        }

        let length = (1 + payload.len() + 4) as u32;
        let mut buf = Vec::with_capacity(frame_len);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.push(self.type_byte());
        buf.extend_from_slice(&payload);
        let crc = crc32c(&buf[LENGTH_PREFIX_LEN..]);
        buf.extend_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    /// Decode a record from its type byte and payload (crc already checked).
    pub(crate) fn decode(type_byte: u8, payload: &[u8]) -> WalResult<Record> {
        match type_byte {
            TYPE_DATA => {
                let mut offset = 0usize;
                let lsn = read_u64_be(payload, &mut offset)?;
                let key_len = read_u16_be(payload, &mut offset)? as usize;
                let key_bytes = take(payload, &mut offset, key_len)?;
                let key = std::str::from_utf8(key_bytes)
                    .map_err(|_| WalError::RecordInvalid {
                        reason: "key bytes not utf-8".to_string(),
                    })?
                    .to_string();
                let value = std::str::from_utf8(&payload[offset..])
                    .map_err(|_| WalError::RecordInvalid {
                        reason: "value bytes not utf-8".to_string(),
                    })?
                    .to_string();
                Ok(Record::Data { lsn, key, value })
            }
            TYPE_CHECKPOINT => {
                let mut offset = 0usize;
                let lsn = read_u64_be(payload, &mut offset)?;
                Ok(Record::Checkpoint { lsn })
            }
            other => Err(WalError::RecordInvalid {
                reason: format!("unknown record type {other:#04x}"),
            }),
        }
    }
}

fn read_u64_be(bytes: &[u8], offset: &mut usize) -> WalResult<u64> {
    let slice = take(bytes, offset, 8)?;
    Ok(u64::from_be_bytes([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ]))
}

fn read_u16_be(bytes: &[u8], offset: &mut usize) -> WalResult<u16> {
    let slice = take(bytes, offset, 2)?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

fn take<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> WalResult<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| WalError::RecordInvalid {
            reason: "payload truncated".to_string(),
        })?;
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}
