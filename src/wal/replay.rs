//! Segment replay with torn-tail tolerance.
//!
//! Corruption in the middle of a segment is fatal; a torn write at the tail
//! of the log (truncated frame, or a crc mismatch on the final record) drops
//! only the torn record and stops the scan.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crc32c::crc32c;

use super::record::{LENGTH_PREFIX_LEN, MIN_FRAME_LENGTH, Record};
use super::segment::{SegmentInfo, list_segments};
use super::{Corruption, WalConfig, WalError, WalResult};

#[derive(Debug)]
pub(crate) struct ReplayOutcome {
    /// All records decoded from the surviving segments, in scan order.
    pub records: Vec<Record>,
    pub segments_scanned: usize,
    pub tail_truncated: bool,
    /// The last segment scanned (post-truncation length), if any.
    pub tail_segment: Option<SegmentInfo>,
}

pub(crate) fn replay_dir(dir: &Path, config: &WalConfig) -> WalResult<ReplayOutcome> {
    let segments = list_segments(dir)?;

    let mut records = Vec::new();
    let mut tail_truncated = false;
    let mut tail_segment = None;
    let mut scanned = 0usize;

    for segment in segments {
        scanned += 1;
        let scan = scan_segment(&segment, config.max_record_bytes, &mut records)?;
        let final_len = scan.valid_len;
        tail_segment = Some(SegmentInfo {
            len: final_len,
            ..segment.clone()
        });
        if scan.truncated {
            tail_truncated = true;
            tracing::warn!(
                path = %segment.path.display(),
                valid_len = final_len,
                "wal tail truncated; dropping torn record"
            );
            // Torn write: nothing after this point is trustworthy.
            break;
        }
    }

    Ok(ReplayOutcome {
        records,
        segments_scanned: scanned,
        tail_truncated,
        tail_segment,
    })
}

struct ScanOutcome {
    valid_len: u64,
    truncated: bool,
}

fn scan_segment(
    segment: &SegmentInfo,
    max_record_bytes: usize,
    records: &mut Vec<Record>,
) -> WalResult<ScanOutcome> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&segment.path)
        .map_err(|source| WalError::Io {
            path: Some(segment.path.clone()),
            source,
        })?;

    let io_err = |source| WalError::Io {
        path: Some(segment.path.clone()),
        source,
    };

    let mut offset = 0u64;
    let mut truncated = false;

    while offset < segment.len {
        let remaining = segment.len - offset;
        if remaining < LENGTH_PREFIX_LEN as u64 {
            truncated = true;
            break;
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        file.read_exact(&mut prefix).map_err(io_err)?;
        let length = u32::from_be_bytes(prefix);

        let mid_file = |reason| {
            Err(WalError::MidSegmentCorruption {
                path: segment.path.clone(),
                offset,
                reason,
            })
        };

        if length < MIN_FRAME_LENGTH || length as usize > max_record_bytes {
            return mid_file(Corruption::InvalidLength { length });
        }

        let frame_len = LENGTH_PREFIX_LEN as u64 + length as u64;
        if frame_len > remaining {
            truncated = true;
            break;
        }

        let mut body = vec![0u8; length as usize];
        file.read_exact(&mut body).map_err(io_err)?;

        let crc_offset = body.len() - 4;
        let expected = u32::from_be_bytes([
            body[crc_offset],
            body[crc_offset + 1],
            body[crc_offset + 2],
            body[crc_offset + 3],
        ]);
        let got = crc32c(&body[..crc_offset]);
        if expected != got {
            if offset + frame_len == segment.len {
                // Torn write over the final record.
                truncated = true;
                break;
            }
            return mid_file(Corruption::CrcMismatch { expected, got });
        }

        let record = Record::decode(body[0], &body[1..crc_offset])?;
        records.push(record);
        offset += frame_len;
    }

    if truncated {
        file.set_len(offset).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    } else {
        debug_assert_eq!(offset, segment.len);
    }
    // Leave the cursor consistent for the append reopen.
    file.seek(SeekFrom::Start(offset)).map_err(io_err)?;

    Ok(ScanOutcome {
        valid_len: offset,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::segment::SegmentWriter;
    use tempfile::TempDir;

    fn write_records(dir: &Path, records: &[Record]) -> SegmentInfo {
        let mut writer = SegmentWriter::create(dir, 0, u64::MAX).unwrap();
        for record in records {
            writer.append(&record.encode(1024).unwrap()).unwrap();
        }
        list_segments(dir).unwrap().remove(0)
    }

    fn data(lsn: u64) -> Record {
        Record::Data {
            lsn,
            key: format!("key-{lsn}"),
            value: "value".to_string(),
        }
    }

    #[test]
    fn scan_reads_all_records() {
        let temp = TempDir::new().unwrap();
        write_records(temp.path(), &[data(1), data(2), Record::Checkpoint { lsn: 2 }]);

        let outcome = replay_dir(temp.path(), &WalConfig::default()).unwrap();
        assert_eq!(outcome.records.len(), 3);
        assert!(!outcome.tail_truncated);
        assert_eq!(outcome.segments_scanned, 1);
    }

    #[test]
    fn torn_tail_drops_only_final_record() {
        let temp = TempDir::new().unwrap();
        let segment = write_records(temp.path(), &[data(1), data(2)]);

        let file = OpenOptions::new().write(true).open(&segment.path).unwrap();
        file.set_len(segment.len - 1).unwrap();

        let outcome = replay_dir(temp.path(), &WalConfig::default()).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.tail_truncated);

        // The torn record is physically removed so appends can resume.
        let repaired = list_segments(temp.path()).unwrap().remove(0);
        assert_eq!(repaired.len, outcome.tail_segment.unwrap().len);
    }

    #[test]
    fn corrupt_crc_mid_segment_is_fatal() {
        let temp = TempDir::new().unwrap();
        let segment = write_records(temp.path(), &[data(1), data(2)]);

        let mut bytes = std::fs::read(&segment.path).unwrap();
        bytes[6] ^= 0xFF;
        std::fs::write(&segment.path, &bytes).unwrap();

        let err = replay_dir(temp.path(), &WalConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            WalError::MidSegmentCorruption {
                reason: Corruption::CrcMismatch { .. },
                ..
            }
        ));
    }

    #[test]
    fn impossible_length_is_fatal() {
        let temp = TempDir::new().unwrap();
        let segment = write_records(temp.path(), &[data(1), data(2)]);

        let mut bytes = std::fs::read(&segment.path).unwrap();
        // Overwrite the first length prefix with an absurd value.
        bytes[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        std::fs::write(&segment.path, &bytes).unwrap();

        let err = replay_dir(temp.path(), &WalConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            WalError::MidSegmentCorruption {
                reason: Corruption::InvalidLength { .. },
                ..
            }
        ));
    }
}
