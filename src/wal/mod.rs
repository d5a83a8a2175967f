//! Durable write-ahead log with checkpoint-truncate and replay.
//!
//! The log is a sequence of size-bounded segment files. Every append is
//! fsynced before it returns; recovery replays the surviving segments and
//! tolerates a torn write at the tail of the log while refusing to open a
//! log with corruption anywhere else.

mod record;
mod replay;
mod segment;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

pub use record::{Lsn, Record};
use segment::SegmentWriter;

/// Soft cap on a single segment file (4 MiB).
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 4 * 1024 * 1024;

/// Upper bound on a single encoded record.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

pub type WalResult<T> = std::result::Result<T, WalError>;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("record too large ({got_bytes} bytes, max {max_bytes})")]
    RecordTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("key too large ({got} bytes, max {max})")]
    KeyTooLarge { max: usize, got: usize },
    #[error("record decode failed: {reason}")]
    RecordInvalid { reason: String },
    #[error("mid-segment corruption at {path:?} offset {offset}: {reason}")]
    MidSegmentCorruption {
        path: PathBuf,
        offset: u64,
        reason: Corruption,
    },
    #[error("unknown lsn {lsn}")]
    UnknownLsn { lsn: Lsn },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Corruption {
    #[error("invalid record length {length}")]
    InvalidLength { length: u32 },
    #[error("crc mismatch (expected {expected:#010x}, got {got:#010x})")]
    CrcMismatch { expected: u32, got: u32 },
}

impl WalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WalError::Io { .. } => ErrorKind::Io,
            WalError::RecordTooLarge { .. }
            | WalError::KeyTooLarge { .. }
            | WalError::UnknownLsn { .. } => ErrorKind::Invalid,
            WalError::RecordInvalid { .. } | WalError::MidSegmentCorruption { .. } => {
                ErrorKind::Corruption
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub max_segment_bytes: u64,
    pub max_record_bytes: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

/// Counters observable through [`Wal::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalStats {
    pub records_appended: u64,
    pub checkpoints: u64,
    pub segments_created: u64,
    pub records_replayed: u64,
    pub tail_truncated: bool,
}

/// Durable append-only log backing an in-memory key/value map.
///
/// Every applied entry has been fsynced. Safe for concurrent callers;
/// appends are serialized on an internal lock because the segment file is a
/// single append stream.
#[derive(Debug)]
pub struct Wal {
    inner: Mutex<WalInner>,
}

#[derive(Debug)]
struct WalInner {
    config: WalConfig,
    dir: PathBuf,
    writer: SegmentWriter,
    kv: BTreeMap<String, String>,
    /// Appended but not yet applied entries.
    pending: BTreeMap<Lsn, (String, String)>,
    next_lsn: Lsn,
    applied_up_to: Lsn,
    stats: WalStats,
}

impl Wal {
    /// Open (or create) a log directory, replaying any existing segments.
    pub fn open(dir: impl AsRef<Path>, config: WalConfig) -> WalResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| WalError::Io {
            path: Some(dir.clone()),
            source,
        })?;

        let outcome = replay::replay_dir(&dir, &config)?;

        let mut kv = BTreeMap::new();
        let mut max_lsn: Lsn = 0;
        let mut checkpoint_lsn: Lsn = 0;
        let mut replayed = 0u64;
        for record in &outcome.records {
            match record {
                Record::Data { lsn, key, value } => {
                    kv.insert(key.clone(), value.clone());
                    max_lsn = max_lsn.max(*lsn);
                    replayed += 1;
                }
                Record::Checkpoint { lsn } => {
                    checkpoint_lsn = checkpoint_lsn.max(*lsn);
                }
            }
        }

        let writer = match outcome.tail_segment {
            Some(tail) if tail.len < config.max_segment_bytes => {
                SegmentWriter::open_existing(&dir, tail.seq, tail.len, config.max_segment_bytes)?
            }
            Some(tail) => SegmentWriter::create(&dir, tail.seq + 1, config.max_segment_bytes)?,
            None => SegmentWriter::create(&dir, 0, config.max_segment_bytes)?,
        };

        tracing::info!(
            dir = %dir.display(),
            segments = outcome.segments_scanned,
            records = replayed,
            checkpoint_lsn,
            tail_truncated = outcome.tail_truncated,
            "wal recovered"
        );

        let applied_up_to = max_lsn.max(checkpoint_lsn);
        Ok(Self {
            inner: Mutex::new(WalInner {
                config,
                dir,
                writer,
                kv,
                pending: BTreeMap::new(),
                next_lsn: applied_up_to + 1,
                applied_up_to,
                stats: WalStats {
                    records_replayed: replayed,
                    tail_truncated: outcome.tail_truncated,
                    ..WalStats::default()
                },
            }),
        })
    }

    /// Append a DATA record, fsync it, and return its LSN.
    ///
    /// On failure the LSN is not consumed; the entry becomes visible to
    /// [`Wal::get`] only after [`Wal::apply`].
    pub fn append(&self, key: &str, value: &str) -> WalResult<Lsn> {
        let mut inner = self.inner.lock().expect("wal lock poisoned");
        if key.len() > u16::MAX as usize {
            return Err(WalError::KeyTooLarge {
                max: u16::MAX as usize,
                got: key.len(),
            });
        }

        let lsn = inner.next_lsn;
        let record = Record::Data {
            lsn,
            key: key.to_string(),
            value: value.to_string(),
        };
        let frame = record.encode(inner.config.max_record_bytes)?;
        let outcome = inner.writer.append(&frame)?;

        inner.next_lsn += 1;
        inner.pending.insert(lsn, (key.to_string(), value.to_string()));
        inner.stats.records_appended += 1;
        if outcome.rotated {
            inner.stats.segments_created += 1;
            tracing::debug!(seq = outcome.seq, "wal segment rotated");
        }
        Ok(lsn)
    }

    /// Apply the appended entry at `lsn` to the in-memory map.
    ///
    /// Applying an already-applied LSN is a no-op; an LSN that was never
    /// appended is `Invalid`.
    pub fn apply(&self, lsn: Lsn) -> WalResult<()> {
        let mut inner = self.inner.lock().expect("wal lock poisoned");
        if let Some((key, value)) = inner.pending.remove(&lsn) {
            inner.kv.insert(key, value);
            inner.applied_up_to = inner.applied_up_to.max(lsn);
            return Ok(());
        }
        if lsn > 0 && lsn < inner.next_lsn {
            // Already applied (possibly replayed at open).
            return Ok(());
        }
        Err(WalError::UnknownLsn { lsn })
    }

    /// Write a CHECKPOINT record and delete all strictly-prior segments.
    ///
    /// The checkpoint never advances past the oldest un-applied append, so
    /// appended-but-unapplied entries remain replayable.
    pub fn checkpoint(&self) -> WalResult<()> {
        let mut inner = self.inner.lock().expect("wal lock poisoned");
        let checkpoint_lsn = match inner.pending.keys().next() {
            Some(&first_pending) => inner.applied_up_to.min(first_pending.saturating_sub(1)),
            None => inner.applied_up_to,
        };

        let record = Record::Checkpoint { lsn: checkpoint_lsn };
        let frame = record.encode(inner.config.max_record_bytes)?;
        let outcome = inner.writer.append(&frame)?;
        if outcome.rotated {
            inner.stats.segments_created += 1;
        }

        let retained_seq = outcome.seq;
        let mut deleted = 0usize;
        for info in segment::list_segments(&inner.dir)? {
            if info.seq < retained_seq {
                std::fs::remove_file(&info.path).map_err(|source| WalError::Io {
                    path: Some(info.path.clone()),
                    source,
                })?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            segment::fsync_dir(&inner.dir)?;
        }

        inner.stats.checkpoints += 1;
        tracing::debug!(checkpoint_lsn, deleted_segments = deleted, "wal checkpoint");
        Ok(())
    }

    /// Read a key from the in-memory map (applied entries only).
    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().expect("wal lock poisoned");
        inner.kv.get(key).cloned()
    }

    pub fn applied_up_to(&self) -> Lsn {
        self.inner.lock().expect("wal lock poisoned").applied_up_to
    }

    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().expect("wal lock poisoned").next_lsn
    }

    pub fn stats(&self) -> WalStats {
        self.inner.lock().expect("wal lock poisoned").stats
    }

    /// Flush and close the log.
    pub fn close(self) -> WalResult<()> {
        let inner = self.inner.into_inner().expect("wal lock poisoned");
        inner.writer.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn small_config() -> WalConfig {
        WalConfig {
            max_segment_bytes: 256,
            max_record_bytes: 128,
        }
    }

    #[test]
    fn append_apply_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let wal = Wal::open(temp.path(), WalConfig::default()).unwrap();

        let lsn1 = wal.append("a", "alpha").unwrap();
        let lsn2 = wal.append("b", "beta").unwrap();
        assert_eq!(lsn1, 1);
        assert_eq!(lsn2, 2);

        assert_eq!(wal.get("a"), None, "unapplied entries are invisible");
        wal.apply(lsn1).unwrap();
        wal.apply(lsn2).unwrap();
        assert_eq!(wal.get("a").as_deref(), Some("alpha"));
        assert_eq!(wal.get("b").as_deref(), Some("beta"));
        assert_eq!(wal.applied_up_to(), 2);
    }

    #[test]
    fn apply_unknown_lsn_is_invalid() {
        let temp = TempDir::new().unwrap();
        let wal = Wal::open(temp.path(), WalConfig::default()).unwrap();
        let err = wal.apply(42).unwrap_err();
        assert!(matches!(err, WalError::UnknownLsn { lsn: 42 }));
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn recovery_restores_applied_state() {
        let temp = TempDir::new().unwrap();
        {
            let wal = Wal::open(temp.path(), WalConfig::default()).unwrap();
            for (k, v) in [("a", "alpha"), ("b", "beta"), ("c", "gamma")] {
                let lsn = wal.append(k, v).unwrap();
                wal.apply(lsn).unwrap();
            }
            wal.close().unwrap();
        }

        let wal = Wal::open(temp.path(), WalConfig::default()).unwrap();
        assert_eq!(wal.get("a").as_deref(), Some("alpha"));
        assert_eq!(wal.get("c").as_deref(), Some("gamma"));
        assert_eq!(wal.next_lsn(), 4);
        assert_eq!(wal.stats().records_replayed, 3);
    }

    #[test]
    fn segments_rotate_and_checkpoint_deletes_old_ones() {
        let temp = TempDir::new().unwrap();
        let wal = Wal::open(temp.path(), small_config()).unwrap();
        for i in 0..20 {
            let lsn = wal.append(&format!("key-{i}"), "value").unwrap();
            wal.apply(lsn).unwrap();
        }
        let segments_before = std::fs::read_dir(temp.path()).unwrap().count();
        assert!(segments_before > 1, "expected rotation to create segments");

        wal.checkpoint().unwrap();
        let segments_after = std::fs::read_dir(temp.path()).unwrap().count();
        assert!(
            segments_after < segments_before,
            "checkpoint should delete strictly-prior segments"
        );

        // State survives a reopen after truncation.
        drop(wal);
        let wal = Wal::open(temp.path(), small_config()).unwrap();
        assert_eq!(wal.get("key-19").as_deref(), Some("value"));
    }

    #[test]
    fn torn_tail_is_tolerated() {
        let temp = TempDir::new().unwrap();
        {
            let wal = Wal::open(temp.path(), WalConfig::default()).unwrap();
            for (k, v) in [("a", "alpha"), ("b", "beta")] {
                let lsn = wal.append(k, v).unwrap();
                wal.apply(lsn).unwrap();
            }
            wal.close().unwrap();
        }

        // Truncate the last 3 bytes of the only segment.
        let path = temp.path().join("wal-0000000000.log");
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 3).unwrap();

        let wal = Wal::open(temp.path(), WalConfig::default()).unwrap();
        assert_eq!(wal.get("a").as_deref(), Some("alpha"));
        assert_eq!(wal.get("b"), None, "torn record is dropped");
        assert!(wal.stats().tail_truncated);
    }

    #[test]
    fn mid_segment_corruption_is_fatal() {
        let temp = TempDir::new().unwrap();
        {
            let wal = Wal::open(temp.path(), WalConfig::default()).unwrap();
            for i in 0..4 {
                let lsn = wal.append(&format!("k{i}"), "v").unwrap();
                wal.apply(lsn).unwrap();
            }
            wal.close().unwrap();
        }

        let path = temp.path().join("wal-0000000000.log");
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a payload byte inside the first record.
        bytes[8] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = Wal::open(temp.path(), WalConfig::default()).unwrap_err();
        assert!(matches!(err, WalError::MidSegmentCorruption { .. }));
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }
}
