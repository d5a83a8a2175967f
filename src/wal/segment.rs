//! Segment files, rotation, and fsync discipline.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{WalError, WalResult};

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

pub(crate) fn segment_file_name(seq: u64) -> String {
    format!("{SEGMENT_PREFIX}{seq:010}{SEGMENT_SUFFIX}")
}

fn parse_segment_seq(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    if digits.len() != 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SegmentInfo {
    pub seq: u64,
    pub path: PathBuf,
    pub len: u64,
}

/// List segment files in `dir`, ordered by sequence number.
///
/// Ten-digit zero-padded sequence numbers make lexicographic and numeric
/// order agree; unknown files are ignored.
pub(crate) fn list_segments(dir: &Path) -> WalResult<Vec<SegmentInfo>> {
    let entries = fs::read_dir(dir).map_err(|source| WalError::Io {
        path: Some(dir.to_path_buf()),
        source,
    })?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| WalError::Io {
            path: Some(dir.to_path_buf()),
            source,
        })?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(seq) = parse_segment_seq(name) else {
            continue;
        };
        let len = entry
            .metadata()
            .map_err(|source| WalError::Io {
                path: Some(path.clone()),
                source,
            })?
            .len();
        segments.push(SegmentInfo { seq, path, len });
    }
    segments.sort_by_key(|segment| segment.seq);
    Ok(segments)
}

pub(crate) fn fsync_dir(dir: &Path) -> WalResult<()> {
    let file = File::open(dir).map_err(|source| WalError::Io {
        path: Some(dir.to_path_buf()),
        source,
    })?;
    file.sync_all().map_err(|source| WalError::Io {
        path: Some(dir.to_path_buf()),
        source,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AppendOutcome {
    pub seq: u64,
    pub rotated: bool,
}

/// Append stream over the current tail segment.
#[derive(Debug)]
pub(crate) struct SegmentWriter {
    dir: PathBuf,
    file: File,
    path: PathBuf,
    seq: u64,
    bytes_written: u64,
    max_segment_bytes: u64,
}

impl SegmentWriter {
    pub fn create(dir: &Path, seq: u64, max_segment_bytes: u64) -> WalResult<Self> {
        let path = dir.join(segment_file_name(seq));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| WalError::Io {
                path: Some(path.clone()),
                source,
            })?;
        fsync_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            path,
            seq,
            bytes_written: 0,
            max_segment_bytes,
        })
    }

    pub fn open_existing(dir: &Path, seq: u64, len: u64, max_segment_bytes: u64) -> WalResult<Self> {
        let path = dir.join(segment_file_name(seq));
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|source| WalError::Io {
                path: Some(path.clone()),
                source,
            })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            path,
            seq,
            bytes_written: len,
            max_segment_bytes,
        })
    }

    /// Write one encoded frame and fsync it, rotating first when the frame
    /// would push the segment past its soft cap.
    pub fn append(&mut self, frame: &[u8]) -> WalResult<AppendOutcome> {
        let rotated = self.should_rotate(frame.len() as u64);
        if rotated {
            self.rotate()?;
        }

        self.file.write_all(frame).map_err(|source| WalError::Io {
            path: Some(self.path.clone()),
            source,
        })?;
        // Full fsync: the length prefix must be durable before append returns.
        self.file.sync_all().map_err(|source| WalError::Io {
            path: Some(self.path.clone()),
            source,
        })?;
        self.bytes_written += frame.len() as u64;

        Ok(AppendOutcome {
            seq: self.seq,
            rotated,
        })
    }

    pub fn sync(&self) -> WalResult<()> {
        self.file.sync_all().map_err(|source| WalError::Io {
            path: Some(self.path.clone()),
            source,
        })
    }

    fn should_rotate(&self, next_len: u64) -> bool {
        self.bytes_written > 0 && self.bytes_written.saturating_add(next_len) > self.max_segment_bytes
    }

    fn rotate(&mut self) -> WalResult<()> {
        self.file.sync_all().map_err(|source| WalError::Io {
            path: Some(self.path.clone()),
            source,
        })?;
        let next = Self::create(&self.dir, self.seq + 1, self.max_segment_bytes)?;
        self.file = next.file;
        self.path = next.path;
        self.seq = next.seq;
        self.bytes_written = 0;
        Ok(())
    }
}
