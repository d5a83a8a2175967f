//! Chunk encoder/decoder state machines.

use super::bits::{BitReader, BitWriter};
use super::{ChunkError, ChunkResult};

const FIRST_DELTA_BITS: u32 = 14;
/// Leading-zero counts are stored in 5 bits.
const MAX_STORED_LEADING: u32 = 31;

/// Delta-of-delta buckets: (zigzag payload bits, prefix bits, prefix length).
///
/// Payloads are zigzag-signed, so each bucket covers
/// `[-2^(bits-1), 2^(bits-1) - 1]`.
const DOD_BUCKETS: [(u32, u64, u32); 4] = [
    (7, 0b10, 2),
    (9, 0b110, 3),
    (12, 0b1110, 4),
    (16, 0b11110, 5),
];

fn zigzag(n: i64) -> u64 {
    (n.wrapping_shl(1) ^ (n >> 63)) as u64
}

fn unzigzag(z: u64) -> i64 {
    ((z >> 1) as i64) ^ -((z & 1) as i64)
}

/// A compressed block of `(timestamp, value)` samples.
///
/// Timestamps must be non-decreasing. The bit stream is zero-padded to the
/// byte boundary and self-delimiting only through the sample count, so the
/// count always travels with the chunk.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    bits: BitWriter,
    len: usize,

    t_last: i64,
    t_delta_last: i64,
    v_last: u64,
    v_leading: u32,
    v_meaningful: u32,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Encoded size in bytes (including padding of the final byte).
    pub fn bytes_len(&self) -> usize {
        self.bits.byte_len()
    }

    /// Whether the chunk has reached a size-based flush threshold.
    pub fn is_full(&self, max_bytes: usize) -> bool {
        self.bytes_len() >= max_bytes
    }

    /// Append one sample.
    ///
    /// The first sample stores the full 64-bit timestamp and value; the
    /// second stores a 14-bit delta, so the second timestamp may exceed the
    /// first by at most `2^14 - 1`.
    pub fn append(&mut self, ts: i64, v: f64) -> ChunkResult<()> {
        if self.len > 0 && ts < self.t_last {
            return Err(ChunkError::NonMonotonicTimestamp {
                prev: self.t_last,
                got: ts,
            });
        }

        match self.len {
            0 => {
                self.bits.write_bits(ts as u64, 64);
                self.bits.write_bits(v.to_bits(), 64);
                self.v_last = v.to_bits();
            }
            1 => {
                let delta = ts - self.t_last;
                if delta >= 1 << FIRST_DELTA_BITS {
                    return Err(ChunkError::FirstDeltaOverflow { delta });
                }
                self.bits.write_bits(delta as u64, FIRST_DELTA_BITS);
                self.t_delta_last = delta;
                self.write_value(v);
            }
            _ => {
                let delta = ts - self.t_last;
                let dod = delta - self.t_delta_last;
                self.write_dod(dod);
                self.t_delta_last = delta;
                self.write_value(v);
            }
        }
        self.t_last = ts;
        self.len += 1;
        Ok(())
    }

    fn write_dod(&mut self, dod: i64) {
        if dod == 0 {
            self.bits.write_bit(false);
            return;
        }
        let z = zigzag(dod);
        for (payload_bits, prefix, prefix_len) in DOD_BUCKETS {
            if z < 1 << payload_bits {
                self.bits.write_bits(prefix, prefix_len);
                self.bits.write_bits(z, payload_bits);
                return;
            }
        }
        self.bits.write_bits(0b11111, 5);
        self.bits.write_bits(z, 64);
    }

    fn write_value(&mut self, v: f64) {
        let bits = v.to_bits();
        let xor = self.v_last ^ bits;
        self.v_last = bits;

        if xor == 0 {
            self.bits.write_bit(false);
            return;
        }
        self.bits.write_bit(true);

        let leading = xor.leading_zeros().min(MAX_STORED_LEADING);
        let trailing = xor.trailing_zeros();
        let prev_trailing = 64 - self.v_leading - self.v_meaningful;

        if self.v_meaningful > 0 && leading >= self.v_leading && trailing >= prev_trailing {
            // The non-zero window fits inside the previous one: payload only.
            self.bits.write_bit(false);
            self.bits.write_bits(xor >> prev_trailing, self.v_meaningful);
        } else {
            let meaningful = 64 - leading - trailing;
            self.bits.write_bit(true);
            self.bits.write_bits(u64::from(leading), 5);
            self.bits.write_bits(u64::from(meaningful - 1), 6);
            self.bits.write_bits(xor >> trailing, meaningful);
            self.v_leading = leading;
            self.v_meaningful = meaningful;
        }
    }

    /// Iterate over the encoded samples.
    pub fn iter(&self) -> ChunkIter<'_> {
        ChunkIter {
            reader: BitReader::new(self.bits.as_bytes()),
            remaining: self.len,
            read: 0,
            t_last: 0,
            t_delta_last: 0,
            v_last: 0,
            v_leading: 0,
            v_meaningful: 0,
        }
    }
}

/// Decoder over a chunk's bit stream, terminated by the sample count.
pub struct ChunkIter<'a> {
    reader: BitReader<'a>,
    remaining: usize,
    read: usize,

    t_last: i64,
    t_delta_last: i64,
    v_last: u64,
    v_leading: u32,
    v_meaningful: u32,
}

impl ChunkIter<'_> {
    fn next_sample(&mut self) -> ChunkResult<(i64, f64)> {
        let sample = match self.read {
            0 => {
                let ts = self.reader.read_bits(64)? as i64;
                self.v_last = self.reader.read_bits(64)?;
                self.t_last = ts;
                (ts, f64::from_bits(self.v_last))
            }
            1 => {
                let delta = self.reader.read_bits(FIRST_DELTA_BITS)? as i64;
                self.t_delta_last = delta;
                self.t_last += delta;
                (self.t_last, self.read_value()?)
            }
            _ => {
                let dod = self.read_dod()?;
                self.t_delta_last += dod;
                self.t_last += self.t_delta_last;
                (self.t_last, self.read_value()?)
            }
        };
        self.read += 1;
        Ok(sample)
    }

    fn read_dod(&mut self) -> ChunkResult<i64> {
        if !self.reader.read_bit()? {
            return Ok(0);
        }
        for (payload_bits, _, _) in DOD_BUCKETS {
            if !self.reader.read_bit()? {
                return Ok(unzigzag(self.reader.read_bits(payload_bits)?));
            }
        }
        Ok(unzigzag(self.reader.read_bits(64)?))
    }

    fn read_value(&mut self) -> ChunkResult<f64> {
        if !self.reader.read_bit()? {
            return Ok(f64::from_bits(self.v_last));
        }
        let xor = if !self.reader.read_bit()? {
            let prev_trailing = 64 - self.v_leading - self.v_meaningful;
            self.reader.read_bits(self.v_meaningful)? << prev_trailing
        } else {
            let leading = self.reader.read_bits(5)? as u32;
            let meaningful = self.reader.read_bits(6)? as u32 + 1;
            let trailing = 64 - leading - meaningful;
            self.v_leading = leading;
            self.v_meaningful = meaningful;
            self.reader.read_bits(meaningful)? << trailing
        };
        self.v_last ^= xor;
        Ok(f64::from_bits(self.v_last))
    }
}

impl Iterator for ChunkIter<'_> {
    type Item = ChunkResult<(i64, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.read >= self.remaining {
            return None;
        }
        Some(self.next_sample())
    }
}
