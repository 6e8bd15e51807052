//! Record model and binary codec for the corsac WAL.
//!
//! Every durable unit appended to the segmented log is a [`Record`]: a
//! tagged union over series registrations, samples, exemplars, histogram
//! observations, and tombstones. Records are encoded with a one-byte type
//! tag followed by the variant's fields, integers little-endian and strings
//! length-prefixed, so that a partially written tail can be detected and
//! cut off during replay.

use crate::error::{Result, WalError};

/// Stable identifier for a unique label set.
///
/// Refs are assigned monotonically starting at 1 and are never reused, even
/// after the series is truncated away. The value 0 means "unassigned" and
/// asks the appender to resolve the ref from the label set.
pub type SeriesRef = u64;

/// Maximum summed byte length of an exemplar's label names and values.
///
/// Matches the limit enforced by downstream consumers of this format.
pub const EXEMPLAR_MAX_LABEL_LEN: usize = 128;

/// Bit pattern of the staleness sentinel value.
///
/// A reserved NaN distinct from the ordinary quiet NaN, used to signal that
/// a series has stopped reporting.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// Returns the staleness sentinel value.
pub fn stale_nan() -> f64 {
    f64::from_bits(STALE_NAN_BITS)
}

/// Returns true if the value is the staleness sentinel.
///
/// An ordinary NaN compares false; only the reserved bit pattern matches.
pub fn is_stale_nan(value: f64) -> bool {
    value.to_bits() == STALE_NAN_BITS
}

/// A single name/value pair of a label set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

/// An ordered collection of labels identifying a series.
///
/// Labels are kept sorted by name, so two label sets built from the same
/// pairs in any order compare and hash equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Creates a label set from labels, sorting them into canonical order.
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort();
        Self(labels)
    }

    /// Creates a label set from (name, value) string pairs.
    pub fn from_pairs<N: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (N, V)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, value)| Label {
                    name: name.into(),
                    value: value.into(),
                })
                .collect(),
        )
    }

    /// Returns the value of the label with the given name, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Returns the number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the label set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the labels in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Returns true if two labels share a name.
    ///
    /// Labels are sorted, so duplicates are adjacent.
    pub fn has_duplicate_names(&self) -> bool {
        self.0.windows(2).any(|w| w[0].name == w[1].name)
    }

    /// Summed byte length of all label names and values.
    pub fn byte_len(&self) -> usize {
        self.0.iter().map(|l| l.name.len() + l.value.len()).sum()
    }
}

/// An exemplar observation attached to a series.
#[derive(Debug, Clone, PartialEq)]
pub struct Exemplar {
    /// Labels carried by the exemplar itself (e.g. a trace id).
    pub labels: Labels,
    /// Observed value.
    pub value: f64,
    /// Observation timestamp in milliseconds.
    pub ts: i64,
    /// Whether `ts` was explicitly provided by the producer.
    pub has_ts: bool,
}

/// A histogram observation with integer bucket counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    /// Total observation count.
    pub count: u64,
    /// Sum of all observed values.
    pub sum: f64,
    /// Cumulative bucket upper bounds.
    pub bounds: Vec<f64>,
    /// Cumulative counts per bucket, same length as `bounds`.
    pub buckets: Vec<u64>,
}

/// A histogram observation with float bucket counts.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatHistogram {
    /// Total observation count.
    pub count: f64,
    /// Sum of all observed values.
    pub sum: f64,
    /// Cumulative bucket upper bounds.
    pub bounds: Vec<f64>,
    /// Cumulative counts per bucket, same length as `bounds`.
    pub buckets: Vec<f64>,
}

/// Series registration record: binds a ref to its label set.
#[derive(Debug, Clone, PartialEq)]
pub struct RefSeries {
    /// Series ref.
    pub ref_id: SeriesRef,
    /// Label set identifying the series.
    pub labels: Labels,
}

/// Sample record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefSample {
    /// Series ref.
    pub ref_id: SeriesRef,
    /// Sample timestamp in milliseconds.
    pub ts: i64,
    /// Sample value.
    pub value: f64,
}

/// Exemplar record.
#[derive(Debug, Clone, PartialEq)]
pub struct RefExemplar {
    /// Series ref.
    pub ref_id: SeriesRef,
    /// Exemplar timestamp in milliseconds.
    pub ts: i64,
    /// Exemplar value.
    pub value: f64,
    /// Whether the timestamp was explicitly provided.
    pub has_ts: bool,
    /// Labels carried by the exemplar.
    pub labels: Labels,
}

/// Histogram record.
#[derive(Debug, Clone, PartialEq)]
pub struct RefHistogram {
    /// Series ref.
    pub ref_id: SeriesRef,
    /// Observation timestamp in milliseconds.
    pub ts: i64,
    /// The histogram observation.
    pub histogram: Histogram,
}

/// Float histogram record.
#[derive(Debug, Clone, PartialEq)]
pub struct RefFloatHistogram {
    /// Series ref.
    pub ref_id: SeriesRef,
    /// Observation timestamp in milliseconds.
    pub ts: i64,
    /// The histogram observation.
    pub histogram: FloatHistogram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Series = 1,
    Sample = 2,
    Exemplar = 3,
    Histogram = 4,
    FloatHistogram = 5,
    Tombstone = 6,
}

/// The durable unit appended to the segmented log.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Series registration.
    Series(RefSeries),
    /// Sample.
    Sample(RefSample),
    /// Exemplar.
    Exemplar(RefExemplar),
    /// Histogram observation.
    Histogram(RefHistogram),
    /// Float histogram observation.
    FloatHistogram(RefFloatHistogram),
    /// Series deletion marker, emitted by truncation.
    Tombstone(SeriesRef),
}

impl Record {
    /// Serializes the record to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        match self {
            Self::Series(s) => {
                buf.push(RecordType::Series as u8);
                buf.extend_from_slice(&s.ref_id.to_le_bytes());
                encode_labels(&mut buf, &s.labels);
            }
            Self::Sample(s) => {
                buf.push(RecordType::Sample as u8);
                buf.extend_from_slice(&s.ref_id.to_le_bytes());
                buf.extend_from_slice(&s.ts.to_le_bytes());
                buf.extend_from_slice(&s.value.to_le_bytes());
            }
            Self::Exemplar(e) => {
                buf.push(RecordType::Exemplar as u8);
                buf.extend_from_slice(&e.ref_id.to_le_bytes());
                buf.extend_from_slice(&e.ts.to_le_bytes());
                buf.extend_from_slice(&e.value.to_le_bytes());
                buf.push(u8::from(e.has_ts));
                encode_labels(&mut buf, &e.labels);
            }
            Self::Histogram(h) => {
                buf.push(RecordType::Histogram as u8);
                buf.extend_from_slice(&h.ref_id.to_le_bytes());
                buf.extend_from_slice(&h.ts.to_le_bytes());
                buf.extend_from_slice(&h.histogram.count.to_le_bytes());
                buf.extend_from_slice(&h.histogram.sum.to_le_bytes());
                buf.extend_from_slice(&(h.histogram.bounds.len() as u32).to_le_bytes());
                for bound in &h.histogram.bounds {
                    buf.extend_from_slice(&bound.to_le_bytes());
                }
                for bucket in &h.histogram.buckets {
                    buf.extend_from_slice(&bucket.to_le_bytes());
                }
            }
            Self::FloatHistogram(h) => {
                buf.push(RecordType::FloatHistogram as u8);
                buf.extend_from_slice(&h.ref_id.to_le_bytes());
                buf.extend_from_slice(&h.ts.to_le_bytes());
                buf.extend_from_slice(&h.histogram.count.to_le_bytes());
                buf.extend_from_slice(&h.histogram.sum.to_le_bytes());
                buf.extend_from_slice(&(h.histogram.bounds.len() as u32).to_le_bytes());
                for bound in &h.histogram.bounds {
                    buf.extend_from_slice(&bound.to_le_bytes());
                }
                for bucket in &h.histogram.buckets {
                    buf.extend_from_slice(&bucket.to_le_bytes());
                }
            }
            Self::Tombstone(ref_id) => {
                buf.push(RecordType::Tombstone as u8);
                buf.extend_from_slice(&ref_id.to_le_bytes());
            }
        }
        buf
    }

    /// Deserializes a record from bytes.
    ///
    /// Fails on an unknown tag or a truncated payload; never panics on
    /// arbitrary input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let tag = cur.u8()?;
        let record = match tag {
            x if x == RecordType::Series as u8 => Self::Series(RefSeries {
                ref_id: cur.u64()?,
                labels: decode_labels(&mut cur)?,
            }),
            x if x == RecordType::Sample as u8 => Self::Sample(RefSample {
                ref_id: cur.u64()?,
                ts: cur.i64()?,
                value: cur.f64()?,
            }),
            x if x == RecordType::Exemplar as u8 => Self::Exemplar(RefExemplar {
                ref_id: cur.u64()?,
                ts: cur.i64()?,
                value: cur.f64()?,
                has_ts: cur.u8()? != 0,
                labels: decode_labels(&mut cur)?,
            }),
            x if x == RecordType::Histogram as u8 => {
                let ref_id = cur.u64()?;
                let ts = cur.i64()?;
                let count = cur.u64()?;
                let sum = cur.f64()?;
                let n = cur.counted(16)?;
                let mut bounds = Vec::with_capacity(n);
                for _ in 0..n {
                    bounds.push(cur.f64()?);
                }
                let mut buckets = Vec::with_capacity(n);
                for _ in 0..n {
                    buckets.push(cur.u64()?);
                }
                Self::Histogram(RefHistogram {
                    ref_id,
                    ts,
                    histogram: Histogram {
                        count,
                        sum,
                        bounds,
                        buckets,
                    },
                })
            }
            x if x == RecordType::FloatHistogram as u8 => {
                let ref_id = cur.u64()?;
                let ts = cur.i64()?;
                let count = cur.f64()?;
                let sum = cur.f64()?;
                let n = cur.counted(16)?;
                let mut bounds = Vec::with_capacity(n);
                for _ in 0..n {
                    bounds.push(cur.f64()?);
                }
                let mut buckets = Vec::with_capacity(n);
                for _ in 0..n {
                    buckets.push(cur.f64()?);
                }
                Self::FloatHistogram(RefFloatHistogram {
                    ref_id,
                    ts,
                    histogram: FloatHistogram {
                        count,
                        sum,
                        bounds,
                        buckets,
                    },
                })
            }
            x if x == RecordType::Tombstone as u8 => Self::Tombstone(cur.u64()?),
            other => {
                return Err(WalError::Decode(format!("unknown record type {other}")));
            }
        };
        if !cur.at_end() {
            return Err(WalError::Decode("trailing bytes after record".to_string()));
        }
        Ok(record)
    }
}

fn encode_labels(buf: &mut Vec<u8>, labels: &Labels) {
    buf.extend_from_slice(&(labels.len() as u32).to_le_bytes());
    for label in labels.iter() {
        encode_str(buf, &label.name);
        encode_str(buf, &label.value);
    }
}

fn encode_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn decode_labels(cur: &mut Cursor<'_>) -> Result<Labels> {
    // Each label needs at least two length prefixes.
    let n = cur.counted(8)?;
    let mut labels = Vec::with_capacity(n);
    for _ in 0..n {
        let name = cur.string()?;
        let value = cur.string()?;
        labels.push(Label { name, value });
    }
    Ok(Labels::new(labels))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(WalError::Decode("truncated record".to_string()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads a u32 element count, rejecting counts that could not possibly
    /// fit in the remaining bytes given `min_elem_size`. Corrupt counts fail
    /// decoding instead of allocating unbounded memory.
    fn counted(&mut self, min_elem_size: usize) -> Result<usize> {
        let n = self.u32()? as usize;
        if n.saturating_mul(min_elem_size) > self.remaining() {
            return Err(WalError::Decode(format!("implausible element count {n}")));
        }
        Ok(n)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WalError::Decode("invalid utf-8 in label".to_string()))
    }
}
