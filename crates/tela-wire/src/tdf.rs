//! Tagged Data Format: compact self-describing telemetry encoding.
//!
//! A TDF buffer is a linear sequence of entries, each tagged with a 12-bit
//! id and an 8-bit sample size. Entries may carry no timestamp, an absolute
//! 48.16 timestamp, or a delta against the previous entry's timestamp
//! (2-byte unsigned or 3-byte signed, in 1/65536 s ticks). Multi-sample
//! entries are either time arrays (fixed period between samples) or diff
//! arrays (full-width base sample plus narrow per-field deltas).

use crate::epoch::{self, EpochTime};
use thiserror::Error;

/// Timestamp encoding: bits 14-15 of the id/flags word.
const TIMESTAMP_NONE: u16 = 0x0000;
const TIMESTAMP_ABSOLUTE: u16 = 0x4000;
const TIMESTAMP_RELATIVE: u16 = 0x8000;
const TIMESTAMP_EXTENDED: u16 = 0xC000;
const TIMESTAMP_MASK: u16 = 0xC000;

/// Array encoding: bits 12-13 of the id/flags word.
const ARRAY_NONE: u16 = 0x0000;
const ARRAY_TIME: u16 = 0x1000;
const ARRAY_DIFF: u16 = 0x2000;
const ARRAY_MASK: u16 = 0x3000;

const ID_MASK: u16 = 0x0FFF;

/// Largest valid TDF id (0 and 0xFFF are reserved).
pub const TDF_ID_MAX: u16 = 0x0FFE;

const ENTRY_HEADER_LEN: usize = 3;
const TIME_ABSOLUTE_LEN: usize = 6;
const TIME_RELATIVE_LEN: usize = 2;
const TIME_EXTENDED_LEN: usize = 3;
const TIME_ARRAY_HEADER_LEN: usize = 3;
const DIFF_ARRAY_HEADER_LEN: usize = 2;

/// Bit in the time-array period field marking a scaled value.
const PERIOD_SCALED: u16 = 0x8000;
const PERIOD_VAL_MASK: u16 = 0x7FFF;
/// Scale factor for large periods: 8192/65536 gives 125 ms resolution.
const PERIOD_SCALE_FACTOR: u32 = 8192;

/// Largest encodable time-array period, in epoch ticks.
pub const PERIOD_MAX: u32 = PERIOD_VAL_MASK as u32 * PERIOD_SCALE_FACTOR;

const INT24_MAX: i64 = 0x7F_FFFF;
const INT24_MIN: i64 = -INT24_MAX - 1;

/// Errors from TDF encoding and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TdfError {
    /// Reserved id, zero length/count, oversize period, or mismatched data.
    #[error("invalid argument")]
    InvalidArgument,
    /// A single sample of this entry cannot fit even in an empty buffer.
    #[error("entry can never fit in buffer of {capacity} bytes")]
    TooLarge {
        /// Capacity of the rejected buffer.
        capacity: usize,
    },
    /// The entry does not fit in the remaining buffer space.
    #[error("insufficient buffer space remaining")]
    BufferFull,
    /// The buffer bytes do not form a valid TDF entry.
    #[error("malformed entry")]
    Malformed,
    /// The buffer has been fully consumed.
    #[error("no more entries")]
    NoMoreEntries,
}

/// Supported diff-array width pairs: full-width base fields with
/// narrow per-field deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// 16-bit fields, 8-bit diffs.
    Diff16x8,
    /// 32-bit fields, 8-bit diffs.
    Diff32x8,
    /// 32-bit fields, 16-bit diffs.
    Diff32x16,
}

impl DiffType {
    /// Width of one full base field in bytes.
    #[must_use]
    pub const fn field_width(self) -> usize {
        match self {
            DiffType::Diff16x8 => 2,
            DiffType::Diff32x8 | DiffType::Diff32x16 => 4,
        }
    }

    /// Width of one encoded diff in bytes.
    #[must_use]
    pub const fn diff_width(self) -> usize {
        match self {
            DiffType::Diff16x8 | DiffType::Diff32x8 => 1,
            DiffType::Diff32x16 => 2,
        }
    }

    /// Wire value of the diff-array type byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            DiffType::Diff16x8 => 0,
            DiffType::Diff32x8 => 1,
            DiffType::Diff32x16 => 2,
        }
    }

    /// Diff type from its wire value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DiffType::Diff16x8),
            1 => Some(DiffType::Diff32x8),
            2 => Some(DiffType::Diff32x16),
            _ => None,
        }
    }
}

/// Data layout requested for an [`TdfBuffer::add_core`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdfFormat {
    /// One sample, no array header.
    Single,
    /// `num` samples at a fixed period.
    TimeArray,
    /// Samples diff-encoded against their predecessor; falls back to a
    /// time array when the data does not diff cleanly.
    DiffArray(DiffType),
    /// Caller provides data already in `[base, diffs...]` layout.
    DiffPrecomputed(DiffType),
}

/// Kind of a parsed TDF entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdfKind {
    /// Single sample.
    Single,
    /// Time array: `num` samples separated by `period` ticks.
    TimeArray,
    /// Diff array: base sample plus per-field deltas.
    DiffArray(DiffType),
}

/// A TDF buffer under construction.
///
/// The buffer owns a byte region of fixed capacity and the timestamp
/// cursor used for delta compression. The cursor is a pure cache of the
/// last emitted timestamp, never ground truth: a discontinuous time jump
/// simply forces the next entry back to an absolute timestamp.
#[derive(Debug)]
pub struct TdfBuffer {
    time: EpochTime,
    buf: Vec<u8>,
    capacity: usize,
}

impl TdfBuffer {
    /// Create an empty buffer with the given byte capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            time: 0,
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Encoded bytes accumulated so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of encoded bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// `true` when no entries have been added since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total byte capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available for entries.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Timestamp cursor: the last absolute time emitted, 0 if none.
    #[must_use]
    pub fn time(&self) -> EpochTime {
        self.time
    }

    /// Clear all entries and the timestamp cursor.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.time = 0;
    }

    /// Add a single sample.
    ///
    /// `time` of 0 encodes no timestamp. Returns the number of samples
    /// written (always 1 on success).
    ///
    /// # Errors
    ///
    /// See [`TdfBuffer::add_core`].
    pub fn add(&mut self, id: u16, time: EpochTime, data: &[u8]) -> Result<usize, TdfError> {
        let len = u8::try_from(data.len()).map_err(|_| TdfError::InvalidArgument)?;
        self.add_core(id, len, 1, time, 0, data, TdfFormat::Single)
    }

    /// Add up to `num` samples of `len` bytes as a time array.
    ///
    /// `period` is the tick spacing between consecutive samples. Returns
    /// the number of samples actually written, which may be clamped below
    /// `num` when the buffer is nearly full.
    ///
    /// # Errors
    ///
    /// See [`TdfBuffer::add_core`].
    pub fn add_array(
        &mut self,
        id: u16,
        len: u8,
        num: u8,
        time: EpochTime,
        period: u32,
        data: &[u8],
    ) -> Result<usize, TdfError> {
        let format = if num > 1 {
            TdfFormat::TimeArray
        } else {
            TdfFormat::Single
        };
        self.add_core(id, len, num, time, period, data, format)
    }

    /// Add samples with an explicit data format.
    ///
    /// Implements the full encoding decision tree: timestamp class
    /// selection against the cursor, array-header sizing, count clamping
    /// to the remaining space (reclaiming the array header when only a
    /// single sample fits), and diff-encoding validity probing.
    ///
    /// Returns the number of samples written.
    ///
    /// # Errors
    ///
    /// * [`TdfError::InvalidArgument`]: reserved id, zero `len`/`num`,
    ///   period above [`PERIOD_MAX`], or `data` shorter than the request.
    /// * [`TdfError::TooLarge`]: a single sample cannot fit even in an
    ///   empty buffer.
    /// * [`TdfError::BufferFull`]: no sample fits in the space remaining.
    #[allow(clippy::too_many_lines)]
    pub fn add_core(
        &mut self,
        id: u16,
        len: u8,
        num: u8,
        time: EpochTime,
        period: u32,
        data: &[u8],
        format: TdfFormat,
    ) -> Result<usize, TdfError> {
        if id == 0 || id > TDF_ID_MAX || len == 0 || num == 0 || period > PERIOD_MAX {
            return Err(TdfError::InvalidArgument);
        }
        let sample_len = usize::from(len);
        let min_size = ENTRY_HEADER_LEN
            + if time != 0 { TIME_ABSOLUTE_LEN } else { 0 }
            + sample_len;
        if min_size > self.capacity {
            return Err(TdfError::TooLarge {
                capacity: self.capacity,
            });
        }

        // Timestamp header, assuming the entry will be written.
        let (mut ts_flag, mut ts_len, mut delta) = (TIMESTAMP_NONE, 0usize, 0i64);
        if time != 0 {
            if self.time != 0 {
                delta = time as i64 - self.time as i64;
                if (0..=i64::from(u16::MAX)).contains(&delta) {
                    ts_flag = TIMESTAMP_RELATIVE;
                    ts_len = TIME_RELATIVE_LEN;
                } else if (INT24_MIN..=INT24_MAX).contains(&delta) {
                    ts_flag = TIMESTAMP_EXTENDED;
                    ts_len = TIME_EXTENDED_LEN;
                } else {
                    ts_flag = TIMESTAMP_ABSOLUTE;
                    ts_len = TIME_ABSOLUTE_LEN;
                }
            } else {
                ts_flag = TIMESTAMP_ABSOLUTE;
                ts_len = TIME_ABSOLUTE_LEN;
            }
        }

        // Resolve the diff request: at least two consecutive valid diffs
        // are required, otherwise the data is logged as a plain time array
        // up to the point where diff encoding becomes possible.
        let mut num = num;
        let mut diff: Option<DiffType> = None;
        let mut precomputed = false;
        match format {
            TdfFormat::Single | TdfFormat::TimeArray => {}
            TdfFormat::DiffArray(dt) => {
                if sample_len % dt.field_width() != 0
                    || data.len() < sample_len * usize::from(num)
                {
                    return Err(TdfError::InvalidArgument);
                }
                if num > 2 {
                    match first_valid_diff_run(dt, sample_len, num, data) {
                        Some(0) => diff = Some(dt),
                        Some(run_start) => {
                            num = u8::try_from(run_start).unwrap_or(u8::MAX);
                        }
                        None => {}
                    }
                }
            }
            TdfFormat::DiffPrecomputed(dt) => {
                if sample_len % dt.field_width() != 0 || num < 2 {
                    return Err(TdfError::InvalidArgument);
                }
                diff = Some(dt);
                precomputed = true;
            }
        }

        let diff_sample_len = diff.map_or(0, |dt| (sample_len / dt.field_width()) * dt.diff_width());
        let array_header_len = if num > 1 {
            if diff.is_some() {
                DIFF_ARRAY_HEADER_LEN
            } else {
                TIME_ARRAY_HEADER_LEN
            }
        } else {
            0
        };
        let total_header = ENTRY_HEADER_LEN + ts_len + array_header_len;
        let remaining = self.remaining();
        if remaining <= total_header {
            return Err(TdfError::BufferFull);
        }
        let mut payload_space = remaining - total_header;

        let total_data = |diff_active: bool, num: u8| -> usize {
            if diff_active {
                sample_len + (usize::from(num) - 1) * diff_sample_len
            } else {
                sample_len * usize::from(num)
            }
        };

        if payload_space < total_data(diff.is_some(), num) {
            let mut can_fit = if diff.is_some() {
                if payload_space >= sample_len {
                    1 + (payload_space - sample_len) / diff_sample_len
                } else {
                    0
                }
            } else {
                payload_space / sample_len
            };
            if can_fit == 0 && num > 1 {
                // Reclaim the array header space and retry as a single.
                payload_space += array_header_len;
                can_fit = payload_space / sample_len;
                if can_fit > 0 {
                    can_fit = 1;
                    diff = None;
                }
            }
            if can_fit == 0 {
                return Err(TdfError::BufferFull);
            }
            num = u8::try_from(can_fit.min(usize::from(num))).unwrap_or(u8::MAX);
        }

        // Validate the caller actually provided the samples requested.
        let required = if precomputed {
            total_data(true, num)
        } else {
            sample_len * usize::from(num)
        };
        if data.len() < required {
            return Err(TdfError::InvalidArgument);
        }

        // Encode the diff payload first; a mid-array field that does not
        // diff cleanly truncates the entry at the last valid sample.
        let mut diff_payload = Vec::new();
        if let Some(dt) = diff {
            if precomputed {
                diff_payload.extend_from_slice(&data[sample_len..total_data(true, num)]);
            } else {
                let mut written = 1u8;
                for i in 0..usize::from(num) - 1 {
                    let current = &data[i * sample_len..(i + 1) * sample_len];
                    let next = &data[(i + 1) * sample_len..(i + 2) * sample_len];
                    match encode_diff(dt, current, next) {
                        Some(encoded) => {
                            diff_payload.extend_from_slice(&encoded);
                            written += 1;
                        }
                        None => break,
                    }
                }
                num = written;
            }
        }

        let array_flag = if num > 1 {
            if diff.is_some() {
                ARRAY_DIFF
            } else {
                ARRAY_TIME
            }
        } else {
            ARRAY_NONE
        };

        // Entry header.
        self.buf
            .extend_from_slice(&(ts_flag | array_flag | id).to_le_bytes());
        self.buf.push(len);

        // Timestamp.
        match ts_flag {
            TIMESTAMP_RELATIVE => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                self.buf.extend_from_slice(&(delta as u16).to_le_bytes());
                self.time = time;
            }
            TIMESTAMP_EXTENDED => {
                #[allow(clippy::cast_possible_truncation)]
                let bytes = (delta as i32).to_le_bytes();
                self.buf.extend_from_slice(&bytes[..3]);
                self.time = time;
            }
            TIMESTAMP_ABSOLUTE => {
                self.buf
                    .extend_from_slice(&epoch::seconds(time).to_le_bytes());
                self.buf
                    .extend_from_slice(&epoch::subseconds(time).to_le_bytes());
                self.time = time;
            }
            _ => {}
        }

        // Array header.
        if num > 1 {
            if let Some(dt) = diff {
                self.buf.push(num);
                self.buf.push(dt.as_u8());
            } else {
                self.buf.push(num);
                let encoded_period = if period > u32::from(PERIOD_VAL_MASK) {
                    #[allow(clippy::cast_possible_truncation)]
                    let scaled = (period / PERIOD_SCALE_FACTOR) as u16;
                    PERIOD_SCALED | scaled
                } else {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        period as u16
                    }
                };
                self.buf.extend_from_slice(&encoded_period.to_le_bytes());
            }
        }

        // Payload.
        if diff.is_some() && num > 1 {
            self.buf.extend_from_slice(&data[..sample_len]);
            self.buf.extend_from_slice(&diff_payload);
        } else {
            self.buf
                .extend_from_slice(&data[..sample_len * usize::from(num)]);
        }

        Ok(usize::from(num))
    }
}

/// Index of the first position with two consecutive valid diffs, if any.
fn first_valid_diff_run(dt: DiffType, sample_len: usize, num: u8, data: &[u8]) -> Option<usize> {
    for i in 0..usize::from(num).saturating_sub(2) {
        let a = &data[i * sample_len..(i + 1) * sample_len];
        let b = &data[(i + 1) * sample_len..(i + 2) * sample_len];
        let c = &data[(i + 2) * sample_len..(i + 3) * sample_len];
        if encode_diff(dt, a, b).is_some() && encode_diff(dt, b, c).is_some() {
            return Some(i);
        }
    }
    None
}

/// Diff `next` against `current`, returning the encoded diff bytes or
/// `None` when any field delta exceeds the narrow width.
fn encode_diff(dt: DiffType, current: &[u8], next: &[u8]) -> Option<Vec<u8>> {
    let fw = dt.field_width();
    let mut out = Vec::with_capacity((current.len() / fw) * dt.diff_width());
    for (c, n) in current.chunks_exact(fw).zip(next.chunks_exact(fw)) {
        match dt {
            DiffType::Diff16x8 => {
                let c = u16::from_le_bytes([c[0], c[1]]);
                let n = u16::from_le_bytes([n[0], n[1]]);
                let d = n.wrapping_sub(c);
                let d8 = d as u8;
                if c.wrapping_add(i16::from(d8 as i8) as u16) != n {
                    return None;
                }
                out.push(d8);
            }
            DiffType::Diff32x8 => {
                let c = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                let n = u32::from_le_bytes([n[0], n[1], n[2], n[3]]);
                let d = n.wrapping_sub(c);
                let d8 = d as u8;
                if c.wrapping_add(i32::from(d8 as i8) as u32) != n {
                    return None;
                }
                out.push(d8);
            }
            DiffType::Diff32x16 => {
                let c = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                let n = u32::from_le_bytes([n[0], n[1], n[2], n[3]]);
                let d = n.wrapping_sub(c);
                #[allow(clippy::cast_possible_truncation)]
                let d16 = d as u16;
                if c.wrapping_add(i32::from(d16 as i16) as u32) != n {
                    return None;
                }
                out.extend_from_slice(&d16.to_le_bytes());
            }
        }
    }
    Some(out)
}

/// A single parsed TDF entry borrowing its payload from the source buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdfParsed<'a> {
    /// Entry timestamp in epoch ticks, 0 when the entry carried none.
    pub time: EpochTime,
    /// 12-bit TDF id.
    pub id: u16,
    /// Size of one full sample in bytes.
    pub len: u8,
    /// Entry layout.
    pub kind: TdfKind,
    /// Number of samples (1 for single entries; includes the diff base).
    pub num: u8,
    /// Tick spacing between samples, 0 for single and diff entries.
    pub period: u32,
    /// Raw payload bytes.
    pub data: &'a [u8],
}

impl TdfParsed<'_> {
    /// Reconstruct full-width sample `idx` of a diff array by applying
    /// `idx` diffs on top of the base sample.
    ///
    /// # Errors
    ///
    /// [`TdfError::InvalidArgument`] when the entry is not a diff array or
    /// `idx` is out of range.
    pub fn reconstruct(&self, idx: u8) -> Result<Vec<u8>, TdfError> {
        let TdfKind::DiffArray(dt) = self.kind else {
            return Err(TdfError::InvalidArgument);
        };
        if idx >= self.num {
            return Err(TdfError::InvalidArgument);
        }
        let sample_len = usize::from(self.len);
        let fields = sample_len / dt.field_width();
        let diff_len = fields * dt.diff_width();
        let mut out = Vec::with_capacity(sample_len);
        for field in 0..fields {
            let base = &self.data[field * dt.field_width()..];
            match dt {
                DiffType::Diff16x8 => {
                    let mut val = u16::from_le_bytes([base[0], base[1]]);
                    for step in 0..usize::from(idx) {
                        let d = self.data[sample_len + step * diff_len + field] as i8;
                        val = val.wrapping_add(i16::from(d) as u16);
                    }
                    out.extend_from_slice(&val.to_le_bytes());
                }
                DiffType::Diff32x8 => {
                    let mut val = u32::from_le_bytes([base[0], base[1], base[2], base[3]]);
                    for step in 0..usize::from(idx) {
                        let d = self.data[sample_len + step * diff_len + field] as i8;
                        val = val.wrapping_add(i32::from(d) as u32);
                    }
                    out.extend_from_slice(&val.to_le_bytes());
                }
                DiffType::Diff32x16 => {
                    let mut val = u32::from_le_bytes([base[0], base[1], base[2], base[3]]);
                    for step in 0..usize::from(idx) {
                        let off = sample_len + step * diff_len + field * 2;
                        let d = i16::from_le_bytes([self.data[off], self.data[off + 1]]);
                        val = val.wrapping_add(i32::from(d) as u32);
                    }
                    out.extend_from_slice(&val.to_le_bytes());
                }
            }
        }
        Ok(out)
    }
}

/// Streaming parser over an encoded TDF buffer.
///
/// Parsing mirrors encoding: the parser carries its own timestamp cursor
/// so relative entries resolve to absolute times.
#[derive(Debug)]
pub struct TdfParser<'a> {
    time: EpochTime,
    data: &'a [u8],
}

impl<'a> TdfParser<'a> {
    /// Begin parsing `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { time: 0, data }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], TdfError> {
        if self.data.len() < len {
            return Err(TdfError::Malformed);
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    /// Parse the next entry.
    ///
    /// # Errors
    ///
    /// [`TdfError::NoMoreEntries`] once the buffer is consumed,
    /// [`TdfError::Malformed`] on reserved ids, truncated entries, or a
    /// relative timestamp with no prior absolute reference.
    #[allow(clippy::missing_panics_doc)]
    pub fn next_entry(&mut self) -> Result<TdfParsed<'a>, TdfError> {
        if self.data.len() <= ENTRY_HEADER_LEN {
            return Err(TdfError::NoMoreEntries);
        }
        let header = self.take(ENTRY_HEADER_LEN).expect("length checked above");
        let id_flags = u16::from_le_bytes([header[0], header[1]]);
        let len = header[2];
        let id = id_flags & ID_MASK;
        if id == 0 || id > TDF_ID_MAX || len == 0 {
            return Err(TdfError::Malformed);
        }

        let time = match id_flags & TIMESTAMP_MASK {
            TIMESTAMP_ABSOLUTE => {
                let raw = self.take(TIME_ABSOLUTE_LEN)?;
                let secs = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                let subsec = u16::from_le_bytes([raw[4], raw[5]]);
                self.time = epoch::from_parts(secs, subsec);
                self.time
            }
            TIMESTAMP_RELATIVE => {
                let raw = self.take(TIME_RELATIVE_LEN)?;
                if self.time == 0 {
                    return Err(TdfError::Malformed);
                }
                let delta = u16::from_le_bytes([raw[0], raw[1]]);
                self.time = self.time.wrapping_add(u64::from(delta));
                self.time
            }
            TIMESTAMP_EXTENDED => {
                let raw = self.take(TIME_EXTENDED_LEN)?;
                if self.time == 0 {
                    return Err(TdfError::Malformed);
                }
                let delta = sign_extend_24(u32::from_le_bytes([raw[0], raw[1], raw[2], 0]));
                self.time = self.time.wrapping_add(i64::from(delta) as u64);
                self.time
            }
            _ => 0,
        };

        let (kind, num, period) = match id_flags & ARRAY_MASK {
            ARRAY_NONE => (TdfKind::Single, 1, 0),
            ARRAY_TIME => {
                let raw = self.take(TIME_ARRAY_HEADER_LEN)?;
                let num = raw[0];
                let raw_period = u16::from_le_bytes([raw[1], raw[2]]);
                let period = if raw_period & PERIOD_SCALED != 0 {
                    u32::from(raw_period & PERIOD_VAL_MASK) * PERIOD_SCALE_FACTOR
                } else {
                    u32::from(raw_period)
                };
                (TdfKind::TimeArray, num, period)
            }
            ARRAY_DIFF => {
                let raw = self.take(DIFF_ARRAY_HEADER_LEN)?;
                let dt = DiffType::from_u8(raw[1]).ok_or(TdfError::Malformed)?;
                (TdfKind::DiffArray(dt), raw[0], 0)
            }
            _ => return Err(TdfError::Malformed),
        };
        if num == 0 {
            return Err(TdfError::Malformed);
        }

        let sample_len = usize::from(len);
        let data_len = match kind {
            TdfKind::Single => sample_len,
            TdfKind::TimeArray => sample_len * usize::from(num),
            TdfKind::DiffArray(dt) => {
                if sample_len % dt.field_width() != 0 {
                    return Err(TdfError::Malformed);
                }
                let diff_len = (sample_len / dt.field_width()) * dt.diff_width();
                sample_len + (usize::from(num) - 1) * diff_len
            }
        };
        let data = self.take(data_len)?;

        Ok(TdfParsed {
            time,
            id,
            len,
            kind,
            num,
            period,
            data,
        })
    }

    /// Find the first entry with the given id, consuming the parser.
    ///
    /// # Errors
    ///
    /// [`TdfError::NoMoreEntries`] if the buffer is exhausted without a
    /// match; parse errors propagate.
    pub fn find(mut self, id: u16) -> Result<TdfParsed<'a>, TdfError> {
        loop {
            let parsed = self.next_entry()?;
            if parsed.id == id {
                return Ok(parsed);
            }
        }
    }
}

fn sign_extend_24(x: u32) -> i32 {
    let m = 1u32 << 23;
    (x ^ m).wrapping_sub(m) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_000_000_000;

    #[test]
    fn absolute_then_relative_then_extended() {
        let mut buf = TdfBuffer::new(64);

        // First entry: no cursor yet, absolute 6-byte timestamp.
        let n = buf
            .add(0x010, T0, &[0xAA, 0xBB, 0xCC, 0xDD])
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf.len(), 13);
        assert_eq!(&buf.as_bytes()[..3], &[0x10, 0x40, 0x04]);
        assert_eq!(buf.time(), T0);

        // Small positive delta: 2-byte relative.
        let n = buf.add(0x010, T0 + 500, &[1, 2, 3, 4]).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf.len(), 13 + 9);
        assert_eq!(&buf.as_bytes()[13..18], &[0x10, 0x80, 0x04, 0xF4, 0x01]);

        // Larger delta: 3-byte signed extended relative.
        let n = buf.add(0x010, T0 + 100_000, &[5, 6, 7, 8]).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf.len(), 13 + 9 + 10);
        // 100_000 - 500 = 99_500 = 0x0184AC
        assert_eq!(
            &buf.as_bytes()[22..28],
            &[0x10, 0xC0, 0x04, 0xAC, 0x84, 0x01]
        );

        // Everything parses back with resolved absolute times.
        let mut parser = TdfParser::new(buf.as_bytes());
        let a = parser.next_entry().unwrap();
        assert_eq!((a.id, a.time, a.data), (0x010, T0, &[0xAA, 0xBB, 0xCC, 0xDD][..]));
        let b = parser.next_entry().unwrap();
        assert_eq!(b.time, T0 + 500);
        let c = parser.next_entry().unwrap();
        assert_eq!(c.time, T0 + 100_000);
        assert_eq!(parser.next_entry(), Err(TdfError::NoMoreEntries));
    }

    #[test]
    fn negative_delta_uses_extended_relative() {
        let mut buf = TdfBuffer::new(64);
        buf.add(0x020, T0, &[0; 2]).unwrap();
        buf.add(0x020, T0 - 1000, &[0; 2]).unwrap();
        let mut parser = TdfParser::new(buf.as_bytes());
        parser.next_entry().unwrap();
        let second = parser.next_entry().unwrap();
        assert_eq!(second.time, T0 - 1000);
    }

    #[test]
    fn huge_delta_falls_back_to_absolute() {
        let mut buf = TdfBuffer::new(64);
        buf.add(0x020, T0, &[0; 2]).unwrap();
        let far = T0 + (1 << 40);
        buf.add(0x020, far, &[0; 2]).unwrap();
        let mut parser = TdfParser::new(buf.as_bytes());
        parser.next_entry().unwrap();
        assert_eq!(parser.next_entry().unwrap().time, far);
    }

    #[test]
    fn no_timestamp_entries() {
        let mut buf = TdfBuffer::new(32);
        buf.add(0x123, 0, &[9, 8]).unwrap();
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.time(), 0);
        let mut parser = TdfParser::new(buf.as_bytes());
        let parsed = parser.next_entry().unwrap();
        assert_eq!(parsed.time, 0);
        assert_eq!(parsed.kind, TdfKind::Single);
    }

    #[test]
    fn invalid_arguments_rejected() {
        let mut buf = TdfBuffer::new(64);
        assert_eq!(buf.add(0, T0, &[0; 4]), Err(TdfError::InvalidArgument));
        assert_eq!(buf.add(0xFFF, T0, &[0; 4]), Err(TdfError::InvalidArgument));
        assert_eq!(buf.add(0x10, T0, &[]), Err(TdfError::InvalidArgument));
        assert_eq!(
            buf.add_array(0x10, 4, 2, T0, PERIOD_MAX + 1, &[0; 8]),
            Err(TdfError::InvalidArgument)
        );
    }

    #[test]
    fn oversize_sample_never_fits() {
        let mut buf = TdfBuffer::new(16);
        assert_eq!(
            buf.add(0x10, T0, &[0; 12]),
            Err(TdfError::TooLarge { capacity: 16 })
        );
        // Without a timestamp the same payload fits.
        buf.add(0x10, 0, &[0; 12]).unwrap();
    }

    #[test]
    fn array_count_clamps_to_space() {
        // 3 header + 3 array header leaves 18 bytes: 4 samples of 4 fit.
        let mut buf = TdfBuffer::new(24);
        let data = [0u8; 40];
        let written = buf.add_array(0x10, 4, 10, 0, 100, &data).unwrap();
        assert_eq!(written, 4);
        let mut parser = TdfParser::new(buf.as_bytes());
        let parsed = parser.next_entry().unwrap();
        assert_eq!(parsed.num, 4);
        assert_eq!(parsed.period, 100);
    }

    #[test]
    fn array_degrades_to_single_by_reclaiming_header() {
        // header 3 + array header 3 leaves 3, no 4-byte sample fits;
        // reclaiming the array header leaves 6, one sample fits.
        let mut buf = TdfBuffer::new(9);
        let written = buf.add_array(0x10, 4, 4, 0, 10, &[0u8; 16]).unwrap();
        assert_eq!(written, 1);
        let mut parser = TdfParser::new(buf.as_bytes());
        let parsed = parser.next_entry().unwrap();
        assert_eq!(parsed.kind, TdfKind::Single);
        assert_eq!(parsed.num, 1);
    }

    #[test]
    fn full_buffer_reports_buffer_full() {
        let mut buf = TdfBuffer::new(16);
        buf.add(0x10, 0, &[0; 10]).unwrap();
        assert_eq!(buf.add(0x10, 0, &[0; 10]), Err(TdfError::BufferFull));
    }

    #[test]
    fn scaled_period_round_trips() {
        let mut buf = TdfBuffer::new(64);
        let period = 40_000; // above 0x7FFF, scaled by 8192
        buf.add_array(0x10, 2, 3, 0, period, &[0u8; 6]).unwrap();
        let parsed = TdfParser::new(buf.as_bytes()).next_entry().unwrap();
        // Scaling rounds down to a multiple of 8192.
        assert_eq!(parsed.period, (period / 8192) * 8192);
    }

    #[test]
    fn diff_array_encodes_and_reconstructs() {
        let mut buf = TdfBuffer::new(64);
        // base=1000, then +5, -3, +10
        let samples: Vec<u8> = [1000u16, 1005, 1002, 1012]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let written = buf
            .add_core(
                0x30,
                2,
                4,
                0,
                0,
                &samples,
                TdfFormat::DiffArray(DiffType::Diff16x8),
            )
            .unwrap();
        assert_eq!(written, 4);
        // header 3 + array header 2 + base 2 + 3 diffs
        assert_eq!(buf.len(), 10);

        let parsed = TdfParser::new(buf.as_bytes()).next_entry().unwrap();
        assert_eq!(parsed.kind, TdfKind::DiffArray(DiffType::Diff16x8));
        assert_eq!(parsed.num, 4);
        for (idx, expected) in [1000u16, 1005, 1002, 1012].iter().enumerate() {
            let sample = parsed.reconstruct(u8::try_from(idx).unwrap()).unwrap();
            assert_eq!(sample, expected.to_le_bytes());
        }
        assert_eq!(parsed.reconstruct(4), Err(TdfError::InvalidArgument));
    }

    #[test]
    fn diff_falls_back_to_time_array_when_deltas_too_large() {
        let mut buf = TdfBuffer::new(64);
        let samples: Vec<u8> = [1000u16, 5000, 9000, 13000]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        buf.add_core(
            0x30,
            2,
            4,
            0,
            10,
            &samples,
            TdfFormat::DiffArray(DiffType::Diff16x8),
        )
        .unwrap();
        let parsed = TdfParser::new(buf.as_bytes()).next_entry().unwrap();
        assert_eq!(parsed.kind, TdfKind::TimeArray);
        assert_eq!(parsed.num, 4);
    }

    #[test]
    fn diff_truncates_at_mid_array_jump() {
        let mut buf = TdfBuffer::new(64);
        // Diffs valid for the first three samples, then a jump.
        let samples: Vec<u8> = [1000u16, 1005, 1010, 30000, 30005]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let written = buf
            .add_core(
                0x30,
                2,
                5,
                0,
                0,
                &samples,
                TdfFormat::DiffArray(DiffType::Diff16x8),
            )
            .unwrap();
        assert_eq!(written, 3);
        let parsed = TdfParser::new(buf.as_bytes()).next_entry().unwrap();
        assert_eq!(parsed.num, 3);
        assert_eq!(parsed.reconstruct(2).unwrap(), 1010u16.to_le_bytes());
    }

    #[test]
    fn diff_32_16_multi_field() {
        let mut buf = TdfBuffer::new(64);
        // Two u32 fields per sample.
        let samples: Vec<u8> = [
            [100_000u32, 200_000],
            [100_300, 199_500],
            [100_600, 199_000],
        ]
        .iter()
        .flat_map(|s| s.iter().flat_map(|v| v.to_le_bytes()))
        .collect();
        let written = buf
            .add_core(
                0x31,
                8,
                3,
                0,
                0,
                &samples,
                TdfFormat::DiffArray(DiffType::Diff32x16),
            )
            .unwrap();
        assert_eq!(written, 3);
        let parsed = TdfParser::new(buf.as_bytes()).next_entry().unwrap();
        let s2 = parsed.reconstruct(2).unwrap();
        assert_eq!(&s2[..4], &100_600u32.to_le_bytes());
        assert_eq!(&s2[4..], &199_000u32.to_le_bytes());
    }

    #[test]
    fn precomputed_diff_passthrough() {
        let mut buf = TdfBuffer::new(64);
        let mut payload = Vec::new();
        payload.extend_from_slice(&1000u16.to_le_bytes());
        payload.extend_from_slice(&[5u8, 0xFDu8]); // +5, -3
        let written = buf
            .add_core(
                0x32,
                2,
                3,
                0,
                0,
                &payload,
                TdfFormat::DiffPrecomputed(DiffType::Diff16x8),
            )
            .unwrap();
        assert_eq!(written, 3);
        let parsed = TdfParser::new(buf.as_bytes()).next_entry().unwrap();
        assert_eq!(parsed.reconstruct(1).unwrap(), 1005u16.to_le_bytes());
        assert_eq!(parsed.reconstruct(2).unwrap(), 1002u16.to_le_bytes());
    }

    #[test]
    fn relative_without_reference_is_malformed() {
        // Hand-craft a relative entry with no preceding absolute.
        let bytes = [0x10, 0x80, 0x02, 0x10, 0x00, 0xAA, 0xBB];
        assert_eq!(
            TdfParser::new(&bytes).next_entry(),
            Err(TdfError::Malformed)
        );
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut buf = TdfBuffer::new(64);
        buf.add(0x10, 0, &[1, 2, 3, 4]).unwrap();
        let bytes = &buf.as_bytes()[..buf.len() - 1];
        assert_eq!(TdfParser::new(bytes).next_entry(), Err(TdfError::Malformed));
    }

    #[test]
    fn reserved_id_is_malformed() {
        let bytes = [0xFF, 0x0F, 0x01, 0xAA];
        assert_eq!(
            TdfParser::new(&bytes).next_entry(),
            Err(TdfError::Malformed)
        );
    }

    #[test]
    fn find_locates_entry_by_id() {
        let mut buf = TdfBuffer::new(64);
        buf.add(0x10, 0, &[1, 1]).unwrap();
        buf.add(0x20, 0, &[2, 2]).unwrap();
        buf.add(0x30, 0, &[3, 3]).unwrap();
        let found = TdfParser::new(buf.as_bytes()).find(0x20).unwrap();
        assert_eq!(found.data, &[2, 2]);
        assert_eq!(
            TdfParser::new(buf.as_bytes()).find(0x40),
            Err(TdfError::NoMoreEntries)
        );
    }

    #[test]
    fn reset_clears_cursor() {
        let mut buf = TdfBuffer::new(64);
        buf.add(0x10, T0, &[0; 4]).unwrap();
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.time(), 0);
        // Next add after reset is absolute again.
        buf.add(0x10, T0 + 10, &[0; 4]).unwrap();
        assert_eq!(buf.as_bytes()[1] & 0xC0, 0x40);
    }
}
