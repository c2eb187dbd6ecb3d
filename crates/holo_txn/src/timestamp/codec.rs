//! Variable-width timestamp encodings.
//!
//! The single-item form is one encoding byte followed by the four fields
//! (epoch, hlc, flags, node), each written big-endian in the fewest bytes
//! that hold it, but never fewer than the field's minimum width. The
//! encoding byte stores `len - min` for each field:
//!
//! ```text
//!   bit  7    6 5     4 3    2       1 0
//!        0   epoch    hlc   flags    node
//! ```
//!
//! A set high bit marks a sentinel byte instead: `0x80` is null, and types
//! may claim further values for named constants (`Ballot` uses `0x81` for
//! `ZERO` and `0x82` for `MAX`).

use bytes::BufMut;

use crate::codec::{write_uint_be, write_unsigned_vint, Reader};
use crate::error::TxnError;

use super::types::{Timestamp, TxnId};

pub const NULL: u8 = 0x80;
pub const BALLOT_ZERO: u8 = 0x81;
pub const BALLOT_MAX: u8 = 0x82;
const SENTINEL_BIT: u8 = 0x80;

/// Upper bound on decoded array lengths.
const MAX_ARRAY_LEN: usize = 1 << 24;

struct Field {
    name: &'static str,
    min_len: u32,
    delta_bits: u32,
    shift: u32,
}

impl Field {
    fn mask(&self) -> u8 {
        ((1u32 << self.delta_bits) - 1) as u8
    }

    fn len(&self, value: u64) -> anyhow::Result<u32> {
        let len = self.min_len.max(byte_len(value));
        if len - self.min_len > u32::from(self.mask()) {
            return Err(TxnError::FieldOverflow {
                field: self.name,
                bits: len * 8,
            }
            .into());
        }
        Ok(len)
    }
}

const EPOCH: Field = Field {
    name: "epoch",
    min_len: 3,
    delta_bits: 2,
    shift: 5,
};
const HLC: Field = Field {
    name: "hlc",
    min_len: 5,
    delta_bits: 2,
    shift: 3,
};
const FLAGS: Field = Field {
    name: "flags",
    min_len: 1,
    delta_bits: 1,
    shift: 2,
};
const NODE: Field = Field {
    name: "node",
    min_len: 1,
    delta_bits: 2,
    shift: 0,
};

/// Wire order.
const FIELDS: [&Field; 4] = [&EPOCH, &HLC, &FLAGS, &NODE];

fn byte_len(value: u64) -> u32 {
    let bits = 64 - value.leading_zeros();
    bits.max(1).div_ceil(8)
}

fn values(ts: &Timestamp) -> [u64; 4] {
    [ts.epoch, ts.hlc, u64::from(ts.flags), u64::from(ts.node)]
}

fn from_values(values: [u64; 4]) -> anyhow::Result<Timestamp> {
    let [epoch, hlc, flags, node] = values;
    let flags = u16::try_from(flags).map_err(|_| TxnError::FieldOverflow {
        field: "flags",
        bits: 64 - flags.leading_zeros(),
    })?;
    let node = u32::try_from(node).map_err(|_| TxnError::FieldOverflow {
        field: "node",
        bits: 64 - node.leading_zeros(),
    })?;
    Timestamp::new(epoch, hlc, flags, node)
}

/// A timestamp-shaped value with optional single-byte special forms.
pub trait Encodable: Copy {
    fn timestamp(&self) -> Timestamp;

    fn from_timestamp(ts: Timestamp) -> anyhow::Result<Self>;

    fn encode_special(&self) -> Option<u8> {
        None
    }

    fn decode_special(_byte: u8) -> Option<Self> {
        None
    }
}

pub fn serialize<T: Encodable>(value: &T, out: &mut Vec<u8>) -> anyhow::Result<()> {
    if let Some(special) = value.encode_special() {
        out.put_u8(special);
        return Ok(());
    }
    let values = values(&value.timestamp());
    let mut lens = [0u32; 4];
    let mut encoding = 0u8;
    for (idx, field) in FIELDS.iter().enumerate() {
        lens[idx] = field.len(values[idx])?;
        encoding |= ((lens[idx] - field.min_len) as u8) << field.shift;
    }
    debug_assert_eq!(encoding & SENTINEL_BIT, 0);
    out.put_u8(encoding);
    for (value, len) in values.iter().zip(lens) {
        write_uint_be(out, *value, len as usize);
    }
    Ok(())
}

pub fn serialize_nullable<T: Encodable>(value: Option<&T>, out: &mut Vec<u8>) -> anyhow::Result<()> {
    match value {
        Some(value) => serialize(value, out),
        None => {
            out.put_u8(NULL);
            Ok(())
        }
    }
}

pub fn deserialize_nullable<T: Encodable>(input: &mut Reader<'_>) -> anyhow::Result<Option<T>> {
    let encoding = input.read_u8()?;
    if encoding & SENTINEL_BIT != 0 {
        if encoding == NULL {
            return Ok(None);
        }
        return T::decode_special(encoding)
            .map(Some)
            .ok_or_else(|| TxnError::unknown("timestamp sentinel", encoding).into());
    }
    let mut values = [0u64; 4];
    for (idx, field) in FIELDS.iter().enumerate() {
        let len = field.min_len + u32::from((encoding >> field.shift) & field.mask());
        values[idx] = input.read_uint_be(len as usize)?;
    }
    T::from_timestamp(from_values(values)?).map(Some)
}

pub fn deserialize<T: Encodable>(input: &mut Reader<'_>) -> anyhow::Result<T> {
    deserialize_nullable(input)?.ok_or_else(|| anyhow::anyhow!("unexpected null timestamp"))
}

pub fn serialized_size<T: Encodable>(value: &T) -> anyhow::Result<usize> {
    if value.encode_special().is_some() {
        return Ok(1);
    }
    let values = values(&value.timestamp());
    let mut size = 1;
    for (idx, field) in FIELDS.iter().enumerate() {
        size += field.len(values[idx])? as usize;
    }
    Ok(size)
}

const EXECUTE_AT_IS_TIMESTAMP: u64 = 0x1;
const EXECUTE_AT_HAS_UNIQUE_HLC: u64 = 0x2;
const EXECUTE_AT_HAS_EPOCH: u64 = 0x4;

/// Encodes `execute_at` relative to the txn id it was decided for.
///
/// When epoch, hlc and node match the id, the value is a single varint
/// holding the differing flag bits shifted left by one. Otherwise the varint
/// is `flags << 3 | HAS_EPOCH | IS_TIMESTAMP`, followed by `1 + epoch delta`
/// when the epochs differ, then the hlc delta and the node.
pub fn serialize_execute_at(txn_id: &TxnId, execute_at: &Timestamp, out: &mut Vec<u8>) -> anyhow::Result<()> {
    let base = txn_id.as_timestamp();
    if execute_at.epoch == base.epoch && execute_at.hlc == base.hlc && execute_at.node == base.node {
        write_unsigned_vint(out, u64::from(execute_at.flags ^ base.flags) << 1);
        return Ok(());
    }
    anyhow::ensure!(
        execute_at.epoch >= base.epoch && execute_at.hlc >= base.hlc,
        "execute at {execute_at} precedes txn id {txn_id}"
    );
    let mut flags = (u64::from(execute_at.flags) << 3) | EXECUTE_AT_IS_TIMESTAMP;
    if execute_at.epoch != base.epoch {
        flags |= EXECUTE_AT_HAS_EPOCH;
    }
    write_unsigned_vint(out, flags);
    if flags & EXECUTE_AT_HAS_EPOCH != 0 {
        write_unsigned_vint(out, 1 + execute_at.epoch - base.epoch);
    }
    write_unsigned_vint(out, execute_at.hlc - base.hlc);
    write_unsigned_vint(out, u64::from(execute_at.node));
    Ok(())
}

pub fn deserialize_execute_at(txn_id: &TxnId, input: &mut Reader<'_>) -> anyhow::Result<Timestamp> {
    let base = txn_id.as_timestamp();
    let flags = input.read_unsigned_vint()?;
    if flags & EXECUTE_AT_IS_TIMESTAMP == 0 {
        let diff = u16::try_from(flags >> 1).map_err(|_| TxnError::FieldOverflow {
            field: "flags",
            bits: 64 - (flags >> 1).leading_zeros(),
        })?;
        return Timestamp::new(base.epoch, base.hlc, base.flags ^ diff, base.node);
    }
    anyhow::ensure!(
        flags & EXECUTE_AT_HAS_UNIQUE_HLC == 0,
        "execute at {flags:#x} carries a distinct unique hlc"
    );
    let mut epoch = base.epoch;
    if flags & EXECUTE_AT_HAS_EPOCH != 0 {
        let delta = input.read_unsigned_vint()?;
        anyhow::ensure!(delta != 0, "execute at without a timestamp");
        epoch = epoch
            .checked_add(delta - 1)
            .ok_or_else(|| anyhow::anyhow!("execute at epoch delta {delta} overflows"))?;
    }
    let hlc = base
        .hlc
        .checked_add(input.read_unsigned_vint()?)
        .ok_or_else(|| anyhow::anyhow!("execute at hlc delta overflows"))?;
    let node = input.read_unsigned_vint32()?;
    let ts_flags = u16::try_from(flags >> 3).map_err(|_| TxnError::FieldOverflow {
        field: "flags",
        bits: 64 - (flags >> 3).leading_zeros(),
    })?;
    Timestamp::new(epoch, hlc, ts_flags, node)
}

/// Encoding whose byte-wise order matches timestamp order.
///
/// One zero bit, then each field as its length delta followed by its value
/// bits, as one MSB-first bitstream. The length deltas take seven bits in
/// total, so the stream always ends on a byte boundary. A longer minimal
/// length always means a larger value, so comparing the stream compares the
/// fields in order.
pub fn serialize_comparable(ts: &Timestamp, out: &mut Vec<u8>) -> anyhow::Result<()> {
    let values = values(ts);
    let mut writer = BitWriter::new(out);
    writer.write(0, 1);
    for (idx, field) in FIELDS.iter().enumerate() {
        let len = field.len(values[idx])?;
        writer.write(u64::from(len - field.min_len), field.delta_bits);
        writer.write(values[idx], len * 8);
    }
    writer.finish();
    Ok(())
}

pub fn deserialize_comparable(input: &mut Reader<'_>) -> anyhow::Result<Timestamp> {
    let mut reader = BitReader::new(input);
    anyhow::ensure!(reader.read(1)? == 0, "comparable timestamp has its leading bit set");
    let mut values = [0u64; 4];
    for (idx, field) in FIELDS.iter().enumerate() {
        let len = field.min_len + reader.read(field.delta_bits)? as u32;
        values[idx] = reader.read(len * 8)?;
    }
    from_values(values)
}

/// Columnar encoding of many timestamps.
///
/// Header: item count, the four field minimums (varints), then for each
/// field the bit width of the largest delta from its minimum (one byte).
/// Body: one packed MSB-first bitstream holding every item's epoch delta,
/// then every item's hlc delta, then flags, then node.
pub fn serialize_array<T: Encodable>(items: &[T], out: &mut Vec<u8>) -> anyhow::Result<()> {
    write_unsigned_vint(out, items.len() as u64);
    if items.is_empty() {
        return Ok(());
    }
    let rows: Vec<[u64; 4]> = items.iter().map(|item| values(&item.timestamp())).collect();
    let mut mins = [u64::MAX; 4];
    let mut maxs = [0u64; 4];
    for row in &rows {
        for idx in 0..4 {
            mins[idx] = mins[idx].min(row[idx]);
            maxs[idx] = maxs[idx].max(row[idx]);
        }
    }
    let widths: [u32; 4] = std::array::from_fn(|idx| 64 - (maxs[idx] - mins[idx]).leading_zeros());
    for min in mins {
        write_unsigned_vint(out, min);
    }
    for width in widths {
        out.put_u8(width as u8);
    }
    let mut writer = BitWriter::new(out);
    for idx in 0..4 {
        for row in &rows {
            writer.write(row[idx] - mins[idx], widths[idx]);
        }
    }
    writer.finish();
    Ok(())
}

pub fn deserialize_array<T: Encodable>(input: &mut Reader<'_>) -> anyhow::Result<Vec<T>> {
    let count = input.read_length()?;
    if count == 0 {
        return Ok(Vec::new());
    }
    anyhow::ensure!(count <= MAX_ARRAY_LEN, "timestamp array of {count} items");
    let mut mins = [0u64; 4];
    for min in mins.iter_mut() {
        *min = input.read_unsigned_vint()?;
    }
    let mut widths = [0u32; 4];
    for width in widths.iter_mut() {
        *width = u32::from(input.read_u8()?);
        anyhow::ensure!(*width <= 64, "field width {width} exceeds 64 bits");
    }
    let row_bits: usize = widths.iter().map(|w| *w as usize).sum();
    let body_len = (row_bits * count).div_ceil(8);
    if body_len > input.remaining() {
        return Err(TxnError::Truncated {
            what: "timestamp array",
        }
        .into());
    }
    let mut reader = BitReader::new(input);
    let mut rows = vec![[0u64; 4]; count];
    for idx in 0..4 {
        for row in rows.iter_mut() {
            let delta = reader.read(widths[idx])?;
            row[idx] = mins[idx]
                .checked_add(delta)
                .ok_or_else(|| anyhow::anyhow!("timestamp array field overflows u64"))?;
        }
    }
    rows.into_iter()
        .map(|row| T::from_timestamp(from_values(row)?))
        .collect()
}

fn low_bits(width: u32) -> u128 {
    if width == 0 {
        0
    } else {
        (1u128 << width) - 1
    }
}

/// MSB-first bit packer; never holds more than 7 pending bits between writes.
struct BitWriter<'a> {
    out: &'a mut Vec<u8>,
    acc: u128,
    bits: u32,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out, acc: 0, bits: 0 }
    }

    fn write(&mut self, value: u64, width: u32) {
        debug_assert!(width <= 64);
        if width == 0 {
            return;
        }
        self.acc = (self.acc << width) | (u128::from(value) & low_bits(width));
        self.bits += width;
        while self.bits >= 8 {
            self.bits -= 8;
            self.out.put_u8((self.acc >> self.bits) as u8);
        }
        self.acc &= low_bits(self.bits);
    }

    fn finish(self) {
        if self.bits > 0 {
            self.out.put_u8((self.acc << (8 - self.bits)) as u8);
        }
    }
}

/// Reads bytes from the underlying input only as bits are consumed; the
/// padding of a final partial byte is discarded.
struct BitReader<'r, 'a> {
    input: &'r mut Reader<'a>,
    acc: u128,
    bits: u32,
}

impl<'r, 'a> BitReader<'r, 'a> {
    fn new(input: &'r mut Reader<'a>) -> Self {
        Self {
            input,
            acc: 0,
            bits: 0,
        }
    }

    fn read(&mut self, width: u32) -> anyhow::Result<u64> {
        debug_assert!(width <= 64);
        while self.bits < width {
            self.acc = (self.acc << 8) | u128::from(self.input.read_u8()?);
            self.bits += 8;
        }
        self.bits -= width;
        let value = (self.acc >> self.bits) & low_bits(width);
        self.acc &= low_bits(self.bits);
        Ok(value as u64)
    }
}
