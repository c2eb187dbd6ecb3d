//! Wire primitives shared by every serializer in the crate.
//!
//! Output goes into a `Vec<u8>` through `bytes::BufMut`; input is consumed
//! through `Reader`, a bounds-checked cursor that reports short buffers as
//! `TxnError::Truncated` instead of panicking.

use bytes::{BufMut, Bytes};

use crate::error::TxnError;

/// Protocol version threaded through every serialize/deserialize call.
///
/// V1 stores cell timestamps inside partition updates as fixed 8-byte
/// integers; V2 stores them as zig-zag varint deltas from the partition
/// minimum. All other layouts are shared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V1,
    V2,
}

impl Version {
    pub const LATEST: Version = Version::V2;

    pub fn as_u8(self) -> u8 {
        match self {
            Version::V1 => 1,
            Version::V2 => 2,
        }
    }

    pub fn from_u8(raw: u8) -> anyhow::Result<Self> {
        match raw {
            1 => Ok(Version::V1),
            2 => Ok(Version::V2),
            other => Err(TxnError::UnsupportedVersion(other).into()),
        }
    }
}

/// A value with a versioned binary layout that depends on some context
/// (typically the table registry of the enclosing message).
pub trait WireFormat: Sized {
    type Context: ?Sized;

    fn serialize(&self, ctx: &Self::Context, out: &mut Vec<u8>, version: Version)
        -> anyhow::Result<()>;

    fn deserialize(ctx: &Self::Context, input: &mut Reader<'_>, version: Version)
        -> anyhow::Result<Self>;

    fn serialized_size(&self, ctx: &Self::Context, version: Version) -> anyhow::Result<usize> {
        let mut out = Vec::new();
        self.serialize(ctx, &mut out, version)?;
        Ok(out.len())
    }

    fn to_bytes(&self, ctx: &Self::Context, version: Version) -> anyhow::Result<Bytes> {
        let mut out = Vec::new();
        self.serialize(ctx, &mut out, version)?;
        Ok(Bytes::from(out))
    }

    /// Decode a complete buffer, rejecting trailing garbage.
    fn from_bytes(ctx: &Self::Context, bytes: &[u8], version: Version) -> anyhow::Result<Self> {
        let mut reader = Reader::new(bytes);
        let value = Self::deserialize(ctx, &mut reader, version)?;
        anyhow::ensure!(
            reader.is_empty(),
            "{} trailing bytes after value",
            reader.remaining()
        );
        Ok(value)
    }
}

/// Bounds-checked cursor over an input buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    fn take(&mut self, len: usize, what: &'static str) -> anyhow::Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(TxnError::Truncated { what }.into());
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(TxnError::unknown("boolean", other).into()),
        }
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2, "u16")?);
        Ok(u16::from_be_bytes(buf))
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4, "u32")?);
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8, "u64")?);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn read_i64(&mut self) -> anyhow::Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read `len` bytes as a big-endian unsigned integer (`len <= 8`).
    pub fn read_uint_be(&mut self, len: usize) -> anyhow::Result<u64> {
        debug_assert!(len <= 8);
        let raw = self.take(len, "fixed-width integer")?;
        Ok(raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    pub fn read_slice(&mut self, len: usize) -> anyhow::Result<&'a [u8]> {
        self.take(len, "byte slice")
    }

    pub fn read_unsigned_vint(&mut self) -> anyhow::Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self
                .take(1, "varint")
                .map(|b| b[0])?;
            anyhow::ensure!(shift < 64, "varint longer than 64 bits");
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_unsigned_vint32(&mut self) -> anyhow::Result<u32> {
        let value = self.read_unsigned_vint()?;
        u32::try_from(value).map_err(|_| anyhow::anyhow!("varint {value} exceeds u32"))
    }

    pub fn read_vint(&mut self) -> anyhow::Result<i64> {
        Ok(zigzag_decode(self.read_unsigned_vint()?))
    }

    /// Read a length, bounding it by the bytes actually left in the input.
    pub fn read_length(&mut self) -> anyhow::Result<usize> {
        let len = self.read_unsigned_vint()?;
        let len = usize::try_from(len).map_err(|_| anyhow::anyhow!("length {len} overflows"))?;
        Ok(len)
    }

    pub fn read_bytes_with_vint_length(&mut self) -> anyhow::Result<Bytes> {
        let len = self.read_length()?;
        Ok(Bytes::copy_from_slice(self.take(len, "length-prefixed bytes")?))
    }

    pub fn read_nullable_bytes(&mut self) -> anyhow::Result<Option<Bytes>> {
        if self.read_bool()? {
            Ok(Some(self.read_bytes_with_vint_length()?))
        } else {
            Ok(None)
        }
    }

    pub fn read_string(&mut self) -> anyhow::Result<String> {
        let raw = self.read_bytes_with_vint_length()?;
        String::from_utf8(raw.to_vec()).map_err(|err| anyhow::anyhow!("invalid utf-8: {err}"))
    }
}

pub fn write_unsigned_vint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

pub fn write_vint(out: &mut Vec<u8>, value: i64) {
    write_unsigned_vint(out, zigzag_encode(value));
}

pub fn unsigned_vint_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

pub fn write_bool(out: &mut Vec<u8>, value: bool) {
    out.put_u8(u8::from(value));
}

/// Write the low `len` bytes of `value`, most significant first.
pub fn write_uint_be(out: &mut Vec<u8>, value: u64, len: usize) {
    debug_assert!(len <= 8);
    let raw = value.to_be_bytes();
    out.put_slice(&raw[8 - len..]);
}

pub fn write_bytes_with_vint_length(out: &mut Vec<u8>, bytes: &[u8]) {
    write_unsigned_vint(out, bytes.len() as u64);
    out.put_slice(bytes);
}

pub fn write_nullable_bytes(out: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            write_bool(out, true);
            write_bytes_with_vint_length(out, bytes);
        }
        None => write_bool(out, false),
    }
}

pub fn write_string(out: &mut Vec<u8>, value: &str) {
    write_bytes_with_vint_length(out, value.as_bytes());
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Serialize a length-prefixed list of values sharing one context.
pub fn serialize_list<T: WireFormat>(
    items: &[T],
    ctx: &T::Context,
    out: &mut Vec<u8>,
    version: Version,
) -> anyhow::Result<()> {
    write_unsigned_vint(out, items.len() as u64);
    for item in items {
        item.serialize(ctx, out, version)?;
    }
    Ok(())
}

pub fn deserialize_list<T: WireFormat>(
    ctx: &T::Context,
    input: &mut Reader<'_>,
    version: Version,
) -> anyhow::Result<Vec<T>> {
    let count = input.read_length()?;
    // Every element costs at least one byte; refuse absurd counts up front.
    anyhow::ensure!(
        count <= input.remaining(),
        "list count {count} exceeds remaining input {}",
        input.remaining()
    );
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(T::deserialize(ctx, input, version)?);
    }
    Ok(out)
}
