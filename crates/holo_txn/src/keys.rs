//! Keys, ranges and the sets built from them.
//!
//! Routing is byte ordered: a partition key routes to `Token(bytes)` inside
//! its table, and every table's token space is bracketed by `Min` and `Max`.
//! Ranges are start-exclusive and end-inclusive, so `(a, b]` and `(b, c]`
//! touch without overlapping.

use std::cmp::Ordering;
use std::fmt;

use bytes::{BufMut, Bytes};

use crate::codec::{write_bytes_with_vint_length, write_unsigned_vint, Reader, Version, WireFormat};
use crate::error::TxnError;
use crate::schema::{TableId, TableMetadatas};

/// Position of a routing key within its table's token space.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoutingPosition {
    Min,
    Token(Bytes),
    Max,
}

impl RoutingPosition {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RoutingPosition::Min => out.put_u8(0),
            RoutingPosition::Token(token) => {
                out.put_u8(1);
                write_bytes_with_vint_length(out, token);
            }
            RoutingPosition::Max => out.put_u8(2),
        }
    }

    fn decode(input: &mut Reader<'_>) -> anyhow::Result<Self> {
        Ok(match input.read_u8()? {
            0 => RoutingPosition::Min,
            1 => RoutingPosition::Token(input.read_bytes_with_vint_length()?),
            2 => RoutingPosition::Max,
            other => return Err(TxnError::unknown("routing position", other).into()),
        })
    }
}

/// Where a key or range bound routes: a table plus a position in it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutingKey {
    pub table: TableId,
    pub position: RoutingPosition,
}

impl RoutingKey {
    /// Lowest position in `table`, below every token.
    pub fn min(table: TableId) -> Self {
        Self {
            table,
            position: RoutingPosition::Min,
        }
    }

    /// Highest position in `table`, above every token.
    pub fn max(table: TableId) -> Self {
        Self {
            table,
            position: RoutingPosition::Max,
        }
    }

    pub fn token(table: TableId, token: impl Into<Bytes>) -> Self {
        Self {
            table,
            position: RoutingPosition::Token(token.into()),
        }
    }

    /// Routing form: the raw table id followed by the position.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u64(self.table.0);
        self.position.encode(out);
    }

    /// Inverse of [`RoutingKey::encode`].
    pub fn decode(input: &mut Reader<'_>) -> anyhow::Result<Self> {
        let table = TableId(input.read_u64()?);
        let position = RoutingPosition::decode(input)?;
        Ok(Self { table, position })
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.position {
            RoutingPosition::Min => write!(f, "{}:-inf", self.table),
            RoutingPosition::Token(token) => {
                write!(f, "{}:", self.table)?;
                write_hex(f, token)
            }
            RoutingPosition::Max => write!(f, "{}:+inf", self.table),
        }
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, raw: &[u8]) -> fmt::Result {
    for byte in raw {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

/// A single partition, identified by table and key bytes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub table: TableId,
    pub key: Bytes,
}

impl PartitionKey {
    /// Key bytes are kept as given; routing uses them unchanged as the token.
    pub fn new(table: TableId, key: impl Into<Bytes>) -> Self {
        Self {
            table,
            key: key.into(),
        }
    }

    /// The routing key this partition maps to.
    pub fn routing(&self) -> RoutingKey {
        RoutingKey::token(self.table, self.key.clone())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.table)?;
        write_hex(f, &self.key)
    }
}

impl WireFormat for PartitionKey {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, _: Version) -> anyhow::Result<()> {
        tables.serialize_table(self.table, out)?;
        write_bytes_with_vint_length(out, &self.key);
        Ok(())
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, _: Version) -> anyhow::Result<Self> {
        let table = tables.deserialize_table(input)?.id;
        let key = input.read_bytes_with_vint_length()?;
        Ok(Self { table, key })
    }
}

/// `(start, end]` over routing keys of one table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRange {
    start: RoutingKey,
    end: RoutingKey,
}

impl KeyRange {
    /// Fails when the bounds name different tables or the range would be empty.
    pub fn new(start: RoutingKey, end: RoutingKey) -> anyhow::Result<Self> {
        anyhow::ensure!(
            start.table == end.table,
            "range bounds span tables {} and {}",
            start.table,
            end.table
        );
        anyhow::ensure!(start < end, "empty range ({start}, {end}]");
        Ok(Self { start, end })
    }

    /// Every key of `table`, from `Min` to `Max`.
    pub fn full(table: TableId) -> Self {
        Self {
            start: RoutingKey::min(table),
            end: RoutingKey::max(table),
        }
    }

    pub fn start(&self) -> &RoutingKey {
        &self.start
    }

    pub fn end(&self) -> &RoutingKey {
        &self.end
    }

    pub fn table(&self) -> TableId {
        self.start.table
    }

    /// Start-exclusive, end-inclusive membership.
    pub fn contains(&self, key: &RoutingKey) -> bool {
        &self.start < key && key <= &self.end
    }

    /// True when `other` lies entirely within `self`.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// True when `self` ends exactly where `other` starts, or vice versa.
    pub fn touches(&self, other: &KeyRange) -> bool {
        self.end == other.start || other.end == self.start
    }

    /// True when the ranges share at least one key; touching ranges do not.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The shared part of both ranges, if any.
    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        let start = std::cmp::max(&self.start, &other.start).clone();
        let end = std::cmp::min(&self.end, &other.end).clone();
        (start < end).then_some(KeyRange { start, end })
    }

    /// Smallest range covering both; callers check that they touch or overlap.
    pub fn union(&self, other: &KeyRange) -> KeyRange {
        KeyRange {
            start: std::cmp::min(&self.start, &other.start).clone(),
            end: std::cmp::max(&self.end, &other.end).clone(),
        }
    }

    /// Routing form of both bounds, independent of any table registry.
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.start.encode(out);
        self.end.encode(out);
    }

    /// Inverse of [`KeyRange::encode`], revalidating the bounds.
    pub fn decode(input: &mut Reader<'_>) -> anyhow::Result<Self> {
        let start = RoutingKey::decode(input)?;
        let end = RoutingKey::decode(input)?;
        Self::new(start, end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.start, self.end)
    }
}

impl WireFormat for KeyRange {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, _: Version) -> anyhow::Result<()> {
        tables.serialize_table(self.table(), out)?;
        self.start.position.encode(out);
        self.end.position.encode(out);
        Ok(())
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, _: Version) -> anyhow::Result<Self> {
        let table = tables.deserialize_table(input)?.id;
        let start = RoutingPosition::decode(input)?;
        let end = RoutingPosition::decode(input)?;
        Self::new(
            RoutingKey {
                table,
                position: start,
            },
            RoutingKey {
                table,
                position: end,
            },
        )
    }
}

/// Whether a transaction addresses single partitions or key ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    Key,
    Range,
}

/// Something a read can be pointed at: one partition or a range of them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Seekable {
    Key(PartitionKey),
    Range(KeyRange),
}

impl Seekable {
    pub fn domain(&self) -> Domain {
        match self {
            Seekable::Key(_) => Domain::Key,
            Seekable::Range(_) => Domain::Range,
        }
    }

    pub fn as_key(&self) -> Option<&PartitionKey> {
        match self {
            Seekable::Key(key) => Some(key),
            Seekable::Range(_) => None,
        }
    }

    pub fn as_range(&self) -> Option<&KeyRange> {
        match self {
            Seekable::Range(range) => Some(range),
            Seekable::Key(_) => None,
        }
    }
}

impl fmt::Display for Seekable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seekable::Key(key) => key.fmt(f),
            Seekable::Range(range) => range.fmt(f),
        }
    }
}

impl WireFormat for Seekable {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        match self {
            Seekable::Key(key) => {
                out.put_u8(0);
                key.serialize(tables, out, version)
            }
            Seekable::Range(range) => {
                out.put_u8(1);
                range.serialize(tables, out, version)
            }
        }
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        match input.read_u8()? {
            0 => Ok(Seekable::Key(PartitionKey::deserialize(tables, input, version)?)),
            1 => Ok(Seekable::Range(KeyRange::deserialize(tables, input, version)?)),
            other => Err(TxnError::unknown("seekable domain", other).into()),
        }
    }
}

/// Sorted, unique partition keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Keys(Vec<PartitionKey>);

impl Keys {
    /// Sorts and de-duplicates `keys`.
    pub fn of(mut keys: Vec<PartitionKey>) -> Self {
        keys.sort();
        keys.dedup();
        Self(keys)
    }

    pub fn as_slice(&self) -> &[PartitionKey] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PartitionKey> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Binary search; `self` is always sorted.
    pub fn contains(&self, key: &PartitionKey) -> bool {
        self.0.binary_search(key).is_ok()
    }

    /// Keys whose routing key falls inside `ranges`.
    pub fn slice(&self, ranges: &Ranges) -> Keys {
        Keys(
            self.0
                .iter()
                .filter(|key| ranges.contains(&key.routing()))
                .cloned()
                .collect(),
        )
    }

    /// Keys the participants are responsible for.
    pub fn intersecting(&self, participants: &Participants) -> Keys {
        Keys(
            self.0
                .iter()
                .filter(|key| participants.contains_key(&key.routing()))
                .cloned()
                .collect(),
        )
    }

    /// Sorted union of both key sets.
    pub fn union(&self, other: &Keys) -> Keys {
        let mut out = Vec::with_capacity(self.len() + other.len());
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                Ordering::Less => {
                    out.push(self.0[i].clone());
                    i += 1;
                }
                Ordering::Greater => {
                    out.push(other.0[j].clone());
                    j += 1;
                }
                Ordering::Equal => {
                    out.push(self.0[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&self.0[i..]);
        out.extend_from_slice(&other.0[j..]);
        Keys(out)
    }
}

impl WireFormat for Keys {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        crate::codec::serialize_list(&self.0, tables, out, version)
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        let keys: Vec<PartitionKey> = crate::codec::deserialize_list(tables, input, version)?;
        anyhow::ensure!(
            keys.windows(2).all(|w| w[0] < w[1]),
            "keys on the wire are not strictly sorted"
        );
        Ok(Keys(keys))
    }
}

/// Sorted, non-overlapping ranges; touching ranges are coalesced.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Ranges(Vec<KeyRange>);

impl Ranges {
    /// Sorts `ranges` and coalesces any that overlap or touch.
    pub fn new(mut ranges: Vec<KeyRange>) -> Self {
        ranges.sort();
        let mut out: Vec<KeyRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match out.last_mut() {
                Some(last) if last.overlaps(&range) || last.end == range.start => {
                    *last = last.union(&range);
                }
                _ => out.push(range),
            }
        }
        Self(out)
    }

    pub fn single(range: KeyRange) -> Self {
        Self(vec![range])
    }

    pub fn as_slice(&self) -> &[KeyRange] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KeyRange> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when some range contains `key`.
    pub fn contains(&self, key: &RoutingKey) -> bool {
        // First range whose end is at or after the key is the only candidate.
        let idx = self.0.partition_point(|range| range.end < *key);
        self.0.get(idx).is_some_and(|range| range.contains(key))
    }

    /// True when some range overlaps `range`.
    pub fn intersects(&self, range: &KeyRange) -> bool {
        let idx = self.0.partition_point(|r| r.end <= range.start);
        self.0.get(idx).is_some_and(|r| r.overlaps(range))
    }

    /// Clip every range to `bounds`.
    pub fn slice(&self, bounds: &Ranges) -> Ranges {
        let mut out = Vec::new();
        for range in &self.0 {
            for bound in &bounds.0 {
                if let Some(clipped) = range.intersection(bound) {
                    out.push(clipped);
                }
            }
        }
        Ranges(out)
    }

    /// Ranges that overlap the participants, unclipped.
    pub fn intersecting(&self, participants: &Participants) -> Ranges {
        Ranges(
            self.0
                .iter()
                .filter(|range| participants.intersects_range(range))
                .cloned()
                .collect(),
        )
    }

    /// Count followed by each range in routing form.
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_unsigned_vint(out, self.0.len() as u64);
        for range in &self.0 {
            range.encode(out);
        }
    }

    pub fn decode(input: &mut Reader<'_>) -> anyhow::Result<Self> {
        let count = input.read_length()?;
        anyhow::ensure!(count <= input.remaining(), "range count {count} exceeds input");
        let mut ranges = Vec::with_capacity(count);
        for _ in 0..count {
            ranges.push(KeyRange::decode(input)?);
        }
        Ok(Ranges::new(ranges))
    }
}

/// The keys or ranges an operation covers, in one domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seekables {
    Keys(Keys),
    Ranges(Vec<KeyRange>),
}

impl Seekables {
    /// An empty set in `domain`.
    pub fn empty(domain: Domain) -> Self {
        match domain {
            Domain::Key => Seekables::Keys(Keys::default()),
            Domain::Range => Seekables::Ranges(Vec::new()),
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Seekables::Keys(_) => Domain::Key,
            Seekables::Ranges(_) => Domain::Range,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Seekables::Keys(keys) => keys.len(),
            Seekables::Ranges(ranges) => ranges.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted, de-duplicated seekables of one domain.
    pub fn from_sorted(domain: Domain, items: impl IntoIterator<Item = Seekable>) -> anyhow::Result<Self> {
        let mut out = Seekables::empty(domain);
        for item in items {
            match (&mut out, item) {
                (Seekables::Keys(keys), Seekable::Key(key)) => {
                    if keys.0.last() != Some(&key) {
                        keys.0.push(key);
                    }
                }
                (Seekables::Ranges(ranges), Seekable::Range(range)) => {
                    if ranges.last() != Some(&range) {
                        ranges.push(range);
                    }
                }
                (_, item) => anyhow::bail!("{item} does not belong to the {domain:?} domain"),
            }
        }
        Ok(out)
    }

    /// The members as individual seekables, in order.
    pub fn to_vec(&self) -> Vec<Seekable> {
        match self {
            Seekables::Keys(keys) => keys.iter().cloned().map(Seekable::Key).collect(),
            Seekables::Ranges(ranges) => ranges.iter().cloned().map(Seekable::Range).collect(),
        }
    }

    /// The members of `self` that fall within `participants`, unclipped.
    pub fn intersecting(&self, participants: &Participants) -> Seekables {
        match self {
            Seekables::Keys(keys) => Seekables::Keys(keys.intersecting(participants)),
            Seekables::Ranges(ranges) => Seekables::Ranges(
                ranges
                    .iter()
                    .filter(|range| participants.intersects_range(range))
                    .cloned()
                    .collect(),
            ),
        }
    }
}

impl WireFormat for Seekables {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        match self {
            Seekables::Keys(keys) => {
                out.put_u8(0);
                keys.serialize(tables, out, version)
            }
            Seekables::Ranges(ranges) => {
                out.put_u8(1);
                crate::codec::serialize_list(ranges, tables, out, version)
            }
        }
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        match input.read_u8()? {
            0 => Ok(Seekables::Keys(Keys::deserialize(tables, input, version)?)),
            1 => Ok(Seekables::Ranges(crate::codec::deserialize_list(
                tables, input, version,
            )?)),
            other => Err(TxnError::unknown("seekables domain", other).into()),
        }
    }
}

/// What a replica is responsible for within one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Participants {
    Keys(Vec<RoutingKey>),
    Ranges(Ranges),
}

impl Participants {
    /// Sorts and de-duplicates `keys`.
    pub fn keys(mut keys: Vec<RoutingKey>) -> Self {
        keys.sort();
        keys.dedup();
        Participants::Keys(keys)
    }

    /// Coalesces `ranges` the way [`Ranges::new`] does.
    pub fn ranges(ranges: Vec<KeyRange>) -> Self {
        Participants::Ranges(Ranges::new(ranges))
    }

    pub fn domain(&self) -> Domain {
        match self {
            Participants::Keys(_) => Domain::Key,
            Participants::Ranges(_) => Domain::Range,
        }
    }

    /// True when the participants own `key`.
    pub fn contains_key(&self, key: &RoutingKey) -> bool {
        match self {
            Participants::Keys(keys) => keys.binary_search(key).is_ok(),
            Participants::Ranges(ranges) => ranges.contains(key),
        }
    }

    /// True when any owned key or range falls inside `range`.
    pub fn intersects_range(&self, range: &KeyRange) -> bool {
        match self {
            Participants::Keys(keys) => keys.iter().any(|key| range.contains(key)),
            Participants::Ranges(ranges) => ranges.intersects(range),
        }
    }

    /// Key seekables must be owned; range seekables need only intersect.
    pub fn contains(&self, seekable: &Seekable) -> bool {
        match seekable {
            Seekable::Key(key) => self.contains_key(&key.routing()),
            Seekable::Range(range) => self.intersects_range(range),
        }
    }

    /// Domain byte followed by routing keys or ranges; no registry needed.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Participants::Keys(keys) => {
                out.put_u8(0);
                write_unsigned_vint(out, keys.len() as u64);
                for key in keys {
                    key.encode(out);
                }
            }
            Participants::Ranges(ranges) => {
                out.put_u8(1);
                ranges.encode(out);
            }
        }
    }

    pub fn decode(input: &mut Reader<'_>) -> anyhow::Result<Self> {
        match input.read_u8()? {
            0 => {
                let count = input.read_length()?;
                anyhow::ensure!(count <= input.remaining(), "key count {count} exceeds input");
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(RoutingKey::decode(input)?);
                }
                Ok(Participants::keys(keys))
            }
            1 => Ok(Participants::Ranges(Ranges::decode(input)?)),
            other => Err(TxnError::unknown("participants domain", other).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: TableId = TableId(1);

    fn range(a: &'static [u8], b: &'static [u8]) -> KeyRange {
        KeyRange::new(RoutingKey::token(T, a), RoutingKey::token(T, b)).expect("range")
    }

    #[test]
    fn ranges_are_start_exclusive_end_inclusive() {
        let r = range(b"b", b"d");
        assert!(!r.contains(&RoutingKey::token(T, &b"b"[..])));
        assert!(r.contains(&RoutingKey::token(T, &b"c"[..])));
        assert!(r.contains(&RoutingKey::token(T, &b"d"[..])));
        assert!(KeyRange::new(RoutingKey::token(T, &b"d"[..]), RoutingKey::token(T, &b"d"[..])).is_err());
    }

    #[test]
    fn touching_ranges_coalesce() {
        let ranges = Ranges::new(vec![range(b"d", b"f"), range(b"a", b"b"), range(b"b", b"d")]);
        assert_eq!(ranges.as_slice(), &[range(b"a", b"f")]);
        let separate = Ranges::new(vec![range(b"a", b"b"), range(b"c", b"d")]);
        assert_eq!(separate.len(), 2);
        assert!(!separate.contains(&RoutingKey::token(T, &b"bb"[..])));
        assert!(separate.intersects(&range(b"bb", b"cc")));
    }

    #[test]
    fn keys_slice_and_intersect() {
        let keys = Keys::of(vec![
            PartitionKey::new(T, &b"k3"[..]),
            PartitionKey::new(T, &b"k1"[..]),
            PartitionKey::new(T, &b"k2"[..]),
            PartitionKey::new(T, &b"k1"[..]),
        ]);
        assert_eq!(keys.len(), 3);
        let sliced = keys.slice(&Ranges::single(range(b"k1", b"k3")));
        assert_eq!(
            sliced.as_slice(),
            &[PartitionKey::new(T, &b"k2"[..]), PartitionKey::new(T, &b"k3"[..])]
        );
        let participants = Participants::keys(vec![PartitionKey::new(T, &b"k1"[..]).routing()]);
        assert_eq!(keys.intersecting(&participants).len(), 1);
    }

    #[test]
    fn participants_round_trip() {
        let participants = Participants::ranges(vec![KeyRange::full(TableId(4)), range(b"a", b"z")]);
        let mut out = Vec::new();
        participants.encode(&mut out);
        let decoded = Participants::decode(&mut Reader::new(&out)).expect("decode");
        assert_eq!(decoded, participants);
    }
}
