//! Named read results and consistency levels.

use std::collections::BTreeMap;
use std::fmt;

use bytes::BufMut;

use crate::codec::Reader;
use crate::error::TxnError;
use crate::partition::FilteredPartition;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TxnDataKind {
    /// Bound by a user `LET` or `SELECT`.
    User,
    Returning,
    /// Existing row state fetched to complete reference operations.
    AutoRead,
    CasRead,
}

impl TxnDataKind {
    fn to_u8(self) -> u8 {
        match self {
            TxnDataKind::User => 0,
            TxnDataKind::Returning => 1,
            TxnDataKind::AutoRead => 2,
            TxnDataKind::CasRead => 3,
        }
    }

    fn from_u8(raw: u8) -> anyhow::Result<Self> {
        Ok(match raw {
            0 => TxnDataKind::User,
            1 => TxnDataKind::Returning,
            2 => TxnDataKind::AutoRead,
            3 => TxnDataKind::CasRead,
            other => return Err(TxnError::unknown("txn data kind", other).into()),
        })
    }
}

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Kind in the high byte, index in the low 24 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnDataName(u32);

impl TxnDataName {
    pub fn new(kind: TxnDataKind, index: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(index <= INDEX_MASK, "txn data index {index} exceeds 24 bits");
        Ok(Self((u32::from(kind.to_u8()) << INDEX_BITS) | index))
    }

    pub fn user(index: u32) -> Self {
        Self(index & INDEX_MASK)
    }

    pub fn cas_read() -> Self {
        Self(u32::from(TxnDataKind::CasRead.to_u8()) << INDEX_BITS)
    }

    pub fn auto_read(index: u32) -> Self {
        Self((u32::from(TxnDataKind::AutoRead.to_u8()) << INDEX_BITS) | (index & INDEX_MASK))
    }

    pub fn returning() -> Self {
        Self(u32::from(TxnDataKind::Returning.to_u8()) << INDEX_BITS)
    }

    pub fn from_u32(raw: u32) -> anyhow::Result<Self> {
        TxnDataKind::from_u8((raw >> INDEX_BITS) as u8)?;
        Ok(Self(raw))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn kind(self) -> TxnDataKind {
        // Constructors only admit known kinds.
        TxnDataKind::from_u8((self.0 >> INDEX_BITS) as u8).unwrap_or(TxnDataKind::User)
    }

    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }
}

impl fmt::Debug for TxnDataName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind(), self.index())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnDataValue {
    Key(FilteredPartition),
    /// Partitions of a range read, ordered by key.
    Range(Vec<FilteredPartition>),
}

impl TxnDataValue {
    fn merge(&self, other: &TxnDataValue) -> anyhow::Result<TxnDataValue> {
        match (self, other) {
            (TxnDataValue::Key(_), TxnDataValue::Key(_)) => Ok(self.clone()),
            (TxnDataValue::Range(left), TxnDataValue::Range(right)) => {
                let mut merged: BTreeMap<_, FilteredPartition> = BTreeMap::new();
                for partition in right.iter().chain(left.iter()) {
                    merged.insert(partition.key.clone(), partition.clone());
                }
                Ok(TxnDataValue::Range(merged.into_values().collect()))
            }
            _ => anyhow::bail!("cannot merge key and range results under one name"),
        }
    }
}

/// Results of a transaction's reads, keyed by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnData {
    entries: BTreeMap<TxnDataName, TxnDataValue>,
}

impl TxnData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(name: TxnDataName, value: TxnDataValue) -> Self {
        let mut data = Self::new();
        data.put(name, value);
        data
    }

    pub fn put(&mut self, name: TxnDataName, value: TxnDataValue) {
        self.entries.insert(name, value);
    }

    pub fn get(&self, name: TxnDataName) -> Option<&TxnDataValue> {
        self.entries.get(&name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Union of both result sets. Range results under one name are merged
    /// by partition key; for key results `self` wins.
    pub fn merge(mut self, other: TxnData) -> anyhow::Result<TxnData> {
        for (name, value) in other.entries {
            let merged = match self.entries.get(&name) {
                Some(existing) => existing.merge(&value)?,
                None => value,
            };
            self.entries.insert(name, merged);
        }
        Ok(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsistencyLevel {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
    NodeLocal,
}

const NULL_CONSISTENCY_LEVEL: u8 = 0xFF;

impl ConsistencyLevel {
    const ALL: [ConsistencyLevel; 12] = [
        ConsistencyLevel::Any,
        ConsistencyLevel::One,
        ConsistencyLevel::Two,
        ConsistencyLevel::Three,
        ConsistencyLevel::Quorum,
        ConsistencyLevel::All,
        ConsistencyLevel::LocalQuorum,
        ConsistencyLevel::EachQuorum,
        ConsistencyLevel::Serial,
        ConsistencyLevel::LocalSerial,
        ConsistencyLevel::LocalOne,
        ConsistencyLevel::NodeLocal,
    ];

    pub fn ordinal(self) -> u8 {
        Self::ALL
            .iter()
            .position(|cl| *cl == self)
            .map(|idx| idx as u8)
            .unwrap_or(NULL_CONSISTENCY_LEVEL)
    }

    pub fn from_ordinal(raw: u8) -> anyhow::Result<Self> {
        Self::ALL
            .get(usize::from(raw))
            .copied()
            .ok_or_else(|| TxnError::unknown("consistency level", raw).into())
    }

    pub fn is_serial(self) -> bool {
        matches!(self, ConsistencyLevel::Serial | ConsistencyLevel::LocalSerial)
    }
}

pub fn write_nullable_consistency_level(out: &mut Vec<u8>, cl: Option<ConsistencyLevel>) {
    out.put_u8(cl.map_or(NULL_CONSISTENCY_LEVEL, ConsistencyLevel::ordinal));
}

pub fn read_nullable_consistency_level(
    input: &mut Reader<'_>,
) -> anyhow::Result<Option<ConsistencyLevel>> {
    match input.read_u8()? {
        NULL_CONSISTENCY_LEVEL => Ok(None),
        raw => ConsistencyLevel::from_ordinal(raw).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PartitionKey;
    use crate::partition::Cell;
    use crate::schema::TableId;

    fn partition(key: &'static [u8], value: &'static [u8]) -> FilteredPartition {
        let mut partition = FilteredPartition::empty(PartitionKey::new(TableId(1), key));
        partition
            .static_row
            .cells
            .insert(0, Cell::live(value, 1));
        partition
    }

    #[test]
    fn names_pack_kind_and_index() {
        let name = TxnDataName::new(TxnDataKind::AutoRead, 17).expect("name");
        assert_eq!(name, TxnDataName::auto_read(17));
        assert_eq!(name.kind(), TxnDataKind::AutoRead);
        assert_eq!(name.index(), 17);
        assert_eq!(TxnDataName::from_u32(name.as_u32()).expect("raw"), name);
        assert!(TxnDataName::from_u32(0x7F00_0000).is_err());
        assert!(TxnDataName::user(1) < TxnDataName::cas_read());
    }

    #[test]
    fn merge_unions_range_results_by_key() {
        let name = TxnDataName::user(0);
        let left = TxnData::of(
            name,
            TxnDataValue::Range(vec![partition(b"a", b"1"), partition(b"c", b"3")]),
        );
        let right = TxnData::of(
            name,
            TxnDataValue::Range(vec![partition(b"b", b"2"), partition(b"c", b"x")]),
        );
        let merged = left.merge(right).expect("merge");
        let Some(TxnDataValue::Range(parts)) = merged.get(name) else {
            panic!("expected range result");
        };
        let keys: Vec<_> = parts.iter().map(|p| p.key.key.clone()).collect();
        assert_eq!(keys, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert_eq!(parts[2], partition(b"c", b"3"));
    }

    #[test]
    fn consistency_level_null_byte() {
        let mut out = Vec::new();
        write_nullable_consistency_level(&mut out, None);
        write_nullable_consistency_level(&mut out, Some(ConsistencyLevel::Serial));
        assert_eq!(out, vec![0xFF, 8]);
        let mut reader = Reader::new(&out);
        assert_eq!(read_nullable_consistency_level(&mut reader).expect("null"), None);
        assert_eq!(
            read_nullable_consistency_level(&mut reader).expect("serial"),
            Some(ConsistencyLevel::Serial)
        );
        assert!(ConsistencyLevel::from_ordinal(40).is_err());
    }
}
