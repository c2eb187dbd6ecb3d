//! Table and column metadata, and the per-message table registry.
//!
//! Messages never carry full schemas. A `TableMetadatas` registry lists the
//! tables a message touches; inside the message a table is referenced by its
//! index in that registry, and the registry itself travels as a list of ids
//! that the receiver resolves against its local `Schema`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes};

use crate::codec::{write_unsigned_vint, Reader};
use crate::error::TxnError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub u64);

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Index of a column within its table.
pub type ColumnId = u16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    Int32,
    Int64,
    Double,
    Text,
    Ascii,
    Blob,
}

impl ColumnType {
    pub fn to_u8(self) -> u8 {
        match self {
            ColumnType::Boolean => 0,
            ColumnType::Int32 => 1,
            ColumnType::Int64 => 2,
            ColumnType::Double => 3,
            ColumnType::Text => 4,
            ColumnType::Ascii => 5,
            ColumnType::Blob => 6,
        }
    }

    pub fn from_u8(raw: u8) -> anyhow::Result<Self> {
        Ok(match raw {
            0 => ColumnType::Boolean,
            1 => ColumnType::Int32,
            2 => ColumnType::Int64,
            3 => ColumnType::Double,
            4 => ColumnType::Text,
            5 => ColumnType::Ascii,
            6 => ColumnType::Blob,
            other => return Err(TxnError::unknown("column type", other).into()),
        })
    }

    fn fixed_width(self) -> Option<usize> {
        match self {
            ColumnType::Boolean => Some(1),
            ColumnType::Int32 => Some(4),
            ColumnType::Int64 | ColumnType::Double => Some(8),
            ColumnType::Text | ColumnType::Ascii | ColumnType::Blob => None,
        }
    }

    pub fn validate(self, value: &[u8]) -> anyhow::Result<()> {
        if let Some(width) = self.fixed_width() {
            anyhow::ensure!(
                value.len() == width,
                "{self:?} value must be {width} bytes, got {}",
                value.len()
            );
        }
        match self {
            ColumnType::Text => {
                std::str::from_utf8(value).map_err(|err| anyhow::anyhow!("invalid text: {err}"))?;
            }
            ColumnType::Ascii => {
                anyhow::ensure!(value.is_ascii(), "non-ascii bytes in ascii value");
            }
            _ => {}
        }
        Ok(())
    }

    /// Compare two serialized values of this type.
    pub fn compare(self, left: &[u8], right: &[u8]) -> Ordering {
        match self {
            ColumnType::Int32 | ColumnType::Int64 => {
                match (decode_signed(left), decode_signed(right)) {
                    (Some(l), Some(r)) => l.cmp(&r),
                    _ => left.cmp(right),
                }
            }
            ColumnType::Double => match (decode_f64(left), decode_f64(right)) {
                (Some(l), Some(r)) => l.total_cmp(&r),
                _ => left.cmp(right),
            },
            ColumnType::Boolean | ColumnType::Text | ColumnType::Ascii | ColumnType::Blob => {
                left.cmp(right)
            }
        }
    }

    /// Convert a value of this type into the encoding of `receiver`.
    pub fn convert(self, value: Bytes, receiver: ColumnType) -> anyhow::Result<Bytes> {
        if self == receiver || receiver == ColumnType::Blob {
            return Ok(value);
        }
        match (self, receiver) {
            (ColumnType::Ascii, ColumnType::Text) => Ok(value),
            (ColumnType::Text, ColumnType::Ascii) => {
                ColumnType::Ascii.validate(&value)?;
                Ok(value)
            }
            (ColumnType::Int32, ColumnType::Int64) => {
                let v = decode_signed(&value)
                    .ok_or_else(|| anyhow::anyhow!("malformed int32 value"))?;
                Ok(Bytes::copy_from_slice(&v.to_be_bytes()))
            }
            (ColumnType::Int32 | ColumnType::Int64, ColumnType::Double) => {
                let v = decode_signed(&value)
                    .ok_or_else(|| anyhow::anyhow!("malformed integer value"))?;
                Ok(Bytes::copy_from_slice(&(v as f64).to_be_bytes()))
            }
            (from, to) => anyhow::bail!("cannot convert {from:?} into {to:?}"),
        }
    }

    /// `left + right` for numeric types, concatenation for strings/blobs.
    pub fn add(self, left: &[u8], right: &[u8]) -> anyhow::Result<Bytes> {
        match self {
            ColumnType::Int32 => {
                let (l, r) = (decode_i32(left)?, decode_i32(right)?);
                Ok(Bytes::copy_from_slice(&l.wrapping_add(r).to_be_bytes()))
            }
            ColumnType::Int64 => {
                let (l, r) = (decode_i64(left)?, decode_i64(right)?);
                Ok(Bytes::copy_from_slice(&l.wrapping_add(r).to_be_bytes()))
            }
            ColumnType::Double => {
                let (l, r) = (require_f64(left)?, require_f64(right)?);
                Ok(Bytes::copy_from_slice(&(l + r).to_be_bytes()))
            }
            ColumnType::Text | ColumnType::Ascii | ColumnType::Blob => {
                let mut out = Vec::with_capacity(left.len() + right.len());
                out.put_slice(left);
                out.put_slice(right);
                Ok(Bytes::from(out))
            }
            ColumnType::Boolean => anyhow::bail!("cannot add boolean values"),
        }
    }

    pub fn subtract(self, left: &[u8], right: &[u8]) -> anyhow::Result<Bytes> {
        match self {
            ColumnType::Int32 => {
                let (l, r) = (decode_i32(left)?, decode_i32(right)?);
                Ok(Bytes::copy_from_slice(&l.wrapping_sub(r).to_be_bytes()))
            }
            ColumnType::Int64 => {
                let (l, r) = (decode_i64(left)?, decode_i64(right)?);
                Ok(Bytes::copy_from_slice(&l.wrapping_sub(r).to_be_bytes()))
            }
            ColumnType::Double => {
                let (l, r) = (require_f64(left)?, require_f64(right)?);
                Ok(Bytes::copy_from_slice(&(l - r).to_be_bytes()))
            }
            other => anyhow::bail!("cannot subtract {other:?} values"),
        }
    }

    /// Additive identity used when a numeric target cell is absent.
    pub fn zero(self) -> Option<Bytes> {
        match self {
            ColumnType::Int32 => Some(Bytes::copy_from_slice(&0i32.to_be_bytes())),
            ColumnType::Int64 => Some(Bytes::copy_from_slice(&0i64.to_be_bytes())),
            ColumnType::Double => Some(Bytes::copy_from_slice(&0f64.to_be_bytes())),
            ColumnType::Text | ColumnType::Ascii | ColumnType::Blob => Some(Bytes::new()),
            ColumnType::Boolean => None,
        }
    }
}

fn decode_signed(raw: &[u8]) -> Option<i64> {
    match raw.len() {
        4 => Some(i64::from(i32::from_be_bytes(raw.try_into().ok()?))),
        8 => Some(i64::from_be_bytes(raw.try_into().ok()?)),
        _ => None,
    }
}

fn decode_f64(raw: &[u8]) -> Option<f64> {
    Some(f64::from_be_bytes(raw.try_into().ok()?))
}

fn decode_i32(raw: &[u8]) -> anyhow::Result<i32> {
    Ok(i32::from_be_bytes(raw.try_into().map_err(|_| {
        anyhow::anyhow!("int32 value must be 4 bytes, got {}", raw.len())
    })?))
}

fn decode_i64(raw: &[u8]) -> anyhow::Result<i64> {
    Ok(i64::from_be_bytes(raw.try_into().map_err(|_| {
        anyhow::anyhow!("int64 value must be 8 bytes, got {}", raw.len())
    })?))
}

fn require_f64(raw: &[u8]) -> anyhow::Result<f64> {
    decode_f64(raw).ok_or_else(|| anyhow::anyhow!("double value must be 8 bytes, got {}", raw.len()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    PartitionKey,
    Clustering,
    Static,
    Regular,
}

impl ColumnKind {
    fn to_u8(self) -> u8 {
        match self {
            ColumnKind::PartitionKey => 0,
            ColumnKind::Clustering => 1,
            ColumnKind::Static => 2,
            ColumnKind::Regular => 3,
        }
    }

    fn from_u8(raw: u8) -> anyhow::Result<Self> {
        Ok(match raw {
            0 => ColumnKind::PartitionKey,
            1 => ColumnKind::Clustering,
            2 => ColumnKind::Static,
            3 => ColumnKind::Regular,
            other => return Err(TxnError::unknown("column kind", other).into()),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub kind: ColumnKind,
    pub column_type: ColumnType,
    /// Component index for partition key and clustering columns.
    pub position: u16,
}

impl ColumnMetadata {
    pub fn is_static(&self) -> bool {
        self.kind == ColumnKind::Static
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableMetadata {
    pub id: TableId,
    pub keyspace: String,
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    pub fn column(&self, id: ColumnId) -> anyhow::Result<&ColumnMetadata> {
        self.columns
            .get(usize::from(id))
            .ok_or_else(|| anyhow::anyhow!("column {id} not found in {}.{}", self.keyspace, self.name))
    }

    pub fn column_id(&self, name: &str) -> Option<ColumnId> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|idx| ColumnId::try_from(idx).ok())
    }

    /// Full column definitions, used when persisting a schema snapshot.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u64(self.id.0);
        crate::codec::write_string(out, &self.keyspace);
        crate::codec::write_string(out, &self.name);
        write_unsigned_vint(out, self.columns.len() as u64);
        for column in &self.columns {
            crate::codec::write_string(out, &column.name);
            out.put_u8(column.kind.to_u8());
            out.put_u8(column.column_type.to_u8());
            out.put_u16(column.position);
        }
    }

    pub fn decode(input: &mut Reader<'_>) -> anyhow::Result<Self> {
        let id = TableId(input.read_u64()?);
        let keyspace = input.read_string()?;
        let name = input.read_string()?;
        let count = input.read_length()?;
        let mut columns = Vec::with_capacity(count.min(input.remaining()));
        for _ in 0..count {
            let name = input.read_string()?;
            let kind = ColumnKind::from_u8(input.read_u8()?)?;
            let column_type = ColumnType::from_u8(input.read_u8()?)?;
            let position = input.read_u16()?;
            columns.push(ColumnMetadata {
                name,
                kind,
                column_type,
                position,
            });
        }
        Ok(Self {
            id,
            keyspace,
            name,
            columns,
        })
    }
}

/// Node-local catalog used to resolve table ids received on the wire.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    tables: BTreeMap<TableId, Arc<TableMetadata>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, table: TableMetadata) -> Arc<TableMetadata> {
        let table = Arc::new(table);
        self.tables.insert(table.id, Arc::clone(&table));
        table
    }

    pub fn get(&self, id: TableId) -> Option<&Arc<TableMetadata>> {
        self.tables.get(&id)
    }
}

/// Sorted, de-duplicated set of tables referenced by one message.
#[derive(Clone)]
pub struct TableMetadatas {
    tables: Arc<[Arc<TableMetadata>]>,
}

impl TableMetadatas {
    pub fn none() -> Self {
        Self {
            tables: Arc::from(Vec::new()),
        }
    }

    pub fn of(table: Arc<TableMetadata>) -> Self {
        Self {
            tables: Arc::from(vec![table]),
        }
    }

    pub fn of_sorted_unique(tables: Vec<Arc<TableMetadata>>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            tables.windows(2).all(|w| w[0].id < w[1].id),
            "table registry must be strictly ordered by id"
        );
        Ok(Self {
            tables: Arc::from(tables),
        })
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TableMetadata>> {
        self.tables.iter()
    }

    pub fn index_of(&self, id: TableId) -> Option<usize> {
        self.tables.binary_search_by(|t| t.id.cmp(&id)).ok()
    }

    pub fn get(&self, id: TableId) -> anyhow::Result<&Arc<TableMetadata>> {
        self.index_of(id)
            .map(|idx| &self.tables[idx])
            .ok_or_else(|| anyhow::anyhow!("table {id} not present in registry {self:?}"))
    }

    /// Write a reference to `id`; a single-table registry needs no bytes.
    pub fn serialize_table(&self, id: TableId, out: &mut Vec<u8>) -> anyhow::Result<()> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| anyhow::anyhow!("table {id} not present in registry {self:?}"))?;
        if self.tables.len() != 1 {
            write_unsigned_vint(out, idx as u64);
        }
        Ok(())
    }

    pub fn deserialize_table(&self, input: &mut Reader<'_>) -> anyhow::Result<Arc<TableMetadata>> {
        let idx = if self.tables.len() == 1 {
            0
        } else {
            input.read_length()?
        };
        self.tables
            .get(idx)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("table index {idx} outside registry of {}", self.len()))
    }

    pub fn table_serialized_size(&self, id: TableId) -> usize {
        match self.index_of(id) {
            Some(_) if self.tables.len() == 1 => 0,
            Some(idx) => crate::codec::unsigned_vint_size(idx as u64),
            None => 0,
        }
    }

    pub fn serialize_self(&self, out: &mut Vec<u8>) {
        write_unsigned_vint(out, self.tables.len() as u64);
        for table in self.tables.iter() {
            out.put_u64(table.id.0);
        }
    }

    pub fn deserialize_self(schema: &Schema, input: &mut Reader<'_>) -> anyhow::Result<Self> {
        let count = input.read_length()?;
        anyhow::ensure!(
            count <= input.remaining() / 8,
            "table registry count {count} exceeds input"
        );
        let mut tables = Vec::with_capacity(count);
        for _ in 0..count {
            let id = TableId(input.read_u64()?);
            let table = schema
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("unknown table {id} in registry"))?;
            tables.push(Arc::clone(table));
        }
        Self::of_sorted_unique(tables)
    }

    /// Union of two registries.
    pub fn merge(&self, other: &TableMetadatas) -> TableMetadatas {
        if Arc::ptr_eq(&self.tables, &other.tables) || other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut collector = Collector::new();
        for table in self.iter().chain(other.iter()) {
            collector.add(table);
        }
        collector.build()
    }
}

impl PartialEq for TableMetadatas {
    fn eq(&self, other: &Self) -> bool {
        self.tables.len() == other.tables.len()
            && self
                .tables
                .iter()
                .zip(other.tables.iter())
                .all(|(a, b)| a.id == b.id)
    }
}

impl Eq for TableMetadatas {}

impl std::fmt::Debug for TableMetadatas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tables.iter().map(|t| t.id))
            .finish()
    }
}

/// Gathers the minimal set of tables needed to decode a message.
#[derive(Debug, Default)]
pub struct Collector {
    tables: BTreeMap<TableId, Arc<TableMetadata>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, table: &Arc<TableMetadata>) {
        self.tables
            .entry(table.id)
            .or_insert_with(|| Arc::clone(table));
    }

    pub fn build(self) -> TableMetadatas {
        TableMetadatas {
            tables: Arc::from(self.tables.into_values().collect::<Vec<_>>()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(id: u64) -> TableMetadata {
        TableMetadata {
            id: TableId(id),
            keyspace: "ks".to_string(),
            name: format!("tbl{id}"),
            columns: vec![
                ColumnMetadata {
                    name: "pk".to_string(),
                    kind: ColumnKind::PartitionKey,
                    column_type: ColumnType::Blob,
                    position: 0,
                },
                ColumnMetadata {
                    name: "v".to_string(),
                    kind: ColumnKind::Regular,
                    column_type: ColumnType::Int32,
                    position: 0,
                },
            ],
        }
    }

    #[test]
    fn single_table_references_are_free() {
        let mut schema = Schema::new();
        let t1 = schema.add(table(1));
        let tables = TableMetadatas::of(Arc::clone(&t1));
        let mut out = Vec::new();
        tables.serialize_table(TableId(1), &mut out).expect("serialize");
        assert!(out.is_empty());
        let decoded = tables
            .deserialize_table(&mut Reader::new(&out))
            .expect("deserialize");
        assert_eq!(decoded.id, TableId(1));
        assert!(tables.serialize_table(TableId(2), &mut out).is_err());
    }

    #[test]
    fn registry_round_trips_through_schema() {
        let mut schema = Schema::new();
        let mut collector = Collector::new();
        for id in [7, 3, 5, 3] {
            let t = schema.add(table(id));
            collector.add(&t);
        }
        let tables = collector.build();
        assert_eq!(tables.len(), 3);
        assert_eq!(tables.index_of(TableId(5)), Some(1));

        let mut out = Vec::new();
        tables.serialize_self(&mut out);
        tables.serialize_table(TableId(7), &mut out).expect("serialize ref");
        let mut reader = Reader::new(&out);
        let decoded = TableMetadatas::deserialize_self(&schema, &mut reader).expect("decode");
        assert_eq!(decoded, tables);
        assert_eq!(
            decoded.deserialize_table(&mut reader).expect("ref").id,
            TableId(7)
        );
    }

    #[test]
    fn unknown_table_ids_fail() {
        let schema = Schema::new();
        let mut out = Vec::new();
        TableMetadatas::of(Arc::new(table(1))).serialize_self(&mut out);
        assert!(TableMetadatas::deserialize_self(&schema, &mut Reader::new(&out)).is_err());
    }

    #[test]
    fn typed_comparison_and_conversion() {
        let minus_one = (-1i32).to_be_bytes();
        let one = 1i32.to_be_bytes();
        assert_eq!(ColumnType::Int32.compare(&minus_one, &one), Ordering::Less);
        assert_eq!(ColumnType::Blob.compare(&minus_one, &one), Ordering::Greater);

        let widened = ColumnType::Int32
            .convert(Bytes::copy_from_slice(&minus_one), ColumnType::Int64)
            .expect("widen");
        assert_eq!(widened.as_ref(), (-1i64).to_be_bytes().as_slice());
        assert!(ColumnType::Text
            .convert(Bytes::from_static(b"x"), ColumnType::Int32)
            .is_err());

        let sum = ColumnType::Int64
            .add(&5i64.to_be_bytes(), &(-7i64).to_be_bytes())
            .expect("add");
        assert_eq!(sum.as_ref(), (-2i64).to_be_bytes().as_slice());
    }

    #[test]
    fn table_definitions_round_trip() {
        let t = table(42);
        let mut out = Vec::new();
        t.encode(&mut out);
        let decoded = TableMetadata::decode(&mut Reader::new(&out)).expect("decode");
        assert_eq!(decoded, t);
        assert_eq!(decoded.column_id("v"), Some(1));
    }
}
