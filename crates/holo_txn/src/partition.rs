//! Row-level data: partition updates carried by writes and the filtered
//! partitions returned by reads.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{BufMut, Bytes};

use crate::codec::{
    write_nullable_bytes, write_unsigned_vint, write_vint, write_bytes_with_vint_length, Reader,
    Version, WireFormat,
};
use crate::keys::PartitionKey;
use crate::schema::{ColumnId, ColumnKind, TableMetadatas};

/// Clustering prefix of a row; rows within a partition are byte ordered.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Clustering(pub Vec<Bytes>);

impl Clustering {
    pub const STATIC: Clustering = Clustering(Vec::new());

    pub fn of(parts: impl IntoIterator<Item = Bytes>) -> Self {
        Self(parts.into_iter().collect())
    }

    pub fn is_static(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Bytes> {
        self.0.get(position)
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        write_unsigned_vint(out, self.0.len() as u64);
        for part in &self.0 {
            write_bytes_with_vint_length(out, part);
        }
    }

    pub(crate) fn decode(input: &mut Reader<'_>) -> anyhow::Result<Self> {
        let count = input.read_length()?;
        anyhow::ensure!(count <= input.remaining(), "clustering size {count} exceeds input");
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            parts.push(input.read_bytes_with_vint_length()?);
        }
        Ok(Self(parts))
    }
}

/// A column value; `None` is a deletion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub value: Option<Bytes>,
    pub timestamp: i64,
}

impl Cell {
    pub fn live(value: impl Into<Bytes>, timestamp: i64) -> Self {
        Self {
            value: Some(value.into()),
            timestamp,
        }
    }

    pub fn tombstone(timestamp: i64) -> Self {
        Self {
            value: None,
            timestamp,
        }
    }

    /// Last-write-wins; deletions win timestamp ties.
    pub fn supersedes(&self, other: &Cell) -> bool {
        match self.timestamp.cmp(&other.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.value.is_none() || other.value.is_some(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    pub clustering: Clustering,
    pub cells: BTreeMap<ColumnId, Cell>,
}

impl Row {
    pub fn new(clustering: Clustering) -> Self {
        Self {
            clustering,
            cells: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn value(&self, column: ColumnId) -> Option<&Bytes> {
        self.cells.get(&column).and_then(|cell| cell.value.as_ref())
    }

    /// Merge `other` into `self` cell by cell.
    pub fn absorb(&mut self, other: &Row) {
        for (column, cell) in &other.cells {
            match self.cells.get(column) {
                Some(existing) if !cell.supersedes(existing) => {}
                _ => {
                    self.cells.insert(*column, cell.clone());
                }
            }
        }
    }
}

/// Mutations to a single partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionUpdate {
    pub key: PartitionKey,
    /// Columns this update declares; every cell belongs to one of them.
    pub columns: BTreeSet<ColumnId>,
    pub static_row: Row,
    rows: Vec<Row>,
}

impl PartitionUpdate {
    pub fn new(key: PartitionKey) -> Self {
        Self {
            key,
            columns: BTreeSet::new(),
            static_row: Row::default(),
            rows: Vec::new(),
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, clustering: &Clustering) -> Option<&Row> {
        self.rows
            .binary_search_by(|row| row.clustering.cmp(clustering))
            .ok()
            .map(|idx| &self.rows[idx])
    }

    pub fn row_mut(&mut self, clustering: Clustering) -> &mut Row {
        if clustering.is_static() {
            return &mut self.static_row;
        }
        let idx = match self.rows.binary_search_by(|row| row.clustering.cmp(&clustering)) {
            Ok(idx) => idx,
            Err(idx) => {
                self.rows.insert(idx, Row::new(clustering));
                idx
            }
        };
        &mut self.rows[idx]
    }

    /// Set one cell, declaring its column.
    pub fn set(&mut self, clustering: Clustering, column: ColumnId, cell: Cell) -> &mut Self {
        self.columns.insert(column);
        self.row_mut(clustering).cells.insert(column, cell);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.static_row.is_empty() && self.rows.iter().all(Row::is_empty)
    }

    fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.static_row
            .cells
            .values()
            .chain(self.rows.iter().flat_map(|row| row.cells.values()))
    }

    pub fn min_timestamp(&self) -> Option<i64> {
        self.cells().map(|cell| cell.timestamp).min()
    }

    /// Copy with every cell rewritten to `timestamp`.
    pub fn with_timestamp(&self, timestamp: i64) -> Self {
        let mut out = self.clone();
        for row in std::iter::once(&mut out.static_row).chain(out.rows.iter_mut()) {
            for cell in row.cells.values_mut() {
                cell.timestamp = timestamp;
            }
        }
        out
    }

    /// Merge another update to the same partition, last write wins.
    pub fn absorb(&mut self, other: &PartitionUpdate) {
        debug_assert_eq!(self.key, other.key);
        self.columns.extend(other.columns.iter().copied());
        self.static_row.absorb(&other.static_row);
        for row in &other.rows {
            self.row_mut(row.clustering.clone()).absorb(row);
        }
    }

    fn encode_row(row: &Row, base: i64, out: &mut Vec<u8>, version: Version) {
        write_unsigned_vint(out, row.cells.len() as u64);
        for (column, cell) in &row.cells {
            write_unsigned_vint(out, u64::from(*column));
            write_nullable_bytes(out, cell.value.as_deref());
            match version {
                Version::V1 => out.put_i64(cell.timestamp),
                Version::V2 => write_vint(out, cell.timestamp.wrapping_sub(base)),
            }
        }
    }

    fn decode_row(
        clustering: Clustering,
        base: i64,
        input: &mut Reader<'_>,
        version: Version,
    ) -> anyhow::Result<Row> {
        let count = input.read_length()?;
        anyhow::ensure!(count <= input.remaining(), "cell count {count} exceeds input");
        let mut row = Row::new(clustering);
        for _ in 0..count {
            let column = u16::try_from(input.read_unsigned_vint()?)
                .map_err(|_| anyhow::anyhow!("column id out of range"))?;
            let value = input.read_nullable_bytes()?;
            let timestamp = match version {
                Version::V1 => input.read_i64()?,
                Version::V2 => base.wrapping_add(input.read_vint()?),
            };
            anyhow::ensure!(
                row.cells.insert(column, Cell { value, timestamp }).is_none(),
                "duplicate cell for column {column}"
            );
        }
        Ok(row)
    }
}

impl WireFormat for PartitionUpdate {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        self.key.serialize(tables, out, version)?;
        self.serialize_without_key(out, version);
        Ok(())
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        let key = PartitionKey::deserialize(tables, input, version)?;
        Self::deserialize_with_key(key, tables, input, version)
    }
}

impl PartitionUpdate {
    /// Body of the update; the key is supplied by the enclosing structure.
    pub fn serialize_without_key(&self, out: &mut Vec<u8>, version: Version) {
        write_unsigned_vint(out, self.columns.len() as u64);
        for column in &self.columns {
            write_unsigned_vint(out, u64::from(*column));
        }
        let base = self.min_timestamp().unwrap_or(0);
        if version >= Version::V2 {
            write_vint(out, base);
        }
        Self::encode_row(&self.static_row, base, out, version);
        write_unsigned_vint(out, self.rows.len() as u64);
        for row in &self.rows {
            row.clustering.encode(out);
            Self::encode_row(row, base, out, version);
        }
    }

    pub fn deserialize_with_key(
        key: PartitionKey,
        tables: &TableMetadatas,
        input: &mut Reader<'_>,
        version: Version,
    ) -> anyhow::Result<Self> {
        let table = tables.get(key.table)?;
        let count = input.read_length()?;
        anyhow::ensure!(count <= input.remaining(), "column count {count} exceeds input");
        let mut columns = BTreeSet::new();
        for _ in 0..count {
            let column = u16::try_from(input.read_unsigned_vint()?)
                .map_err(|_| anyhow::anyhow!("column id out of range"))?;
            let metadata = table.column(column)?;
            anyhow::ensure!(
                matches!(metadata.kind, ColumnKind::Static | ColumnKind::Regular),
                "column {} of kind {:?} cannot be updated",
                metadata.name,
                metadata.kind
            );
            columns.insert(column);
        }
        let base = if version >= Version::V2 {
            input.read_vint()?
        } else {
            0
        };
        let static_row = Self::decode_row(Clustering::STATIC, base, input, version)?;
        let row_count = input.read_length()?;
        anyhow::ensure!(row_count <= input.remaining(), "row count {row_count} exceeds input");
        let mut rows: Vec<Row> = Vec::with_capacity(row_count);
        for _ in 0..row_count {
            let clustering = Clustering::decode(input)?;
            anyhow::ensure!(!clustering.is_static(), "regular row without clustering");
            if let Some(last) = rows.last() {
                anyhow::ensure!(last.clustering < clustering, "rows are not sorted");
            }
            rows.push(Self::decode_row(clustering, base, input, version)?);
        }
        let update = Self {
            key,
            columns,
            static_row,
            rows,
        };
        for row in std::iter::once(&update.static_row).chain(update.rows.iter()) {
            for column in row.cells.keys() {
                anyhow::ensure!(
                    update.columns.contains(column),
                    "cell for undeclared column {column}"
                );
            }
        }
        Ok(update)
    }
}

/// The live contents of one partition as seen by a read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilteredPartition {
    pub key: PartitionKey,
    pub static_row: Row,
    pub rows: Vec<Row>,
}

impl FilteredPartition {
    pub fn empty(key: PartitionKey) -> Self {
        Self {
            key,
            static_row: Row::default(),
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.static_row.is_empty() && self.rows.is_empty()
    }

    pub fn row(&self, clustering: &Clustering) -> Option<&Row> {
        if clustering.is_static() {
            return Some(&self.static_row);
        }
        self.rows.iter().find(|row| &row.clustering == clustering)
    }

    /// The one regular row of a single-row result.
    pub fn single_row(&self) -> anyhow::Result<Option<&Row>> {
        match self.rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some(row)),
            rows => anyhow::bail!(
                "expected at most one row in {}, found {}",
                self.key,
                rows.len()
            ),
        }
    }
}
