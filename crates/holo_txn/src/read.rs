//! Transaction reads: named per-key or per-range read commands, and the
//! key-sorted `TxnRead` aggregate that slices, merges and executes them.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::BufMut;
use futures_util::{stream, StreamExt, TryStreamExt};

use crate::codec::{
    deserialize_list, serialize_list, write_bool, write_bytes_with_vint_length, write_unsigned_vint,
    Reader, Version, WireFormat,
};
use crate::config::ExecutionContext;
use crate::data::{
    read_nullable_consistency_level, write_nullable_consistency_level, ConsistencyLevel, TxnData,
    TxnDataName, TxnDataValue,
};
use crate::error::TxnError;
use crate::keys::{Domain, KeyRange, Keys, Participants, PartitionKey, Ranges, Seekable, Seekables};
use crate::memo::Memoized;
use crate::partition::{Clustering, FilteredPartition, PartitionUpdate, Row};
use crate::schema::{Collector, ColumnId, TableId, TableMetadatas};
use crate::sorted::{KeySorted, KeySortedItem};
use crate::timestamp::Timestamp;

/// Which rows of a partition a read returns. Bounds are inclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ClusteringFilter {
    #[default]
    All,
    Names(Vec<Clustering>),
    Slice {
        start: Option<Clustering>,
        end: Option<Clustering>,
    },
}

impl ClusteringFilter {
    pub fn selects(&self, clustering: &Clustering) -> bool {
        match self {
            ClusteringFilter::All => true,
            ClusteringFilter::Names(names) => names.contains(clustering),
            ClusteringFilter::Slice { start, end } => {
                start.as_ref().map_or(true, |start| clustering >= start)
                    && end.as_ref().map_or(true, |end| clustering <= end)
            }
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ClusteringFilter::All => out.put_u8(0),
            ClusteringFilter::Names(names) => {
                out.put_u8(1);
                write_unsigned_vint(out, names.len() as u64);
                for name in names {
                    name.encode(out);
                }
            }
            ClusteringFilter::Slice { start, end } => {
                out.put_u8(2);
                for bound in [start, end] {
                    match bound {
                        Some(bound) => {
                            write_bool(out, true);
                            bound.encode(out);
                        }
                        None => write_bool(out, false),
                    }
                }
            }
        }
    }

    fn decode(input: &mut Reader<'_>) -> anyhow::Result<Self> {
        let optional = |input: &mut Reader<'_>| -> anyhow::Result<Option<Clustering>> {
            if input.read_bool()? {
                Ok(Some(Clustering::decode(input)?))
            } else {
                Ok(None)
            }
        };
        match input.read_u8()? {
            0 => Ok(ClusteringFilter::All),
            1 => {
                let count = input.read_length()?;
                anyhow::ensure!(count <= input.remaining(), "name count {count} exceeds input");
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    names.push(Clustering::decode(input)?);
                }
                Ok(ClusteringFilter::Names(names))
            }
            2 => {
                let start = optional(input)?;
                let end = optional(input)?;
                Ok(ClusteringFilter::Slice { start, end })
            }
            other => Err(TxnError::unknown("clustering filter", other).into()),
        }
    }
}

/// A single-table read, independent of the key it is pointed at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadCommand {
    pub table: TableId,
    /// Selected static and regular columns; empty selects all.
    pub columns: Vec<ColumnId>,
    pub filter: ClusteringFilter,
    /// Maximum number of regular rows per partition.
    pub limit: Option<u32>,
}

impl ReadCommand {
    pub fn all(table: TableId) -> Self {
        Self {
            table,
            columns: Vec::new(),
            filter: ClusteringFilter::All,
            limit: None,
        }
    }

    fn project(&self, row: &Row) -> Row {
        let mut out = Row::new(row.clustering.clone());
        for (column, cell) in &row.cells {
            if cell.value.is_some() && (self.columns.is_empty() || self.columns.contains(column)) {
                out.cells.insert(*column, cell.clone());
            }
        }
        out
    }

    /// Apply this command to a stored partition.
    pub fn filter(&self, key: &PartitionKey, stored: Option<&PartitionUpdate>) -> FilteredPartition {
        let mut out = FilteredPartition::empty(key.clone());
        let Some(stored) = stored else {
            return out;
        };
        out.static_row = self.project(&stored.static_row);
        let limit = self.limit.map_or(usize::MAX, |limit| limit as usize);
        out.rows = stored
            .rows()
            .iter()
            .filter(|row| self.filter.selects(&row.clustering))
            .map(|row| self.project(row))
            .filter(|row| !row.is_empty())
            .take(limit)
            .collect();
        out
    }

    pub async fn execute(&self, key: &Seekable, ctx: &ExecutionContext) -> anyhow::Result<TxnDataValue> {
        match key {
            Seekable::Key(key) => {
                anyhow::ensure!(
                    key.table == self.table,
                    "read of {} pointed at key of {}",
                    self.table,
                    key.table
                );
                Ok(TxnDataValue::Key(ctx.store().read_partition(key, self).await?))
            }
            Seekable::Range(range) => Ok(TxnDataValue::Range(
                ctx.store().read_range(range, self).await?,
            )),
        }
    }
}

impl WireFormat for ReadCommand {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, _: Version) -> anyhow::Result<()> {
        // Raw id: memoized command bytes must survive registry merges.
        write_unsigned_vint(out, tables.get(self.table)?.id.0);
        write_unsigned_vint(out, self.columns.len() as u64);
        for column in &self.columns {
            write_unsigned_vint(out, u64::from(*column));
        }
        self.filter.encode(out);
        match self.limit {
            Some(limit) => {
                write_bool(out, true);
                write_unsigned_vint(out, u64::from(limit));
            }
            None => write_bool(out, false),
        }
        Ok(())
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, _: Version) -> anyhow::Result<Self> {
        let table = tables.get(TableId(input.read_unsigned_vint()?))?;
        let count = input.read_length()?;
        anyhow::ensure!(count <= input.remaining(), "column count {count} exceeds input");
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let column = u16::try_from(input.read_unsigned_vint()?)
                .map_err(|_| anyhow::anyhow!("column id out of range"))?;
            table.column(column)?;
            columns.push(column);
        }
        let filter = ClusteringFilter::decode(input)?;
        let limit = if input.read_bool()? {
            Some(input.read_unsigned_vint32()?)
        } else {
            None
        };
        Ok(Self {
            table: table.id,
            columns,
            filter,
            limit,
        })
    }
}

/// A read command bound to a key or range under a txn data name.
///
/// A read without a command only declares the key, so that the transaction
/// still orders against others touching it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedRead {
    name: TxnDataName,
    key: Seekable,
    command: Option<Memoized<ReadCommand>>,
}

impl NamedRead {
    pub fn new(
        name: TxnDataName,
        key: Seekable,
        command: Option<&ReadCommand>,
        tables: &TableMetadatas,
    ) -> anyhow::Result<Self> {
        let command = match command {
            Some(command) => {
                let bytes = command.to_bytes(tables, Version::LATEST)?;
                Some(Memoized::with_value(bytes, command.clone()))
            }
            None => None,
        };
        Ok(Self { name, key, command })
    }

    pub fn noop(name: TxnDataName, key: Seekable) -> Self {
        Self {
            name,
            key,
            command: None,
        }
    }

    pub fn name(&self) -> TxnDataName {
        self.name
    }

    pub fn key(&self) -> &Seekable {
        &self.key
    }

    pub fn is_noop(&self) -> bool {
        self.command.is_none()
    }

    pub fn command(&self, tables: &TableMetadatas) -> anyhow::Result<Option<Arc<ReadCommand>>> {
        match &self.command {
            Some(memo) => memo
                .get(|raw| ReadCommand::from_bytes(tables, raw, Version::LATEST))
                .map(Some),
            None => Ok(None),
        }
    }

    /// Clip a range read to `range`; key reads are returned unchanged.
    pub fn slice(&self, range: &KeyRange) -> Option<NamedRead> {
        match &self.key {
            Seekable::Key(_) => Some(self.clone()),
            Seekable::Range(own) => own.intersection(range).map(|clipped| NamedRead {
                name: self.name,
                key: Seekable::Range(clipped),
                command: self.command.clone(),
            }),
        }
    }

    /// Union of two touching or overlapping range reads of the same name.
    pub fn merge(&self, other: &NamedRead) -> anyhow::Result<NamedRead> {
        let (Seekable::Range(left), Seekable::Range(right)) = (&self.key, &other.key) else {
            anyhow::bail!("only range reads can be merged");
        };
        anyhow::ensure!(
            left.overlaps(right) || left.touches(right),
            "cannot merge disjoint range reads {left} and {right}"
        );
        anyhow::ensure!(
            self.name == other.name,
            "cannot merge adjacent range reads with different names {:?} and {:?}",
            self.name,
            other.name
        );
        anyhow::ensure!(
            self.command == other.command,
            "cannot merge range reads of {:?} with different commands",
            self.name
        );
        Ok(NamedRead {
            name: self.name,
            key: Seekable::Range(left.union(right)),
            command: self.command.clone(),
        })
    }

    pub fn unmemoize(&self) {
        if let Some(command) = &self.command {
            command.unmemoize();
        }
    }

    pub fn collect(&self, tables: &TableMetadatas, collector: &mut Collector) -> anyhow::Result<()> {
        if let Some(command) = self.command(tables)? {
            collector.add(tables.get(command.table)?);
        }
        Ok(())
    }

    async fn read(
        &self,
        tables: &TableMetadatas,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<Option<(TxnDataName, TxnDataValue)>> {
        let Some(command) = self.command(tables)? else {
            return Ok(None);
        };
        let value = command.execute(&self.key, ctx).await?;
        Ok(Some((self.name, value)))
    }
}

impl KeySortedItem for NamedRead {
    type Key = Seekable;

    fn key(&self) -> &Seekable {
        &self.key
    }

    fn tie_break(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl WireFormat for NamedRead {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        out.put_u32(self.name.as_u32());
        self.key.serialize(tables, out, version)?;
        match &self.command {
            Some(command) => {
                write_bool(out, true);
                write_bytes_with_vint_length(out, command.bytes());
            }
            None => write_bool(out, false),
        }
        Ok(())
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        let name = TxnDataName::from_u32(input.read_u32()?)?;
        let key = Seekable::deserialize(tables, input, version)?;
        let command = if input.read_bool()? {
            Some(Memoized::from_bytes(input.read_bytes_with_vint_length()?))
        } else {
            None
        };
        Ok(Self { name, key, command })
    }
}

const EMPTY_KEY: u8 = 0;
const EMPTY_RANGE: u8 = 1;
const NOT_EMPTY: u8 = 2;

/// All reads of one transaction, sorted by key then name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnRead {
    tables: TableMetadatas,
    items: KeySorted<NamedRead>,
    domain: Domain,
    /// Level for data read outside the transactional protocol.
    cl: Option<ConsistencyLevel>,
}

impl TxnRead {
    pub fn empty(domain: Domain) -> Self {
        Self {
            tables: TableMetadatas::none(),
            items: KeySorted::default(),
            domain,
            cl: None,
        }
    }

    fn build(
        tables: TableMetadatas,
        items: KeySorted<NamedRead>,
        domain: Domain,
        cl: Option<ConsistencyLevel>,
    ) -> anyhow::Result<Self> {
        for item in items.iter() {
            anyhow::ensure!(
                item.key().domain() == domain,
                "{} read in a {domain:?} domain transaction",
                item.key()
            );
        }
        if domain == Domain::Range {
            for pair in items.items().windows(2) {
                let (Seekable::Range(a), Seekable::Range(b)) = (pair[0].key(), pair[1].key()) else {
                    continue;
                };
                anyhow::ensure!(
                    !a.overlaps(b) && !a.touches(b),
                    "range reads {a} and {b} overlap or touch"
                );
            }
        }
        Ok(Self {
            tables,
            items,
            domain,
            cl,
        })
    }

    /// User reads over keys.
    pub fn txn(
        tables: TableMetadatas,
        reads: Vec<NamedRead>,
        cl: Option<ConsistencyLevel>,
    ) -> anyhow::Result<Self> {
        Self::build(tables, KeySorted::new(reads), Domain::Key, cl)
    }

    /// One read per `(key, command)`, named `User(i)` in input order.
    pub fn serial(
        tables: TableMetadatas,
        reads: Vec<(PartitionKey, ReadCommand)>,
        cl: Option<ConsistencyLevel>,
    ) -> anyhow::Result<Self> {
        let mut items = Vec::with_capacity(reads.len());
        for (idx, (key, command)) in reads.into_iter().enumerate() {
            let name = TxnDataName::new(crate::data::TxnDataKind::User, idx as u32)?;
            items.push(NamedRead::new(name, Seekable::Key(key), Some(&command), &tables)?);
        }
        Self::txn(tables, items, cl)
    }

    pub fn cas(
        tables: TableMetadatas,
        key: PartitionKey,
        command: &ReadCommand,
        cl: Option<ConsistencyLevel>,
    ) -> anyhow::Result<Self> {
        let read = NamedRead::new(TxnDataName::cas_read(), Seekable::Key(key), Some(command), &tables)?;
        Self::txn(tables, vec![read], cl)
    }

    /// Declares `keys` without reading anything.
    pub fn noop(keys: &Keys) -> anyhow::Result<Self> {
        let mut items = Vec::with_capacity(keys.len());
        for (idx, key) in keys.iter().enumerate() {
            let name = TxnDataName::new(crate::data::TxnDataKind::User, idx as u32)?;
            items.push(NamedRead::noop(name, Seekable::Key(key.clone())));
        }
        Self::txn(TableMetadatas::none(), items, None)
    }

    pub fn range(tables: TableMetadatas, range: KeyRange, command: &ReadCommand) -> anyhow::Result<Self> {
        let read = NamedRead::new(TxnDataName::user(0), Seekable::Range(range), Some(command), &tables)?;
        Self::build(tables, KeySorted::new(vec![read]), Domain::Range, None)
    }

    pub fn tables(&self) -> &TableMetadatas {
        &self.tables
    }

    /// Rebind reads that reference no table to the enclosing registry.
    pub(crate) fn with_tables(mut self, tables: TableMetadatas) -> Self {
        self.tables = tables;
        self
    }

    pub fn items(&self) -> &[NamedRead] {
        self.items.items()
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn cl(&self) -> Option<ConsistencyLevel> {
        self.cl
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Distinct keys or ranges read, in order.
    pub fn keys(&self) -> anyhow::Result<Seekables> {
        Seekables::from_sorted(self.domain, self.items.keys())
    }

    fn with_items(&self, items: KeySorted<NamedRead>) -> Self {
        Self {
            tables: self.tables.clone(),
            items,
            domain: self.domain,
            cl: self.cl,
        }
    }

    /// Project onto `ranges`, clipping range reads.
    pub fn slice(&self, ranges: &Ranges) -> Self {
        let sliced = self.items.slice(ranges, |item, range| item.slice(range));
        if sliced == self.items {
            return self.clone();
        }
        self.with_items(sliced)
    }

    /// Reads whose key falls within `participants`, unclipped.
    pub fn intersecting(&self, participants: &Participants) -> Self {
        let keys = self.items.keys();
        let selected: Vec<Seekable> = keys
            .iter()
            .filter(|key| participants.contains(key))
            .cloned()
            .collect();
        if selected.len() == keys.len() {
            return self.clone();
        }
        self.with_items(self.items.select(&selected))
    }

    pub fn merge(&self, other: &TxnRead) -> anyhow::Result<TxnRead> {
        if other.is_empty() {
            return Ok(self.clone());
        }
        if self.is_empty() {
            return Ok(other.clone());
        }
        anyhow::ensure!(
            self.domain == other.domain,
            "cannot merge {:?} and {:?} reads",
            self.domain,
            other.domain
        );
        anyhow::ensure!(
            self.cl == other.cl,
            "cannot merge reads with consistency levels {:?} and {:?}",
            self.cl,
            other.cl
        );
        let tables = self.tables.merge(&other.tables);
        let items = match self.domain {
            Domain::Key => self.items.merge(&other.items),
            Domain::Range => merge_ranges(self.items.items(), other.items.items())?,
        };
        Ok(Self {
            tables,
            items,
            domain: self.domain,
            cl: self.cl,
        })
    }

    /// Execute every read at `key` and combine the results.
    pub async fn read(
        &self,
        key: &Seekable,
        execute_at: Timestamp,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<TxnData> {
        let reads = self.items.with_key(key);
        tracing::debug!(key = %key, execute_at = %execute_at, reads = reads.len(), "executing txn read");
        match reads.as_slice() {
            [] => Ok(TxnData::new()),
            [read] => Ok(match read.read(&self.tables, ctx).await? {
                Some((name, value)) => TxnData::of(name, value),
                None => TxnData::new(),
            }),
            _ => {
                let tables = &self.tables;
                stream::iter(reads.iter().map(|read| read.read(tables, ctx)))
                    .buffer_unordered(ctx.config().read_concurrency)
                    .try_fold(TxnData::new(), |data, result| async move {
                        match result {
                            Some((name, value)) => data.merge(TxnData::of(name, value)),
                            None => Ok(data),
                        }
                    })
                    .await
            }
        }
    }

    pub fn unmemoize(&self) {
        for item in self.items.iter() {
            item.unmemoize();
        }
    }

    pub fn collect(&self, collector: &mut Collector) -> anyhow::Result<()> {
        for item in self.items.iter() {
            item.collect(&self.tables, collector)?;
        }
        Ok(())
    }
}

/// Linear merge of two range-read lists, coalescing touching or
/// overlapping neighbours through a pending accumulator.
fn merge_ranges(left: &[NamedRead], right: &[NamedRead]) -> anyhow::Result<KeySorted<NamedRead>> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut pending: Option<NamedRead> = None;
    let (mut i, mut j) = (0, 0);
    while i < left.len() || j < right.len() {
        let next = if j >= right.len() || (i < left.len() && left[i].compare(&right[j]) != Ordering::Greater) {
            i += 1;
            &left[i - 1]
        } else {
            j += 1;
            &right[j - 1]
        };
        pending = Some(match pending.take() {
            None => next.clone(),
            Some(current) => {
                let (Seekable::Range(a), Seekable::Range(b)) = (current.key(), next.key()) else {
                    anyhow::bail!("key read in a range merge");
                };
                if a.overlaps(b) || a.touches(b) {
                    current.merge(next)?
                } else {
                    out.push(current);
                    next.clone()
                }
            }
        });
    }
    out.extend(pending);
    KeySorted::from_sorted(out)
}

impl WireFormat for TxnRead {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        if self.items.is_empty() {
            out.put_u8(match self.domain {
                Domain::Key => EMPTY_KEY,
                Domain::Range => EMPTY_RANGE,
            });
            return Ok(());
        }
        out.put_u8(NOT_EMPTY);
        serialize_list(self.items.items(), tables, out, version)?;
        write_nullable_consistency_level(out, self.cl);
        Ok(())
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        match input.read_u8()? {
            EMPTY_KEY => Ok(Self::empty(Domain::Key)),
            EMPTY_RANGE => Ok(Self::empty(Domain::Range)),
            NOT_EMPTY => {
                let items: Vec<NamedRead> = deserialize_list(tables, input, version)?;
                let cl = read_nullable_consistency_level(input)?;
                let domain = items
                    .first()
                    .map(|item| item.key().domain())
                    .ok_or_else(|| anyhow::anyhow!("non-empty txn read without items"))?;
                Self::build(tables.clone(), KeySorted::from_sorted(items)?, domain, cl)
            }
            other => Err(TxnError::unknown("txn read", other).into()),
        }
    }
}
