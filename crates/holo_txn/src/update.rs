//! Pending writes: fragments that may still need read results to complete,
//! grouped per key behind a condition.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};

use bytes::{BufMut, Bytes};

use crate::codec::{
    write_bool, write_bytes_with_vint_length, write_unsigned_vint, write_vint, Reader, Version,
    WireFormat,
};
use crate::data::{
    read_nullable_consistency_level, write_nullable_consistency_level, ConsistencyLevel, TxnData,
    TxnDataValue,
};
use crate::error::TxnError;
use crate::keys::{Keys, Participants, PartitionKey, Ranges};
use crate::partition::{Cell, Clustering, FilteredPartition, PartitionUpdate, Row};
use crate::reference::{ReferenceOperation, ReferenceOperations};
use crate::schema::{ColumnKind, TableMetadata, TableMetadatas};
use crate::condition::{SerializedCondition, TxnCondition};
use crate::sorted::{KeySorted, KeySortedItem};
use crate::store::ClusterEpoch;
use crate::timestamp::Timestamp;
use crate::write::{TxnWrite, Update};

/// Inputs for completing fragments during one apply.
#[derive(Clone, Copy, Debug)]
pub struct FragmentParameters<'a> {
    pub data: &'a TxnData,
    /// Write timestamp for cells produced by reference operations.
    pub timestamp: i64,
}

/// One partition's pending write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub key: PartitionKey,
    /// Position of the clause that produced this fragment.
    pub index: u32,
    pub base: PartitionUpdate,
    pub ops: ReferenceOperations,
    /// Client-supplied write timestamp, overriding the apply timestamp.
    pub timestamp: Option<i64>,
}

impl Fragment {
    pub fn new(index: u32, base: PartitionUpdate, ops: ReferenceOperations) -> Self {
        Self {
            key: base.key.clone(),
            index,
            base,
            ops,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn is_complete(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn to_update(&self, tables: &TableMetadatas) -> anyhow::Result<Update> {
        Update::new(self.key.clone(), self.index, &self.base, tables)
    }

    /// Resolve the reference operations into a new partition update. Columns
    /// the base does not declare are added; other cells are kept.
    pub fn complete(
        &self,
        params: &FragmentParameters<'_>,
        tables: &TableMetadatas,
    ) -> anyhow::Result<Update> {
        if self.is_complete() {
            return self.to_update(tables);
        }
        let table = tables.get(self.key.table)?;
        let existing = self.existing(params.data)?;
        let timestamp = self.timestamp.unwrap_or(params.timestamp);
        let mut update = self.base.clone();

        apply_operations(
            &mut update,
            Clustering::STATIC,
            &self.ops.statics,
            existing.map(|partition| &partition.static_row),
            ColumnKind::Static,
            table,
            params.data,
            timestamp,
        )?;
        if !self.ops.regulars.is_empty() {
            let clustering = self
                .ops
                .clustering
                .clone()
                .ok_or_else(|| anyhow::anyhow!("regular operations on {} without a row", self.key))?;
            let existing_row = existing.and_then(|partition| partition.row(&clustering));
            apply_operations(
                &mut update,
                clustering,
                &self.ops.regulars,
                existing_row,
                ColumnKind::Regular,
                table,
                params.data,
                timestamp,
            )?;
        }
        Update::new(self.key.clone(), self.index, &update, tables)
    }

    fn existing<'a>(&self, data: &'a TxnData) -> anyhow::Result<Option<&'a FilteredPartition>> {
        let Some(name) = self.ops.existing else {
            return Ok(None);
        };
        match data.get(name) {
            None => Ok(None),
            Some(TxnDataValue::Key(partition)) => {
                anyhow::ensure!(
                    partition.key == self.key,
                    "existing row of {} read from {}",
                    self.key,
                    partition.key
                );
                Ok(Some(partition))
            }
            Some(TxnDataValue::Range(_)) => {
                anyhow::bail!("existing row of {} bound to a range result", self.key)
            }
        }
    }

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        write_unsigned_vint(out, u64::from(self.index));
        self.base.serialize_without_key(out, version);
        self.ops.serialize(tables, out, version)?;
        match self.timestamp {
            Some(timestamp) => {
                write_bool(out, true);
                write_vint(out, timestamp);
            }
            None => write_bool(out, false),
        }
        Ok(())
    }

    fn deserialize(
        key: &PartitionKey,
        tables: &TableMetadatas,
        input: &mut Reader<'_>,
        version: Version,
    ) -> anyhow::Result<Self> {
        let index = input.read_unsigned_vint32()?;
        let base = PartitionUpdate::deserialize_with_key(key.clone(), tables, input, version)?;
        let ops = ReferenceOperations::deserialize(tables, input, version)?;
        let timestamp = if input.read_bool()? {
            Some(input.read_vint()?)
        } else {
            None
        };
        Ok(Self {
            key: key.clone(),
            index,
            base,
            ops,
            timestamp,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_operations(
    update: &mut PartitionUpdate,
    clustering: Clustering,
    operations: &[ReferenceOperation],
    existing: Option<&Row>,
    kind: ColumnKind,
    table: &TableMetadata,
    data: &TxnData,
    timestamp: i64,
) -> anyhow::Result<()> {
    for op in operations {
        let column = table.column(op.column)?;
        anyhow::ensure!(
            column.kind == kind,
            "{:?} operation on {:?} column {}",
            kind,
            column.kind,
            column.name
        );
        // Earlier operations in this fragment take precedence over the read.
        let pending = if clustering.is_static() {
            Some(&update.static_row)
        } else {
            update.row(&clustering)
        }
        .and_then(|row| row.cells.get(&op.column))
        .map(|cell| cell.value.clone());
        let current = match pending {
            Some(value) => value,
            None => existing.and_then(|row| row.value(op.column).cloned()),
        };
        let cell = match op.apply(table, current.as_ref(), data)? {
            Some(value) => Cell::live(value, timestamp),
            None => Cell::tombstone(timestamp),
        };
        update.set(clustering.clone(), op.column, cell);
    }
    Ok(())
}

fn encode_fragments(
    fragments: &[Fragment],
    tables: &TableMetadatas,
    version: Version,
) -> anyhow::Result<Bytes> {
    let mut out = Vec::new();
    write_unsigned_vint(&mut out, u64::from(version.as_u8()));
    write_unsigned_vint(&mut out, fragments.len() as u64);
    for fragment in fragments {
        fragment.serialize(tables, &mut out, version)?;
    }
    Ok(Bytes::from(out))
}

fn blob_version(blob: &[u8]) -> anyhow::Result<Version> {
    let raw = Reader::new(blob).read_unsigned_vint()?;
    let raw = u8::try_from(raw).map_err(|_| TxnError::unknown("fragment version", raw))?;
    Version::from_u8(raw)
}

fn decode_fragments(
    key: &PartitionKey,
    tables: &TableMetadatas,
    blob: &[u8],
) -> anyhow::Result<Vec<Fragment>> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    let mut input = Reader::new(blob);
    let raw = input.read_unsigned_vint()?;
    let raw = u8::try_from(raw).map_err(|_| TxnError::unknown("fragment version", raw))?;
    let version = Version::from_u8(raw)?;
    let count = input.read_length()?;
    anyhow::ensure!(count > 0, "empty fragment group for {key}");
    anyhow::ensure!(count <= input.remaining(), "fragment count {count} exceeds input");
    let mut fragments = Vec::with_capacity(count);
    for _ in 0..count {
        fragments.push(Fragment::deserialize(key, tables, &mut input, version)?);
    }
    anyhow::ensure!(input.is_empty(), "trailing bytes after fragments of {key}");
    Ok(fragments)
}

/// Encoded fragments of one key; empty bytes mark a key with no fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
struct FragmentSlot {
    key: PartitionKey,
    blob: Bytes,
}

impl KeySortedItem for FragmentSlot {
    type Key = PartitionKey;

    fn key(&self) -> &PartitionKey {
        &self.key
    }

    fn tie_break(&self, _: &Self) -> Ordering {
        Ordering::Equal
    }
}

const FLAG_PRESERVE_TIMESTAMPS: u8 = 0x1;

const CONDITION_UNKNOWN: u8 = 0;
const CONDITION_FALSE: u8 = 1;
const CONDITION_TRUE: u8 = 2;

/// All pending writes of a transaction and the condition guarding them.
///
/// The memoized condition result is the only state that changes after
/// construction. At most one apply may be in flight per instance.
#[derive(Debug)]
pub struct TxnUpdate {
    tables: TableMetadatas,
    slots: KeySorted<FragmentSlot>,
    condition: SerializedCondition,
    cl: Option<ConsistencyLevel>,
    preserve_timestamps: bool,
    condition_result: AtomicU8,
}

impl TxnUpdate {
    pub fn new(
        tables: TableMetadatas,
        mut fragments: Vec<Fragment>,
        condition: &TxnCondition,
        cl: Option<ConsistencyLevel>,
        preserve_timestamps: bool,
    ) -> anyhow::Result<Self> {
        fragments.sort_by(|a, b| a.key.cmp(&b.key).then(a.index.cmp(&b.index)));
        let mut slots = Vec::new();
        for group in fragments.chunk_by(|a, b| a.key == b.key) {
            let key = group[0].key.clone();
            tables.get(key.table)?;
            slots.push(FragmentSlot {
                blob: encode_fragments(group, &tables, Version::LATEST)?,
                key,
            });
        }
        let condition = SerializedCondition::new(condition, &tables)?;
        Ok(Self {
            tables,
            slots: KeySorted::from_sorted(slots)?,
            condition,
            cl,
            preserve_timestamps,
            condition_result: AtomicU8::new(CONDITION_UNKNOWN),
        })
    }

    fn with_slots(&self, slots: KeySorted<FragmentSlot>) -> Self {
        Self {
            tables: self.tables.clone(),
            slots,
            condition: self.condition.clone(),
            cl: self.cl,
            preserve_timestamps: self.preserve_timestamps,
            condition_result: AtomicU8::new(CONDITION_UNKNOWN),
        }
    }

    pub fn tables(&self) -> &TableMetadatas {
        &self.tables
    }

    pub fn keys(&self) -> Keys {
        Keys::of(self.slots.keys())
    }

    pub fn cl(&self) -> Option<ConsistencyLevel> {
        self.cl
    }

    pub fn preserve_timestamps(&self) -> bool {
        self.preserve_timestamps
    }

    pub fn condition(&self) -> &SerializedCondition {
        &self.condition
    }

    /// All fragments, in key then index order.
    pub fn fragments(&self) -> anyhow::Result<Vec<Fragment>> {
        let mut out = Vec::new();
        for slot in self.slots.iter() {
            out.extend(decode_fragments(&slot.key, &self.tables, &slot.blob)?);
        }
        Ok(out)
    }

    /// The condition travels whole; only fragments are projected.
    pub fn slice(&self, ranges: &Ranges) -> Self {
        self.with_slots(self.slots.slice(ranges, |slot, _| Some(slot.clone())))
    }

    pub fn intersecting(&self, participants: &Participants) -> Self {
        let keys = self.keys().intersecting(participants);
        self.with_slots(self.slots.select(keys.as_slice()))
    }

    /// Union by key. Both sides must carry identical bytes for a shared key.
    pub fn merge(&self, other: &TxnUpdate) -> anyhow::Result<TxnUpdate> {
        anyhow::ensure!(
            self.tables == other.tables,
            "cannot merge updates built against registries {:?} and {:?}",
            self.tables,
            other.tables
        );
        let (left, right) = (self.slots.items(), other.slots.items());
        let mut out = Vec::with_capacity(left.len() + right.len());
        let (mut l, mut r) = (0, 0);
        while l < left.len() && r < right.len() {
            match left[l].key.cmp(&right[r].key) {
                Ordering::Less => {
                    out.push(left[l].clone());
                    l += 1;
                }
                Ordering::Greater => {
                    out.push(right[r].clone());
                    r += 1;
                }
                Ordering::Equal => {
                    if left[l].blob != right[r].blob {
                        tracing::warn!(key = %left[l].key, "txn update merge found differing fragments");
                        return Err(TxnError::MergeConflict {
                            key: left[l].key.to_string(),
                        }
                        .into());
                    }
                    out.push(left[l].clone());
                    l += 1;
                    r += 1;
                }
            }
        }
        out.extend_from_slice(&left[l..]);
        out.extend_from_slice(&right[r..]);
        Ok(self.with_slots(KeySorted::from_sorted(out)?))
    }

    /// Evaluate the condition and complete every pending fragment.
    pub fn apply(
        &self,
        epochs: &dyn ClusterEpoch,
        execute_at: Timestamp,
        data: &TxnData,
    ) -> anyhow::Result<TxnWrite> {
        let current = epochs.current_epoch();
        if current < execute_at.epoch {
            return Err(TxnError::EpochNotReady {
                required: execute_at.epoch,
                current,
            }
            .into());
        }
        if !self.check_condition(data)? {
            tracing::debug!(execute_at = %execute_at, "txn condition not met, skipping writes");
            return Ok(TxnWrite::empty_condition_failed());
        }
        if self.slots.is_empty() {
            return Ok(TxnWrite::new(TableMetadatas::none(), Vec::new(), true));
        }
        let params = FragmentParameters {
            data,
            timestamp: execute_at.unique_hlc(),
        };
        let mut updates = Vec::new();
        for fragment in self.fragments()? {
            // Complete fragments are written straight from this update.
            if !fragment.is_complete() {
                updates.push(fragment.complete(&params, &self.tables)?);
            }
        }
        Ok(TxnWrite::new(self.tables.clone(), updates, true))
    }

    /// Fragments of `key` that need no read results, as updates.
    pub fn complete_updates_for_key(&self, key: &PartitionKey) -> anyhow::Result<Vec<Update>> {
        let Some(idx) = self.slots.find(key) else {
            return Ok(Vec::new());
        };
        let slot = &self.slots.items()[idx];
        decode_fragments(&slot.key, &self.tables, &slot.blob)?
            .iter()
            .filter(|fragment| fragment.is_complete())
            .map(|fragment| fragment.to_update(&self.tables))
            .collect()
    }

    /// Evaluated once; later calls return the memoized result.
    pub fn check_condition(&self, data: &TxnData) -> anyhow::Result<bool> {
        match self.condition_result.load(AtomicOrdering::Acquire) {
            CONDITION_TRUE => return Ok(true),
            CONDITION_FALSE => return Ok(false),
            _ => {}
        }
        let condition = self.condition.get(&self.tables)?;
        let met = condition.applies(data)?;
        tracing::debug!(met, "evaluated txn condition");
        let state = if met { CONDITION_TRUE } else { CONDITION_FALSE };
        self.condition_result.store(state, AtomicOrdering::Release);
        Ok(met)
    }

    pub fn fail_condition(&self) {
        self.condition_result
            .store(CONDITION_FALSE, AtomicOrdering::Release);
    }

    /// Forget the memoized condition result. Test use only.
    pub fn unsafe_reset_condition(&self) {
        self.condition_result
            .store(CONDITION_UNKNOWN, AtomicOrdering::Release);
    }

    pub fn unmemoize(&self) {
        self.condition.unmemoize();
    }

    fn blob_at(&self, slot: &FragmentSlot, version: Version) -> anyhow::Result<Bytes> {
        if slot.blob.is_empty() || blob_version(&slot.blob)? <= version {
            return Ok(slot.blob.clone());
        }
        tracing::debug!(key = %slot.key, version = ?version, "reserializing fragments");
        let fragments = decode_fragments(&slot.key, &self.tables, &slot.blob)?;
        encode_fragments(&fragments, &self.tables, version)
    }
}

impl Clone for TxnUpdate {
    fn clone(&self) -> Self {
        let copy = self.with_slots(self.slots.clone());
        copy.condition_result.store(
            self.condition_result.load(AtomicOrdering::Acquire),
            AtomicOrdering::Release,
        );
        copy
    }
}

impl PartialEq for TxnUpdate {
    fn eq(&self, other: &Self) -> bool {
        self.tables == other.tables
            && self.slots == other.slots
            && self.condition == other.condition
            && self.cl == other.cl
            && self.preserve_timestamps == other.preserve_timestamps
    }
}

impl Eq for TxnUpdate {}

impl WireFormat for TxnUpdate {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.condition_result.load(AtomicOrdering::Acquire) == CONDITION_UNKNOWN,
            "cannot serialize an update with an evaluated condition"
        );
        anyhow::ensure!(
            self.tables == *tables,
            "update built against {:?} serialized with {:?}",
            self.tables,
            tables
        );
        out.put_u8(if self.preserve_timestamps {
            FLAG_PRESERVE_TIMESTAMPS
        } else {
            0
        });
        self.keys().serialize(tables, out, version)?;
        write_bytes_with_vint_length(out, self.condition.bytes());
        write_unsigned_vint(out, self.slots.len() as u64);
        for slot in self.slots.iter() {
            write_bytes_with_vint_length(out, &self.blob_at(slot, version)?);
        }
        write_nullable_consistency_level(out, self.cl);
        Ok(())
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        let flags = input.read_u8()?;
        if flags & !FLAG_PRESERVE_TIMESTAMPS != 0 {
            return Err(TxnError::unknown("txn update flags", flags).into());
        }
        let keys = Keys::deserialize(tables, input, version)?;
        let condition = SerializedCondition::from_bytes(input.read_bytes_with_vint_length()?);
        let count = input.read_length()?;
        anyhow::ensure!(
            count == keys.len(),
            "{count} fragment groups for {} keys",
            keys.len()
        );
        let mut slots = Vec::with_capacity(count);
        for key in keys.iter() {
            slots.push(FragmentSlot {
                key: key.clone(),
                blob: input.read_bytes_with_vint_length()?,
            });
        }
        let cl = read_nullable_consistency_level(input)?;
        Ok(Self {
            tables: tables.clone(),
            slots: KeySorted::from_sorted(slots)?,
            condition,
            cl,
            preserve_timestamps: flags & FLAG_PRESERVE_TIMESTAMPS != 0,
            condition_result: AtomicU8::new(CONDITION_UNKNOWN),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::data::TxnDataName;
    use crate::reference::{ColumnReference, OperationKind, ReferenceValue};
    use crate::schema::{ColumnMetadata, ColumnType, TableId};
    use crate::store::MemoryStore;

    const T: TableId = TableId(4);

    fn table() -> Arc<TableMetadata> {
        let column = |name: &str, kind, column_type| ColumnMetadata {
            name: name.to_string(),
            kind,
            column_type,
            position: 0,
        };
        Arc::new(TableMetadata {
            id: T,
            keyspace: "ks".to_string(),
            name: "counters".to_string(),
            columns: vec![
                column("k", ColumnKind::PartitionKey, ColumnType::Blob),
                column("c", ColumnKind::Clustering, ColumnType::Blob),
                column("s", ColumnKind::Static, ColumnType::Int64),
                column("v", ColumnKind::Regular, ColumnType::Int64),
            ],
        })
    }

    fn int(value: i64) -> Bytes {
        Bytes::copy_from_slice(&value.to_be_bytes())
    }

    fn key(raw: &'static [u8]) -> PartitionKey {
        PartitionKey::new(T, raw)
    }

    fn row() -> Clustering {
        Clustering::of([Bytes::from_static(b"r")])
    }

    fn literal(raw: &'static [u8], value: i64) -> Fragment {
        let mut base = PartitionUpdate::new(key(raw));
        base.set(row(), 3, Cell::live(int(value), 1));
        Fragment::new(0, base, ReferenceOperations::none())
    }

    fn increment(raw: &'static [u8], by: i64) -> Fragment {
        let ops = ReferenceOperations {
            clustering: Some(row()),
            existing: Some(TxnDataName::auto_read(0)),
            statics: Vec::new(),
            regulars: vec![ReferenceOperation::new(
                OperationKind::Adder,
                3,
                ReferenceValue::Constant(Some(int(by))),
            )],
        };
        Fragment::new(1, PartitionUpdate::new(key(raw)), ops)
    }

    fn existing(raw: &'static [u8], value: i64) -> TxnData {
        let mut partition = FilteredPartition::empty(key(raw));
        let mut existing = Row::new(row());
        existing.cells.insert(3, Cell::live(int(value), 1));
        partition.rows.push(existing);
        TxnData::of(TxnDataName::auto_read(0), TxnDataValue::Key(partition))
    }

    fn update(fragments: Vec<Fragment>, condition: &TxnCondition) -> TxnUpdate {
        TxnUpdate::new(TableMetadatas::of(table()), fragments, condition, None, false).expect("update")
    }

    #[test]
    fn complete_fragment_equals_to_update() {
        let tables = TableMetadatas::of(table());
        let fragment = literal(b"a", 5);
        let params = FragmentParameters {
            data: &TxnData::new(),
            timestamp: 99,
        };
        assert_eq!(
            fragment.complete(&params, &tables).expect("complete"),
            fragment.to_update(&tables).expect("to update")
        );
    }

    #[test]
    fn completion_reads_existing_row_and_widens_columns() {
        let tables = TableMetadatas::of(table());
        let fragment = increment(b"a", 3);
        assert!(fragment.base.columns.is_empty());
        let params = FragmentParameters {
            data: &existing(b"a", 10),
            timestamp: 77,
        };
        let completed = fragment.complete(&params, &tables).expect("complete");
        let value = completed.get(&tables).expect("decode");
        assert!(value.columns.contains(&3));
        let cell = &value.row(&row()).expect("row").cells[&3];
        assert_eq!(cell.value, Some(int(13)));
        assert_eq!(cell.timestamp, 77);
    }

    #[test]
    fn apply_skips_complete_fragments() {
        let update = update(vec![literal(b"a", 1), increment(b"b", 2)], &TxnCondition::None);
        let store = MemoryStore::with_epoch(5);
        let execute_at = Timestamp::new(5, 1_000, 0, 1).expect("ts");
        let write = update.apply(&store, execute_at, &existing(b"b", 40)).expect("apply");
        assert!(write.is_condition_met());
        assert_eq!(write.updates().len(), 1);
        assert_eq!(write.updates()[0].key, key(b"b"));

        let literal_updates = update.complete_updates_for_key(&key(b"a")).expect("complete");
        assert_eq!(literal_updates.len(), 1);
        assert!(update.complete_updates_for_key(&key(b"b")).expect("none").is_empty());
    }

    #[test]
    fn apply_requires_current_epoch() {
        let update = update(vec![literal(b"a", 1)], &TxnCondition::None);
        let store = MemoryStore::with_epoch(2);
        let execute_at = Timestamp::new(3, 1, 0, 1).expect("ts");
        let err = update.apply(&store, execute_at, &TxnData::new()).expect_err("epoch");
        assert!(matches!(
            crate::error::classify(&err),
            Some(TxnError::EpochNotReady { required: 3, current: 2 })
        ));
    }

    #[test]
    fn failed_condition_is_sticky_until_reset() {
        let reference = ColumnReference::new(TxnDataName::auto_read(0), table(), 3).expect("reference");
        let condition = TxnCondition::Exists {
            kind: crate::condition::ExistsKind::IsNotNull,
            reference,
        };
        let update = update(vec![literal(b"a", 1)], &condition);
        let data = existing(b"a", 1);
        assert!(update.check_condition(&data).expect("check"));
        assert!(update.check_condition(&TxnData::new()).expect("memoized"));
        update.fail_condition();
        assert!(!update.check_condition(&data).expect("failed"));
        update.unsafe_reset_condition();
        assert!(!update.check_condition(&TxnData::new()).expect("re-evaluated"));
    }

    #[test]
    fn serialize_rejects_evaluated_condition() {
        let update = update(vec![literal(b"a", 1)], &TxnCondition::None);
        let tables = TableMetadatas::of(table());
        let bytes = update.to_bytes(&tables, Version::LATEST).expect("encode");
        let decoded = TxnUpdate::from_bytes(&tables, &bytes, Version::LATEST).expect("decode");
        assert_eq!(decoded, update);
        update.fail_condition();
        assert!(update.to_bytes(&tables, Version::LATEST).is_err());
    }
}
