//! Materialized writes: fully resolved partition updates ready to persist.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::{BufMut, Bytes};
use futures_util::{future, stream, StreamExt, TryStreamExt};

use crate::codec::{
    deserialize_list, serialize_list, write_bool, write_bytes_with_vint_length, Reader, Version,
    WireFormat,
};
use crate::config::ExecutionContext;
use crate::keys::{Keys, Participants, PartitionKey, Ranges};
use crate::memo::Memoized;
use crate::partition::PartitionUpdate;
use crate::schema::{Schema, TableMetadatas};
use crate::sorted::{KeySorted, KeySortedItem};
use crate::timestamp::{Timestamp, TxnId};
use crate::txn::PartialTxn;

/// A resolved update to one partition. The bytes omit the key and are kept
/// at the latest version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub key: PartitionKey,
    pub index: u32,
    bytes: Memoized<PartitionUpdate>,
}

fn encode_body(update: &PartitionUpdate, version: Version) -> Bytes {
    let mut out = Vec::new();
    update.serialize_without_key(&mut out, version);
    Bytes::from(out)
}

fn decode_body(
    key: &PartitionKey,
    tables: &TableMetadatas,
    raw: &[u8],
    version: Version,
) -> anyhow::Result<PartitionUpdate> {
    let mut input = Reader::new(raw);
    let update = PartitionUpdate::deserialize_with_key(key.clone(), tables, &mut input, version)?;
    anyhow::ensure!(input.is_empty(), "trailing bytes after update of {key}");
    Ok(update)
}

impl Update {
    pub fn new(
        key: PartitionKey,
        index: u32,
        update: &PartitionUpdate,
        tables: &TableMetadatas,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(update.key == key, "update of {} filed under {key}", update.key);
        tables.get(key.table)?;
        let bytes = encode_body(update, Version::LATEST);
        Ok(Self {
            key,
            index,
            bytes: Memoized::with_value(bytes, update.clone()),
        })
    }

    pub fn get(&self, tables: &TableMetadatas) -> anyhow::Result<Arc<PartitionUpdate>> {
        self.bytes
            .get(|raw| decode_body(&self.key, tables, raw, Version::LATEST))
    }

    fn bytes_at(&self, tables: &TableMetadatas, version: Version) -> anyhow::Result<Bytes> {
        if version == Version::LATEST {
            return Ok(self.bytes.bytes().clone());
        }
        Ok(encode_body(&*self.get(tables)?, version))
    }

    pub fn unmemoize(&self) {
        self.bytes.unmemoize();
    }

    /// Persist through the context's store, stamping every cell with
    /// `timestamp` unless `preserve_timestamps` is set.
    pub async fn write(
        &self,
        ctx: &ExecutionContext,
        tables: &TableMetadatas,
        preserve_timestamps: bool,
        timestamp: i64,
    ) -> anyhow::Result<()> {
        let update = self.get(tables)?;
        let update = if preserve_timestamps {
            PartitionUpdate::clone(&update)
        } else {
            update.with_timestamp(timestamp)
        };
        ctx.store().apply_mutation(update).await
    }
}

impl KeySortedItem for Update {
    type Key = PartitionKey;

    fn key(&self) -> &PartitionKey {
        &self.key
    }

    fn tie_break(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl WireFormat for Update {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        self.key.serialize(tables, out, version)?;
        out.put_u32(self.index);
        write_bytes_with_vint_length(out, &self.bytes_at(tables, version)?);
        Ok(())
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        let key = PartitionKey::deserialize(tables, input, version)?;
        let index = input.read_u32()?;
        let mut bytes = input.read_bytes_with_vint_length()?;
        if version != Version::LATEST {
            tracing::debug!(key = %key, version = ?version, "reserializing update at latest version");
            let update = decode_body(&key, tables, &bytes, version)?;
            bytes = encode_body(&update, Version::LATEST);
        }
        Ok(Self {
            key,
            index,
            bytes: Memoized::from_bytes(bytes),
        })
    }
}

/// Writes produced by applying a `TxnUpdate`, sorted by key then index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnWrite {
    tables: TableMetadatas,
    updates: KeySorted<Update>,
    is_condition_met: bool,
}

impl TxnWrite {
    pub fn new(tables: TableMetadatas, updates: Vec<Update>, is_condition_met: bool) -> Self {
        Self {
            tables,
            updates: KeySorted::new(updates),
            is_condition_met,
        }
    }

    /// The result of an update whose condition failed.
    pub fn empty_condition_failed() -> Self {
        Self::new(TableMetadatas::none(), Vec::new(), false)
    }

    pub fn is_empty_condition_failed(&self) -> bool {
        !self.is_condition_met && self.updates.is_empty()
    }

    pub fn is_condition_met(&self) -> bool {
        self.is_condition_met
    }

    pub fn tables(&self) -> &TableMetadatas {
        &self.tables
    }

    pub fn updates(&self) -> &[Update] {
        self.updates.items()
    }

    pub fn keys(&self) -> Keys {
        Keys::of(self.updates.keys())
    }

    pub fn slice(&self, ranges: &Ranges) -> Self {
        Self {
            tables: self.tables.clone(),
            updates: self.updates.slice(ranges, |update, _| Some(update.clone())),
            is_condition_met: self.is_condition_met,
        }
    }

    pub fn intersecting(&self, participants: &Participants) -> Self {
        let keys = self.keys().intersecting(participants);
        Self {
            tables: self.tables.clone(),
            updates: self.updates.select(keys.as_slice()),
            is_condition_met: self.is_condition_met,
        }
    }

    pub fn merge(&self, other: &TxnWrite) -> anyhow::Result<TxnWrite> {
        anyhow::ensure!(
            self.is_condition_met == other.is_condition_met,
            "cannot merge writes that disagree on the condition"
        );
        Ok(Self {
            tables: self.tables.merge(&other.tables),
            updates: self.updates.merge(&other.updates),
            is_condition_met: self.is_condition_met,
        })
    }

    pub fn unmemoize(&self) {
        for update in self.updates.iter() {
            update.unmemoize();
        }
    }

    /// Persist every write for `key`: updates completed from read results,
    /// plus the literal fragments still held by the transaction's update.
    /// All writes share one timestamp and run concurrently; the first
    /// failure fails the apply.
    pub async fn apply(
        &self,
        key: &PartitionKey,
        txn_id: TxnId,
        execute_at: Timestamp,
        txn: &PartialTxn,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        let Some(update) = txn.update() else {
            tracing::debug!(txn_id = %txn_id, "read-only txn, nothing to write");
            return Ok(());
        };
        if !self.is_condition_met {
            tracing::debug!(txn_id = %txn_id, "txn condition not met, nothing to write");
            return Ok(());
        }
        let timestamp = execute_at.unique_hlc();
        let preserve = update.preserve_timestamps();
        let literal = update.complete_updates_for_key(key)?;
        let writes: Vec<(&Update, &TableMetadatas)> = self
            .updates
            .with_key(key)
            .into_iter()
            .map(|write| (write, &self.tables))
            .chain(literal.iter().map(|write| (write, update.tables())))
            .collect();
        if writes.is_empty() {
            return Ok(());
        }
        tracing::debug!(txn_id = %txn_id, key = %key, writes = writes.len(), "applying txn writes");
        stream::iter(writes.into_iter().map(|(write, tables)| async move {
            let result = write.write(ctx, tables, preserve, timestamp).await;
            if let Err(err) = &result {
                tracing::warn!(error = ?err, key = %write.key, index = write.index, "txn write failed");
            }
            result
        }))
        .buffer_unordered(ctx.config().apply_concurrency)
        .try_for_each(|()| future::ready(Ok(())))
        .await
    }
}

impl WireFormat for TxnWrite {
    type Context = Schema;

    fn serialize(&self, _: &Schema, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        self.tables.serialize_self(out);
        write_bool(out, self.is_condition_met);
        serialize_list(self.updates.items(), &self.tables, out, version)
    }

    fn deserialize(schema: &Schema, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        let tables = TableMetadatas::deserialize_self(schema, input)?;
        let is_condition_met = input.read_bool()?;
        let updates: Vec<Update> = deserialize_list(&tables, input, version)?;
        Ok(Self {
            updates: KeySorted::from_sorted(updates)?,
            tables,
            is_condition_met,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{Cell, Clustering};
    use crate::schema::{ColumnKind, ColumnMetadata, ColumnType, TableId, TableMetadata};

    const T: TableId = TableId(8);

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.add(TableMetadata {
            id: T,
            keyspace: "ks".to_string(),
            name: "t".to_string(),
            columns: vec![
                ColumnMetadata {
                    name: "k".to_string(),
                    kind: ColumnKind::PartitionKey,
                    column_type: ColumnType::Blob,
                    position: 0,
                },
                ColumnMetadata {
                    name: "v".to_string(),
                    kind: ColumnKind::Static,
                    column_type: ColumnType::Text,
                    position: 0,
                },
            ],
        });
        schema
    }

    fn tables(schema: &Schema) -> TableMetadatas {
        TableMetadatas::of(Arc::clone(schema.get(T).expect("table")))
    }

    fn update(tables: &TableMetadatas, raw: &'static [u8], index: u32, ts: i64) -> Update {
        let mut body = PartitionUpdate::new(PartitionKey::new(T, raw));
        body.set(Clustering::STATIC, 1, Cell::live(&b"value"[..], ts));
        Update::new(body.key.clone(), index, &body, tables).expect("update")
    }

    #[test]
    fn sorted_by_key_then_index() {
        let schema = schema();
        let tables = tables(&schema);
        let write = TxnWrite::new(
            tables.clone(),
            vec![
                update(&tables, b"b", 0, 1),
                update(&tables, b"a", 2, 1),
                update(&tables, b"a", 1, 1),
            ],
            true,
        );
        let order: Vec<_> = write.updates().iter().map(|u| (u.key.key.clone(), u.index)).collect();
        assert_eq!(
            order,
            vec![
                (Bytes::from_static(b"a"), 1),
                (Bytes::from_static(b"a"), 2),
                (Bytes::from_static(b"b"), 0)
            ]
        );
    }

    #[test]
    fn round_trips_across_versions() {
        let schema = schema();
        let tables = tables(&schema);
        let write = TxnWrite::new(
            tables.clone(),
            vec![update(&tables, b"a", 0, 1_000), update(&tables, b"b", 0, 1_001)],
            true,
        );
        for version in [Version::V1, Version::V2] {
            let bytes = write.to_bytes(&schema, version).expect("encode");
            let decoded = TxnWrite::from_bytes(&schema, &bytes, version).expect("decode");
            assert_eq!(decoded, write, "{version:?}");
        }
        let failed = TxnWrite::empty_condition_failed();
        let bytes = failed.to_bytes(&schema, Version::LATEST).expect("encode");
        let decoded = TxnWrite::from_bytes(&schema, &bytes, Version::LATEST).expect("decode");
        assert!(decoded.is_empty_condition_failed());
    }

    #[test]
    fn merge_requires_matching_condition_outcome() {
        let schema = schema();
        let tables = tables(&schema);
        let met = TxnWrite::new(tables.clone(), vec![update(&tables, b"a", 0, 1)], true);
        let other = TxnWrite::new(tables.clone(), vec![update(&tables, b"b", 0, 1)], true);
        let merged = met.merge(&other).expect("merge");
        assert_eq!(merged.updates().len(), 2);
        assert_eq!(merged.merge(&met).expect("idempotent"), merged);
        assert!(met.merge(&TxnWrite::empty_condition_failed()).is_err());
    }
}
