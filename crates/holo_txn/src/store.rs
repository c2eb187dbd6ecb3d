//! Storage seams the transaction layer executes against, plus an in-memory
//! implementation used by tests and single-process setups.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::keys::{KeyRange, PartitionKey};
use crate::partition::{FilteredPartition, PartitionUpdate};
use crate::read::ReadCommand;

/// Local partition storage.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    async fn read_partition(
        &self,
        key: &PartitionKey,
        command: &ReadCommand,
    ) -> anyhow::Result<FilteredPartition>;

    /// Non-empty partitions of `command.table` within `range`, in key order.
    async fn read_range(
        &self,
        range: &KeyRange,
        command: &ReadCommand,
    ) -> anyhow::Result<Vec<FilteredPartition>>;

    async fn apply_mutation(&self, update: PartitionUpdate) -> anyhow::Result<()>;
}

/// Source of the cluster metadata epoch known locally.
pub trait ClusterEpoch: Send + Sync {
    fn current_epoch(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: RwLock<BTreeMap<PartitionKey, PartitionUpdate>>,
    epoch: AtomicU64,
    mutations: AtomicU64,
    failing: RwLock<BTreeSet<PartitionKey>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_epoch(epoch: u64) -> Self {
        let store = Self::new();
        store.set_epoch(epoch);
        store
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Release);
    }

    /// Number of mutations applied so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Acquire)
    }

    /// Make every later mutation of `key` fail.
    pub fn fail_writes_for(&self, key: PartitionKey) {
        self.failing.write().expect("failing keys lock").insert(key);
    }

    /// Stored state of `key`, tombstones included.
    pub fn partition(&self, key: &PartitionKey) -> Option<PartitionUpdate> {
        self.partitions
            .read()
            .expect("partitions lock")
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn read_partition(
        &self,
        key: &PartitionKey,
        command: &ReadCommand,
    ) -> anyhow::Result<FilteredPartition> {
        let partitions = self.partitions.read().expect("partitions lock");
        Ok(command.filter(key, partitions.get(key)))
    }

    async fn read_range(
        &self,
        range: &KeyRange,
        command: &ReadCommand,
    ) -> anyhow::Result<Vec<FilteredPartition>> {
        anyhow::ensure!(
            range.table() == command.table,
            "range {range} read with a command for {}",
            command.table
        );
        let partitions = self.partitions.read().expect("partitions lock");
        Ok(partitions
            .iter()
            .filter(|(key, _)| key.table == command.table && range.contains(&key.routing()))
            .map(|(key, stored)| command.filter(key, Some(stored)))
            .filter(|partition| !partition.is_empty())
            .collect())
    }

    async fn apply_mutation(&self, update: PartitionUpdate) -> anyhow::Result<()> {
        if self
            .failing
            .read()
            .expect("failing keys lock")
            .contains(&update.key)
        {
            anyhow::bail!("injected write failure for {}", update.key);
        }
        let mut partitions = self.partitions.write().expect("partitions lock");
        match partitions.get_mut(&update.key) {
            Some(existing) => existing.absorb(&update),
            None => {
                partitions.insert(update.key.clone(), update);
            }
        }
        self.mutations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl ClusterEpoch for MemoryStore {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RoutingKey;
    use crate::partition::{Cell, Clustering};
    use crate::schema::TableId;

    const T: TableId = TableId(3);

    fn update(key: &'static [u8], value: &'static [u8], ts: i64) -> PartitionUpdate {
        let mut update = PartitionUpdate::new(PartitionKey::new(T, key));
        update.set(Clustering::STATIC, 1, Cell::live(value, ts));
        update
    }

    #[tokio::test]
    async fn writes_merge_last_write_wins() {
        let store = MemoryStore::new();
        store.apply_mutation(update(b"k", b"new", 10)).await.expect("first");
        store.apply_mutation(update(b"k", b"old", 5)).await.expect("second");
        let read = store
            .read_partition(&PartitionKey::new(T, &b"k"[..]), &ReadCommand::all(T))
            .await
            .expect("read");
        assert_eq!(read.static_row.value(1).map(|v| v.as_ref()), Some(&b"new"[..]));
        assert_eq!(store.mutation_count(), 2);
    }

    #[tokio::test]
    async fn range_reads_and_injected_failures() {
        let store = MemoryStore::with_epoch(4);
        for key in [&b"a"[..], &b"c"[..], &b"x"[..]] {
            store.apply_mutation(update(key, b"v", 1)).await.expect("write");
        }
        let range = KeyRange::new(RoutingKey::token(T, &b"b"[..]), RoutingKey::token(T, &b"x"[..]))
            .expect("range");
        let found = store.read_range(&range, &ReadCommand::all(T)).await.expect("range");
        let keys: Vec<_> = found.iter().map(|p| p.key.key.clone()).collect();
        assert_eq!(keys, vec![bytes::Bytes::from_static(b"c"), bytes::Bytes::from_static(b"x")]);

        store.fail_writes_for(PartitionKey::new(T, &b"a"[..]));
        assert!(store.apply_mutation(update(b"a", b"w", 2)).await.is_err());
        assert_eq!(store.current_epoch(), 4);
    }
}
