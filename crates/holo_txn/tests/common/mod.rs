//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use holo_txn::config::{CodecConfig, ExecutionContext};
use holo_txn::keys::PartitionKey;
use holo_txn::partition::{Cell, Clustering, PartitionUpdate};
use holo_txn::reference::ReferenceOperations;
use holo_txn::schema::{
    ColumnKind, ColumnMetadata, ColumnType, Schema, TableId, TableMetadata, TableMetadatas,
};
use holo_txn::store::MemoryStore;
use holo_txn::update::Fragment;

/// Table used by every test: `(k blob, c blob, s bigint static, v bigint)`.
pub const ACCOUNTS: TableId = TableId(11);
/// Second table, used where a registry with more than one entry matters.
pub const AUDIT: TableId = TableId(12);

pub const STATIC_COL: u16 = 2;
pub const VALUE_COL: u16 = 3;

/// Install a fmt subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn table(id: TableId, name: &str) -> TableMetadata {
    let column = |name: &str, kind, column_type| ColumnMetadata {
        name: name.to_string(),
        kind,
        column_type,
        position: 0,
    };
    TableMetadata {
        id,
        keyspace: "bank".to_string(),
        name: name.to_string(),
        columns: vec![
            column("k", ColumnKind::PartitionKey, ColumnType::Blob),
            column("c", ColumnKind::Clustering, ColumnType::Blob),
            column("s", ColumnKind::Static, ColumnType::Int64),
            column("v", ColumnKind::Regular, ColumnType::Int64),
        ],
    }
}

pub fn schema() -> Schema {
    let mut schema = Schema::new();
    schema.add(table(ACCOUNTS, "accounts"));
    schema.add(table(AUDIT, "audit"));
    schema
}

pub fn accounts(schema: &Schema) -> Arc<TableMetadata> {
    Arc::clone(schema.get(ACCOUNTS).expect("accounts table"))
}

pub fn tables(schema: &Schema) -> TableMetadatas {
    TableMetadatas::of(accounts(schema))
}

pub fn both_tables(schema: &Schema) -> TableMetadatas {
    TableMetadatas::of_sorted_unique(vec![
        accounts(schema),
        Arc::clone(schema.get(AUDIT).expect("audit table")),
    ])
    .expect("registry")
}

pub fn key(raw: &'static [u8]) -> PartitionKey {
    PartitionKey::new(ACCOUNTS, raw)
}

pub fn int(value: i64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

pub fn row() -> Clustering {
    Clustering::of([Bytes::from_static(b"row")])
}

/// A partition update setting `v = value` on the test row.
pub fn balance(raw: &'static [u8], value: i64, timestamp: i64) -> PartitionUpdate {
    let mut update = PartitionUpdate::new(key(raw));
    update.set(row(), VALUE_COL, Cell::live(int(value), timestamp));
    update
}

/// A fragment that needs no read results.
pub fn literal(raw: &'static [u8], value: i64) -> Fragment {
    Fragment::new(0, balance(raw, value, 1), ReferenceOperations::none())
}

pub fn context(store: Arc<MemoryStore>) -> ExecutionContext {
    ExecutionContext::new(store, CodecConfig::from_env())
}
