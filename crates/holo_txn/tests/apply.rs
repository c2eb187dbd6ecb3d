//! Executing reads and writes against the in-memory store.

mod common;

use std::sync::Arc;

use holo_txn::condition::TxnCondition;
use holo_txn::data::{TxnDataName, TxnDataValue};
use holo_txn::keys::{Domain, KeyRange, Keys, Seekable, Seekables};
use holo_txn::partition::{Clustering, PartitionUpdate};
use holo_txn::read::{ReadCommand, TxnRead};
use holo_txn::reference::{
    ColumnReference, OperationKind, ReferenceOperation, ReferenceOperations, ReferenceValue,
};
use holo_txn::store::{DataStore, MemoryStore};
use holo_txn::timestamp::{Timestamp, TxnId, TxnKind};
use holo_txn::txn::PartialTxn;
use holo_txn::update::{Fragment, TxnUpdate};

use common::{balance, int, key, row, schema, tables, ACCOUNTS, VALUE_COL};

fn value(partition: &PartitionUpdate) -> Option<bytes::Bytes> {
    partition
        .row(&row())
        .and_then(|row| row.value(VALUE_COL))
        .cloned()
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::with_epoch(2));
    store.apply_mutation(balance(b"k1", 10, 1)).await.expect("seed k1");
    store.apply_mutation(balance(b"k2", 4, 1)).await.expect("seed k2");
    store
}

/// Move k1's balance onto k2 and record a literal row on k3.
fn transfer(schema: &holo_txn::schema::Schema) -> PartialTxn {
    let tables = tables(schema);
    let read = TxnRead::serial(
        tables.clone(),
        vec![
            (key(b"k1"), ReadCommand::all(ACCOUNTS)),
            (key(b"k2"), ReadCommand::all(ACCOUNTS)),
        ],
        None,
    )
    .expect("read");

    let drain = ReferenceOperations {
        clustering: Some(row()),
        existing: Some(TxnDataName::user(0)),
        statics: Vec::new(),
        regulars: vec![ReferenceOperation::new(
            OperationKind::Setter,
            VALUE_COL,
            ReferenceValue::Constant(Some(int(0))),
        )],
    };
    let source = ColumnReference::new(TxnDataName::user(0), common::accounts(schema), VALUE_COL)
        .expect("reference");
    let credit = ReferenceOperations {
        clustering: Some(row()),
        existing: Some(TxnDataName::user(1)),
        statics: Vec::new(),
        regulars: vec![ReferenceOperation::new(
            OperationKind::Adder,
            VALUE_COL,
            ReferenceValue::Substitution(source),
        )],
    };
    let update = TxnUpdate::new(
        tables.clone(),
        vec![
            Fragment::new(0, PartitionUpdate::new(key(b"k1")), drain),
            Fragment::new(1, PartitionUpdate::new(key(b"k2")), credit),
            common::literal(b"k3", 99),
        ],
        &TxnCondition::None,
        None,
        false,
    )
    .expect("update");
    let keys = Keys::of(vec![key(b"k1"), key(b"k2"), key(b"k3")]);
    PartialTxn::new(TxnKind::Write, tables, Seekables::Keys(keys), read, Some(update)).expect("txn")
}

#[tokio::test]
async fn transfer_reads_completes_and_persists() {
    common::init_tracing();
    let schema = schema();
    let store = seeded_store().await;
    let ctx = common::context(Arc::clone(&store));
    let txn = transfer(&schema);
    let txn_id = TxnId::new(2, 900, TxnKind::Write, Domain::Key, 1).expect("txn id");
    let execute_at = Timestamp::new(2, 1_000, 0, 1).expect("execute at");

    let mut data = holo_txn::data::TxnData::new();
    for raw in [&b"k1"[..], &b"k2"[..]] {
        let seekable = Seekable::Key(holo_txn::keys::PartitionKey::new(ACCOUNTS, raw));
        let partial = txn.read().read(&seekable, execute_at, &ctx).await.expect("read");
        data = data.merge(partial).expect("merge data");
    }
    assert_eq!(data.len(), 2);

    let update = txn.update().expect("update");
    let write = update.apply(store.as_ref(), execute_at, &data).expect("apply update");
    assert_eq!(write.updates().len(), 2);

    for raw in [&b"k1"[..], &b"k2"[..], &b"k3"[..]] {
        let key = holo_txn::keys::PartitionKey::new(ACCOUNTS, raw);
        write.apply(&key, txn_id, execute_at, &txn, &ctx).await.expect("apply write");
    }
    assert_eq!(store.mutation_count(), 5);

    let k1 = store.partition(&key(b"k1")).expect("k1");
    let k2 = store.partition(&key(b"k2")).expect("k2");
    let k3 = store.partition(&key(b"k3")).expect("k3");
    assert_eq!(value(&k1), Some(int(0)));
    assert_eq!(value(&k2), Some(int(14)));
    assert_eq!(value(&k3), Some(int(99)));
    let cell = &k3.row(&row()).expect("k3 row").cells[&VALUE_COL];
    assert_eq!(cell.timestamp, execute_at.unique_hlc());
}

#[tokio::test]
async fn write_failure_fails_the_apply() {
    common::init_tracing();
    let schema = schema();
    let store = seeded_store().await;
    store.fail_writes_for(key(b"k3"));
    let ctx = common::context(Arc::clone(&store));
    let txn = transfer(&schema);
    let txn_id = TxnId::new(2, 900, TxnKind::Write, Domain::Key, 1).expect("txn id");
    let execute_at = Timestamp::new(2, 1_000, 0, 1).expect("execute at");

    let write = txn
        .update()
        .expect("update")
        .apply(store.as_ref(), execute_at, &holo_txn::data::TxnData::new());
    // Completing k2 substitutes k1's balance, which was never read.
    assert!(write.is_err());

    let literal_only = holo_txn::write::TxnWrite::new(
        tables(&schema),
        Vec::new(),
        true,
    );
    let err = literal_only
        .apply(&key(b"k3"), txn_id, execute_at, &txn, &ctx)
        .await
        .expect_err("injected failure");
    assert!(err.to_string().contains("injected write failure"));
    assert!(store.partition(&key(b"k3")).is_none());
}

#[tokio::test]
async fn range_reads_return_partitions_in_key_order() {
    let schema = schema();
    let store = seeded_store().await;
    let ctx = common::context(Arc::clone(&store));
    let range = KeyRange::full(ACCOUNTS);
    let read = TxnRead::range(tables(&schema), range.clone(), &ReadCommand::all(ACCOUNTS)).expect("read");
    let execute_at = Timestamp::new(2, 5, 0, 1).expect("execute at");

    let data = read.read(&Seekable::Range(range), execute_at, &ctx).await.expect("read");
    let Some(TxnDataValue::Range(partitions)) = data.get(TxnDataName::user(0)) else {
        panic!("expected a range result, got {data:?}");
    };
    let keys: Vec<_> = partitions.iter().map(|p| p.key.clone()).collect();
    assert_eq!(keys, vec![key(b"k1"), key(b"k2")]);
    assert!(partitions
        .iter()
        .all(|p| p.row(&Clustering::of([bytes::Bytes::from_static(b"row")])).is_some()));
}
