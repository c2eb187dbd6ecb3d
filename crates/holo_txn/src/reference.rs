//! Values computed from earlier reads, and the column operations that use
//! them to complete a pending write.

use std::sync::Arc;

use bytes::{BufMut, Bytes};

use crate::codec::{
    deserialize_list, serialize_list, write_bool, write_nullable_bytes, write_unsigned_vint,
    Reader, Version, WireFormat,
};
use crate::data::{TxnData, TxnDataName, TxnDataValue};
use crate::error::TxnError;
use crate::partition::Clustering;
use crate::schema::{Collector, ColumnId, ColumnKind, ColumnMetadata, ColumnType, TableMetadata, TableMetadatas};

/// One column of the partition bound to a txn data name.
#[derive(Clone, Debug)]
pub struct ColumnReference {
    pub tuple: TxnDataName,
    pub table: Arc<TableMetadata>,
    pub column: ColumnId,
}

impl ColumnReference {
    pub fn new(tuple: TxnDataName, table: Arc<TableMetadata>, column: ColumnId) -> anyhow::Result<Self> {
        table.column(column)?;
        Ok(Self {
            tuple,
            table,
            column,
        })
    }

    pub fn metadata(&self) -> anyhow::Result<&ColumnMetadata> {
        self.table.column(self.column)
    }

    pub fn column_type(&self) -> anyhow::Result<ColumnType> {
        Ok(self.metadata()?.column_type)
    }

    /// Value of the column; the referenced result must be present.
    pub fn resolve(&self, data: &TxnData) -> anyhow::Result<Option<Bytes>> {
        let value = data.get(self.tuple).ok_or(TxnError::UnresolvedReference {
            name: self.tuple.as_u32(),
        })?;
        self.extract(value)
    }

    /// Like `resolve`, but a missing result reads as null.
    pub fn resolve_if_present(&self, data: &TxnData) -> anyhow::Result<Option<Bytes>> {
        match data.get(self.tuple) {
            Some(value) => self.extract(value),
            None => Ok(None),
        }
    }

    fn extract(&self, value: &TxnDataValue) -> anyhow::Result<Option<Bytes>> {
        let TxnDataValue::Key(partition) = value else {
            anyhow::bail!("column reference into range result {:?}", self.tuple);
        };
        anyhow::ensure!(
            partition.key.table == self.table.id,
            "reference to {} resolved against partition of {}",
            self.table.id,
            partition.key.table
        );
        let column = self.metadata()?;
        let position = usize::from(column.position);
        Ok(match column.kind {
            ColumnKind::PartitionKey => {
                anyhow::ensure!(position == 0, "composite partition keys are not addressable");
                (!partition.is_empty()).then(|| partition.key.key.clone())
            }
            ColumnKind::Clustering => partition
                .single_row()?
                .and_then(|row| row.clustering.get(position).cloned()),
            ColumnKind::Static => partition.static_row.value(self.column).cloned(),
            ColumnKind::Regular => partition
                .single_row()?
                .and_then(|row| row.value(self.column).cloned()),
        })
    }

    pub fn collect(&self, collector: &mut Collector) {
        collector.add(&self.table);
    }
}

impl PartialEq for ColumnReference {
    fn eq(&self, other: &Self) -> bool {
        self.tuple == other.tuple && self.table.id == other.table.id && self.column == other.column
    }
}

impl Eq for ColumnReference {}

impl WireFormat for ColumnReference {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, _: Version) -> anyhow::Result<()> {
        write_unsigned_vint(out, u64::from(self.tuple.as_u32()));
        tables.serialize_table(self.table.id, out)?;
        write_unsigned_vint(out, u64::from(self.column));
        Ok(())
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, _: Version) -> anyhow::Result<Self> {
        let tuple = TxnDataName::from_u32(input.read_unsigned_vint32()?)?;
        let table = tables.deserialize_table(input)?;
        let column = u16::try_from(input.read_unsigned_vint()?)
            .map_err(|_| anyhow::anyhow!("column id out of range"))?;
        Self::new(tuple, table, column)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReferenceValue {
    Constant(Option<Bytes>),
    Substitution(ColumnReference),
}

impl ReferenceValue {
    /// Produce the value in `receiver`'s encoding.
    pub fn compute(&self, data: &TxnData, receiver: ColumnType) -> anyhow::Result<Option<Bytes>> {
        match self {
            ReferenceValue::Constant(value) => Ok(value.clone()),
            ReferenceValue::Substitution(reference) => match reference.resolve(data)? {
                Some(value) => reference
                    .column_type()?
                    .convert(value, receiver)
                    .map(Some),
                None => Ok(None),
            },
        }
    }

    pub fn collect(&self, collector: &mut Collector) {
        if let ReferenceValue::Substitution(reference) = self {
            reference.collect(collector);
        }
    }
}

impl WireFormat for ReferenceValue {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        match self {
            ReferenceValue::Constant(value) => {
                write_unsigned_vint(out, 0);
                write_nullable_bytes(out, value.as_deref());
                Ok(())
            }
            ReferenceValue::Substitution(reference) => {
                write_unsigned_vint(out, 1);
                reference.serialize(tables, out, version)
            }
        }
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        match input.read_unsigned_vint()? {
            0 => Ok(ReferenceValue::Constant(input.read_nullable_bytes()?)),
            1 => Ok(ReferenceValue::Substitution(ColumnReference::deserialize(
                tables, input, version,
            )?)),
            other => Err(TxnError::unknown("reference value", other).into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Setter,
    Adder,
    Subtracter,
    Appender,
    Prepender,
    /// Deletes the cell when it currently holds the operand.
    Discarder,
}

impl OperationKind {
    fn to_u8(self) -> u8 {
        match self {
            OperationKind::Setter => 0,
            OperationKind::Adder => 1,
            OperationKind::Subtracter => 2,
            OperationKind::Appender => 3,
            OperationKind::Prepender => 4,
            OperationKind::Discarder => 5,
        }
    }

    fn from_u8(raw: u8) -> anyhow::Result<Self> {
        Ok(match raw {
            0 => OperationKind::Setter,
            1 => OperationKind::Adder,
            2 => OperationKind::Subtracter,
            3 => OperationKind::Appender,
            4 => OperationKind::Prepender,
            5 => OperationKind::Discarder,
            other => return Err(TxnError::unknown("reference operation", other).into()),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceOperation {
    pub kind: OperationKind,
    pub column: ColumnId,
    pub value: ReferenceValue,
}

impl ReferenceOperation {
    pub fn new(kind: OperationKind, column: ColumnId, value: ReferenceValue) -> Self {
        Self {
            kind,
            column,
            value,
        }
    }

    /// New value for the receiver column given its current value.
    pub fn apply(
        &self,
        table: &TableMetadata,
        current: Option<&Bytes>,
        data: &TxnData,
    ) -> anyhow::Result<Option<Bytes>> {
        let receiver = table.column(self.column)?.column_type;
        let operand = self.value.compute(data, receiver)?;
        if let Some(operand) = &operand {
            receiver.validate(operand)?;
        }
        let base = || {
            current
                .cloned()
                .or_else(|| receiver.zero())
                .ok_or_else(|| anyhow::anyhow!("{receiver:?} column has no additive identity"))
        };
        Ok(match (self.kind, operand) {
            (OperationKind::Setter, operand) => operand,
            (OperationKind::Discarder, operand) => {
                if current.is_some() && current == operand.as_ref() {
                    None
                } else {
                    current.cloned()
                }
            }
            (_, None) => current.cloned(),
            (OperationKind::Adder, Some(operand)) => Some(receiver.add(&base()?, &operand)?),
            (OperationKind::Subtracter, Some(operand)) => {
                Some(receiver.subtract(&base()?, &operand)?)
            }
            (OperationKind::Appender, Some(operand)) => {
                ensure_concatenable(receiver)?;
                Some(receiver.add(&base()?, &operand)?)
            }
            (OperationKind::Prepender, Some(operand)) => {
                ensure_concatenable(receiver)?;
                Some(receiver.add(&operand, &base()?)?)
            }
        })
    }

    pub fn collect(&self, collector: &mut Collector) {
        self.value.collect(collector);
    }
}

fn ensure_concatenable(column_type: ColumnType) -> anyhow::Result<()> {
    anyhow::ensure!(
        matches!(column_type, ColumnType::Text | ColumnType::Ascii | ColumnType::Blob),
        "cannot append to {column_type:?} column"
    );
    Ok(())
}

impl WireFormat for ReferenceOperation {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        out.put_u8(self.kind.to_u8());
        write_unsigned_vint(out, u64::from(self.column));
        self.value.serialize(tables, out, version)
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        let kind = OperationKind::from_u8(input.read_u8()?)?;
        let column = u16::try_from(input.read_unsigned_vint()?)
            .map_err(|_| anyhow::anyhow!("column id out of range"))?;
        let value = ReferenceValue::deserialize(tables, input, version)?;
        Ok(Self {
            kind,
            column,
            value,
        })
    }
}

/// Operations against one row of a fragment's partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceOperations {
    /// Target row for regular operations; static operations ignore it.
    pub clustering: Option<Clustering>,
    /// Auto-read holding the target row's existing state.
    pub existing: Option<TxnDataName>,
    pub statics: Vec<ReferenceOperation>,
    pub regulars: Vec<ReferenceOperation>,
}

impl ReferenceOperations {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.statics.is_empty() && self.regulars.is_empty()
    }

    pub fn collect(&self, collector: &mut Collector) {
        for op in self.statics.iter().chain(self.regulars.iter()) {
            op.collect(collector);
        }
    }
}

impl WireFormat for ReferenceOperations {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        match &self.clustering {
            Some(clustering) => {
                write_bool(out, true);
                clustering.encode(out);
            }
            None => write_bool(out, false),
        }
        match self.existing {
            Some(name) => {
                write_bool(out, true);
                write_unsigned_vint(out, u64::from(name.as_u32()));
            }
            None => write_bool(out, false),
        }
        serialize_list(&self.statics, tables, out, version)?;
        serialize_list(&self.regulars, tables, out, version)
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        let clustering = if input.read_bool()? {
            Some(Clustering::decode(input)?)
        } else {
            None
        };
        let existing = if input.read_bool()? {
            Some(TxnDataName::from_u32(input.read_unsigned_vint32()?)?)
        } else {
            None
        };
        let statics = deserialize_list(tables, input, version)?;
        let regulars: Vec<ReferenceOperation> = deserialize_list(tables, input, version)?;
        anyhow::ensure!(
            regulars.is_empty() || clustering.is_some(),
            "regular reference operations without a target row"
        );
        Ok(Self {
            clustering,
            existing,
            statics,
            regulars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PartitionKey;
    use crate::partition::{Cell, FilteredPartition, Row};
    use crate::schema::TableId;

    fn table() -> Arc<TableMetadata> {
        let column = |name: &str, kind, column_type| ColumnMetadata {
            name: name.to_string(),
            kind,
            column_type,
            position: 0,
        };
        Arc::new(TableMetadata {
            id: TableId(3),
            keyspace: "ks".to_string(),
            name: "accounts".to_string(),
            columns: vec![
                column("id", ColumnKind::PartitionKey, ColumnType::Blob),
                column("seq", ColumnKind::Clustering, ColumnType::Blob),
                column("balance", ColumnKind::Regular, ColumnType::Int32),
                column("label", ColumnKind::Regular, ColumnType::Ascii),
                column("total", ColumnKind::Regular, ColumnType::Int64),
            ],
        })
    }

    fn data(table: &Arc<TableMetadata>, balance: i32) -> TxnData {
        let mut partition = FilteredPartition::empty(PartitionKey::new(table.id, &b"acct"[..]));
        let mut row = Row::new(Clustering::of([Bytes::from_static(b"r1")]));
        row.cells
            .insert(2, Cell::live(Bytes::copy_from_slice(&balance.to_be_bytes()), 1));
        partition.rows.push(row);
        TxnData::of(TxnDataName::user(0), TxnDataValue::Key(partition))
    }

    #[test]
    fn substitution_converts_to_receiver() {
        let table = table();
        let reference = ColumnReference::new(TxnDataName::user(0), Arc::clone(&table), 2).expect("ref");
        let value = ReferenceValue::Substitution(reference.clone());
        let widened = value
            .compute(&data(&table, -5), ColumnType::Int64)
            .expect("compute")
            .expect("value");
        assert_eq!(widened.as_ref(), (-5i64).to_be_bytes().as_slice());
        assert!(value.compute(&data(&table, 1), ColumnType::Ascii).is_err());

        let clustering = ColumnReference::new(TxnDataName::user(0), Arc::clone(&table), 1).expect("ref");
        assert_eq!(
            clustering.resolve(&data(&table, 1)).expect("resolve"),
            Some(Bytes::from_static(b"r1"))
        );
    }

    #[test]
    fn missing_results_are_contract_violations() {
        let table = table();
        let reference = ColumnReference::new(TxnDataName::user(4), table, 2).expect("ref");
        let err = reference.resolve(&TxnData::new()).unwrap_err();
        assert_eq!(
            crate::error::classify(&err),
            Some(&TxnError::UnresolvedReference {
                name: TxnDataName::user(4).as_u32()
            })
        );
        assert_eq!(reference.resolve_if_present(&TxnData::new()).expect("lenient"), None);
    }

    #[test]
    fn operations_combine_with_current_value() {
        let table = table();
        let data = data(&table, 10);
        let by_ref = ReferenceValue::Substitution(
            ColumnReference::new(TxnDataName::user(0), Arc::clone(&table), 2).expect("ref"),
        );
        let current = Bytes::copy_from_slice(&3i32.to_be_bytes());

        let add = ReferenceOperation::new(OperationKind::Adder, 2, by_ref.clone());
        let sum = add.apply(&table, Some(&current), &data).expect("add").expect("sum");
        assert_eq!(sum.as_ref(), 13i32.to_be_bytes().as_slice());

        let sub = ReferenceOperation::new(OperationKind::Subtracter, 2, by_ref);
        let diff = sub.apply(&table, None, &data).expect("sub").expect("diff");
        assert_eq!(diff.as_ref(), (-10i32).to_be_bytes().as_slice());

        let label = Bytes::from_static(b"ab");
        let prepend = ReferenceOperation::new(
            OperationKind::Prepender,
            3,
            ReferenceValue::Constant(Some(Bytes::from_static(b"x"))),
        );
        assert_eq!(
            prepend.apply(&table, Some(&label), &data).expect("prepend"),
            Some(Bytes::from_static(b"xab"))
        );

        let discard = ReferenceOperation::new(
            OperationKind::Discarder,
            3,
            ReferenceValue::Constant(Some(Bytes::from_static(b"ab"))),
        );
        assert_eq!(discard.apply(&table, Some(&label), &data).expect("discard"), None);
    }

    #[test]
    fn operations_round_trip() {
        let table = table();
        let tables = TableMetadatas::of(Arc::clone(&table));
        let ops = ReferenceOperations {
            clustering: Some(Clustering::of([Bytes::from_static(b"r1")])),
            existing: Some(TxnDataName::auto_read(0)),
            statics: Vec::new(),
            regulars: vec![
                ReferenceOperation::new(
                    OperationKind::Setter,
                    3,
                    ReferenceValue::Constant(None),
                ),
                ReferenceOperation::new(
                    OperationKind::Adder,
                    4,
                    ReferenceValue::Substitution(
                        ColumnReference::new(TxnDataName::user(0), table, 2).expect("ref"),
                    ),
                ),
            ],
        };
        let bytes = ops.to_bytes(&tables, Version::LATEST).expect("encode");
        let decoded = ReferenceOperations::from_bytes(&tables, &bytes, Version::LATEST).expect("decode");
        assert_eq!(decoded, ops);
    }
}
