//! Guards evaluated against read results before an update may apply.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::{BufMut, Bytes};

use crate::codec::{
    deserialize_list, serialize_list, write_bytes_with_vint_length, write_unsigned_vint, Reader,
    Version, WireFormat,
};
use crate::data::TxnData;
use crate::error::TxnError;
use crate::memo::Memoized;
use crate::reference::ColumnReference;
use crate::schema::{Collector, TableMetadatas};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExistsKind {
    IsNull,
    IsNotNull,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    const ALL: [Comparison; 6] = [
        Comparison::Eq,
        Comparison::Ne,
        Comparison::Lt,
        Comparison::Le,
        Comparison::Gt,
        Comparison::Ge,
    ];

    fn to_u8(self) -> u8 {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(0) as u8
    }

    fn from_u8(raw: u8) -> anyhow::Result<Self> {
        Self::ALL
            .get(usize::from(raw))
            .copied()
            .ok_or_else(|| TxnError::unknown("comparison", raw).into())
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Ne => ordering != Ordering::Equal,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Le => ordering != Ordering::Greater,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnCondition {
    None,
    And(Vec<TxnCondition>),
    Or(Vec<TxnCondition>),
    Exists {
        kind: ExistsKind,
        reference: ColumnReference,
    },
    Value {
        comparison: Comparison,
        reference: ColumnReference,
        value: Bytes,
    },
}

const KIND_NONE: u64 = 0;
const KIND_AND: u64 = 1;
const KIND_OR: u64 = 2;
const KIND_EXISTS: u64 = 3;
const KIND_VALUE: u64 = 4;

impl TxnCondition {
    pub fn applies(&self, data: &TxnData) -> anyhow::Result<bool> {
        match self {
            TxnCondition::None => Ok(true),
            TxnCondition::And(children) => {
                for child in children {
                    if !child.applies(data)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            TxnCondition::Or(children) => {
                for child in children {
                    if child.applies(data)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            TxnCondition::Exists { kind, reference } => {
                let present = reference.resolve_if_present(data)?.is_some();
                Ok(match kind {
                    ExistsKind::IsNull => !present,
                    ExistsKind::IsNotNull => present,
                })
            }
            TxnCondition::Value {
                comparison,
                reference,
                value,
            } => match reference.resolve_if_present(data)? {
                Some(current) => {
                    let ordering = reference.column_type()?.compare(&current, value);
                    Ok(comparison.holds(ordering))
                }
                // Null is unequal to everything and incomparable otherwise.
                None => Ok(*comparison == Comparison::Ne),
            },
        }
    }

    pub fn collect(&self, collector: &mut Collector) {
        match self {
            TxnCondition::None => {}
            TxnCondition::And(children) | TxnCondition::Or(children) => {
                for child in children {
                    child.collect(collector);
                }
            }
            TxnCondition::Exists { reference, .. } | TxnCondition::Value { reference, .. } => {
                reference.collect(collector)
            }
        }
    }
}

impl WireFormat for TxnCondition {
    type Context = TableMetadatas;

    fn serialize(&self, tables: &TableMetadatas, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        match self {
            TxnCondition::None => {
                write_unsigned_vint(out, KIND_NONE);
                Ok(())
            }
            TxnCondition::And(children) => {
                write_unsigned_vint(out, KIND_AND);
                serialize_list(children, tables, out, version)
            }
            TxnCondition::Or(children) => {
                write_unsigned_vint(out, KIND_OR);
                serialize_list(children, tables, out, version)
            }
            TxnCondition::Exists { kind, reference } => {
                write_unsigned_vint(out, KIND_EXISTS);
                out.put_u8(match kind {
                    ExistsKind::IsNull => 0,
                    ExistsKind::IsNotNull => 1,
                });
                reference.serialize(tables, out, version)
            }
            TxnCondition::Value {
                comparison,
                reference,
                value,
            } => {
                write_unsigned_vint(out, KIND_VALUE);
                out.put_u8(comparison.to_u8());
                reference.serialize(tables, out, version)?;
                write_bytes_with_vint_length(out, value);
                Ok(())
            }
        }
    }

    fn deserialize(tables: &TableMetadatas, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        match input.read_unsigned_vint()? {
            KIND_NONE => Ok(TxnCondition::None),
            KIND_AND => Ok(TxnCondition::And(deserialize_list(tables, input, version)?)),
            KIND_OR => Ok(TxnCondition::Or(deserialize_list(tables, input, version)?)),
            KIND_EXISTS => {
                let kind = match input.read_u8()? {
                    0 => ExistsKind::IsNull,
                    1 => ExistsKind::IsNotNull,
                    other => return Err(TxnError::unknown("exists kind", other).into()),
                };
                let reference = ColumnReference::deserialize(tables, input, version)?;
                Ok(TxnCondition::Exists { kind, reference })
            }
            KIND_VALUE => {
                let comparison = Comparison::from_u8(input.read_u8()?)?;
                let reference = ColumnReference::deserialize(tables, input, version)?;
                let value = input.read_bytes_with_vint_length()?;
                Ok(TxnCondition::Value {
                    comparison,
                    reference,
                    value,
                })
            }
            other => Err(TxnError::unknown("condition", other).into()),
        }
    }
}

/// Condition kept in encoded form; decoded on first evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedCondition {
    memo: Memoized<TxnCondition>,
}

impl SerializedCondition {
    /// Encode `condition` and decode it straight back, so that a malformed
    /// condition is rejected at construction instead of first use.
    pub fn new(condition: &TxnCondition, tables: &TableMetadatas) -> anyhow::Result<Self> {
        let bytes = condition.to_bytes(tables, Version::LATEST)?;
        let decoded = TxnCondition::from_bytes(tables, &bytes, Version::LATEST)?;
        Ok(Self {
            memo: Memoized::with_value(bytes, decoded),
        })
    }

    pub fn none(tables: &TableMetadatas) -> anyhow::Result<Self> {
        Self::new(&TxnCondition::None, tables)
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            memo: Memoized::from_bytes(bytes),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        self.memo.bytes()
    }

    pub fn get(&self, tables: &TableMetadatas) -> anyhow::Result<Arc<TxnCondition>> {
        self.memo
            .get(|raw| TxnCondition::from_bytes(tables, raw, Version::LATEST))
    }

    pub fn unmemoize(&self) {
        self.memo.unmemoize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{TxnDataName, TxnDataValue};
    use crate::keys::PartitionKey;
    use crate::partition::{Cell, Clustering, FilteredPartition, Row};
    use crate::schema::{ColumnKind, ColumnMetadata, ColumnType, TableId, TableMetadata};

    fn table() -> Arc<TableMetadata> {
        Arc::new(TableMetadata {
            id: TableId(5),
            keyspace: "ks".to_string(),
            name: "kv".to_string(),
            columns: vec![
                ColumnMetadata {
                    name: "k".to_string(),
                    kind: ColumnKind::PartitionKey,
                    column_type: ColumnType::Blob,
                    position: 0,
                },
                ColumnMetadata {
                    name: "c".to_string(),
                    kind: ColumnKind::Clustering,
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
        })
    }

    fn data_with(value: Option<i32>) -> TxnData {
        let mut partition = FilteredPartition::empty(PartitionKey::new(TableId(5), &b"k"[..]));
        if let Some(value) = value {
            let mut row = Row::new(Clustering::of([Bytes::from_static(b"c")]));
            row.cells
                .insert(2, Cell::live(Bytes::copy_from_slice(&value.to_be_bytes()), 1));
            partition.rows.push(row);
        }
        TxnData::of(TxnDataName::user(0), TxnDataValue::Key(partition))
    }

    fn reference() -> ColumnReference {
        ColumnReference::new(TxnDataName::user(0), table(), 2).expect("reference")
    }

    fn value_condition(comparison: Comparison, value: i32) -> TxnCondition {
        TxnCondition::Value {
            comparison,
            reference: reference(),
            value: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    #[test]
    fn value_comparisons_use_column_type() {
        let data = data_with(Some(-3));
        assert!(value_condition(Comparison::Lt, 1).applies(&data).expect("lt"));
        assert!(value_condition(Comparison::Ge, -3).applies(&data).expect("ge"));
        assert!(!value_condition(Comparison::Eq, 3).applies(&data).expect("eq"));
    }

    #[test]
    fn null_handling() {
        let empty = data_with(None);
        let is_null = TxnCondition::Exists {
            kind: ExistsKind::IsNull,
            reference: reference(),
        };
        assert!(is_null.applies(&empty).expect("is null"));
        assert!(is_null.applies(&TxnData::new()).expect("missing result"));
        assert!(!value_condition(Comparison::Eq, 0).applies(&empty).expect("eq"));
        assert!(value_condition(Comparison::Ne, 0).applies(&empty).expect("ne"));
    }

    #[test]
    fn boolean_combinators() {
        let data = data_with(Some(5));
        let and = TxnCondition::And(vec![
            value_condition(Comparison::Gt, 1),
            value_condition(Comparison::Lt, 4),
        ]);
        let or = TxnCondition::Or(vec![
            value_condition(Comparison::Gt, 1),
            value_condition(Comparison::Lt, 4),
        ]);
        assert!(!and.applies(&data).expect("and"));
        assert!(or.applies(&data).expect("or"));
        assert!(TxnCondition::None.applies(&data).expect("none"));
    }

    #[test]
    fn serialized_condition_round_trips_and_collects() {
        let tables = TableMetadatas::of(table());
        let condition = TxnCondition::And(vec![
            TxnCondition::Exists {
                kind: ExistsKind::IsNotNull,
                reference: reference(),
            },
            value_condition(Comparison::Le, 9),
        ]);
        let serialized = SerializedCondition::new(&condition, &tables).expect("serialize");
        let reparsed = SerializedCondition::from_bytes(serialized.bytes().clone());
        assert_eq!(*reparsed.get(&tables).expect("decode"), condition);

        let mut collector = Collector::new();
        condition.collect(&mut collector);
        assert_eq!(collector.build(), tables);
    }
}
