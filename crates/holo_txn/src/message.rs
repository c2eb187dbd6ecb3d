//! The read-family request envelope.
//!
//! Every variant shares one header varint:
//!
//! ```text
//!   bit  7                6          5        4 3     2 1 0
//!        has_epoch_delta  has_exec  has_txn  flags   kind
//! ```
//!
//! followed by the txn id, the participant scope, the optional partial txn,
//! the optional execute-at timestamp and the optional execute-at epoch delta.
//! The kind-specific payload comes last.

use crate::codec::{write_unsigned_vint, write_vint, Reader, Version, WireFormat};
use crate::error::TxnError;
use crate::keys::Participants;
use crate::schema::Schema;
use crate::timestamp::{codec, Deps, Timestamp, TxnId};
use crate::txn::{PartialTxn, Route};
use crate::write::TxnWrite;

const KIND_MASK: u64 = 0x7;
const FLAGS_SHIFT: u32 = 3;
const FLAGS_MASK: u64 = 0x3;
const HAS_TXN: u64 = 0x20;
const HAS_EXECUTE_AT: u64 = 0x40;
const HAS_EXECUTE_AT_EPOCH: u64 = 0x80;

const STR_HAS_DEPS: u64 = 0x1;
const STR_HAS_FULL_ROUTE: u64 = 0x2;

const ATWUA_HAS_MIN_EPOCH: u64 = 0x1;
const ATWUA_HAS_WRITES: u64 = 0x2;

/// Two bits of execution hints carried in the header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ExecuteFlags(u8);

impl ExecuteFlags {
    pub const NONE: ExecuteFlags = ExecuteFlags(0);

    pub fn from_bits(bits: u8) -> anyhow::Result<Self> {
        anyhow::ensure!(u64::from(bits) <= FLAGS_MASK, "execute flags {bits:#b} exceed two bits");
        Ok(Self(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: ExecuteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// How a stable-then-read commit reached stability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommitKind {
    StableFastPath,
    StableSlowPath,
    StableMediumPath,
    StableWithTxnAndDeps,
}

impl CommitKind {
    fn ordinal(self) -> u32 {
        match self {
            CommitKind::StableFastPath => 0,
            CommitKind::StableSlowPath => 1,
            CommitKind::StableMediumPath => 2,
            CommitKind::StableWithTxnAndDeps => 3,
        }
    }

    fn from_ordinal(raw: u32) -> anyhow::Result<Self> {
        Ok(match raw {
            0 => CommitKind::StableFastPath,
            1 => CommitKind::StableSlowPath,
            2 => CommitKind::StableMediumPath,
            3 => CommitKind::StableWithTxnAndDeps,
            other => return Err(TxnError::unknown("commit kind", other).into()),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadDataKind {
    ReadTxnData,
    WaitUntilApplied {
        min_epoch: u64,
    },
    ReadEphemeralTxnData {
        deps: Deps,
        route: Route,
    },
    StableThenRead {
        commit_kind: CommitKind,
        min_epoch: u64,
        deps: Option<Deps>,
        route: Option<Route>,
    },
    ApplyThenWaitUntilApplied {
        min_epoch: u64,
        deps: Deps,
        route: Route,
        writes: Option<TxnWrite>,
    },
}

impl ReadDataKind {
    fn ordinal(&self) -> u64 {
        match self {
            ReadDataKind::ReadTxnData => 0,
            ReadDataKind::WaitUntilApplied { .. } => 1,
            ReadDataKind::ReadEphemeralTxnData { .. } => 2,
            ReadDataKind::StableThenRead { .. } => 3,
            ReadDataKind::ApplyThenWaitUntilApplied { .. } => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadData {
    pub txn_id: TxnId,
    pub scope: Participants,
    pub txn: Option<PartialTxn>,
    pub execute_at: Option<Timestamp>,
    /// Defaults to the epoch of `execute_at`, or of `txn_id` without one.
    pub execute_at_epoch: u64,
    pub flags: ExecuteFlags,
    pub kind: ReadDataKind,
}

impl ReadData {
    pub fn new(txn_id: TxnId, scope: Participants, kind: ReadDataKind) -> Self {
        Self {
            txn_id,
            scope,
            txn: None,
            execute_at: None,
            execute_at_epoch: txn_id.epoch(),
            flags: ExecuteFlags::NONE,
            kind,
        }
    }

    pub fn with_txn(mut self, txn: PartialTxn) -> Self {
        self.txn = Some(txn);
        self
    }

    /// Also resets the execute-at epoch to the timestamp's own epoch.
    pub fn with_execute_at(mut self, execute_at: Timestamp) -> Self {
        self.execute_at = Some(execute_at);
        self.execute_at_epoch = execute_at.epoch;
        self
    }

    pub fn with_execute_at_epoch(mut self, epoch: u64) -> Self {
        self.execute_at_epoch = epoch;
        self
    }

    pub fn with_flags(mut self, flags: ExecuteFlags) -> Self {
        self.flags = flags;
        self
    }

    fn base_epoch(&self) -> u64 {
        self.execute_at.map_or(self.txn_id.epoch(), |ts| ts.epoch)
    }
}

fn epoch_delta(base: u64, other: u64) -> i64 {
    (base as i64).wrapping_sub(other as i64)
}

fn apply_delta(base: u64, delta: i128) -> anyhow::Result<u64> {
    u64::try_from(i128::from(base) - delta)
        .map_err(|_| anyhow::anyhow!("epoch delta {delta} underflows epoch {base}"))
}

impl WireFormat for ReadData {
    type Context = Schema;

    fn serialize(&self, schema: &Schema, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        let has_epoch_delta = self.execute_at_epoch != self.base_epoch();
        let mut header = self.kind.ordinal() | (u64::from(self.flags.bits()) << FLAGS_SHIFT);
        if self.txn.is_some() {
            header |= HAS_TXN;
        }
        if self.execute_at.is_some() {
            header |= HAS_EXECUTE_AT;
        }
        if has_epoch_delta {
            header |= HAS_EXECUTE_AT_EPOCH;
        }
        write_unsigned_vint(out, header);
        codec::serialize(&self.txn_id, out)?;
        self.scope.encode(out);
        if let Some(txn) = &self.txn {
            txn.serialize(schema, out, version)?;
        }
        if let Some(execute_at) = &self.execute_at {
            codec::serialize_execute_at(&self.txn_id, execute_at, out)?;
        }
        if has_epoch_delta {
            write_vint(out, epoch_delta(self.execute_at_epoch, self.base_epoch()));
        }

        let txn_epoch = self.txn_id.epoch();
        match &self.kind {
            ReadDataKind::ReadTxnData => {}
            ReadDataKind::WaitUntilApplied { min_epoch } => {
                write_vint(out, epoch_delta(txn_epoch, *min_epoch));
            }
            ReadDataKind::ReadEphemeralTxnData { deps, route } => {
                deps.encode(out)?;
                route.encode(out);
            }
            ReadDataKind::StableThenRead {
                commit_kind,
                min_epoch,
                deps,
                route,
            } => {
                write_unsigned_vint(out, u64::from(commit_kind.ordinal()));
                write_vint(out, epoch_delta(txn_epoch, *min_epoch));
                let mut extra = 0;
                if deps.is_some() {
                    extra |= STR_HAS_DEPS;
                }
                if route.is_some() {
                    extra |= STR_HAS_FULL_ROUTE;
                }
                write_unsigned_vint(out, extra);
                if let Some(deps) = deps {
                    deps.encode(out)?;
                }
                if let Some(route) = route {
                    route.encode(out);
                }
            }
            ReadDataKind::ApplyThenWaitUntilApplied {
                min_epoch,
                deps,
                route,
                writes,
            } => {
                let has_min_epoch = *min_epoch != txn_epoch;
                let mut extra = 0;
                if has_min_epoch {
                    extra |= ATWUA_HAS_MIN_EPOCH;
                }
                if writes.is_some() {
                    extra |= ATWUA_HAS_WRITES;
                }
                write_unsigned_vint(out, extra);
                if has_min_epoch {
                    write_vint(out, epoch_delta(txn_epoch, *min_epoch));
                }
                deps.encode(out)?;
                route.encode(out);
                if let Some(writes) = writes {
                    writes.serialize(schema, out, version)?;
                }
            }
        }
        Ok(())
    }

    fn deserialize(schema: &Schema, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        let header = input.read_unsigned_vint()?;
        anyhow::ensure!(header <= 0xff, "read data header {header:#x} has unknown bits");
        let kind_ordinal = header & KIND_MASK;
        let flags = ExecuteFlags::from_bits(((header >> FLAGS_SHIFT) & FLAGS_MASK) as u8)?;

        let txn_id: TxnId = codec::deserialize(input)?;
        let scope = Participants::decode(input)?;
        let txn = if header & HAS_TXN != 0 {
            Some(PartialTxn::deserialize(schema, input, version)?)
        } else {
            None
        };
        let execute_at = if header & HAS_EXECUTE_AT != 0 {
            Some(codec::deserialize_execute_at(&txn_id, input)?)
        } else {
            None
        };
        let base_epoch = execute_at.map_or(txn_id.epoch(), |ts| ts.epoch);
        let execute_at_epoch = if header & HAS_EXECUTE_AT_EPOCH != 0 {
            apply_delta(base_epoch, -i128::from(input.read_vint()?))?
        } else {
            base_epoch
        };

        let txn_epoch = txn_id.epoch();
        let kind = match kind_ordinal {
            0 => ReadDataKind::ReadTxnData,
            1 => ReadDataKind::WaitUntilApplied {
                min_epoch: apply_delta(txn_epoch, i128::from(input.read_vint()?))?,
            },
            2 => ReadDataKind::ReadEphemeralTxnData {
                deps: Deps::decode(input)?,
                route: Route::decode(input)?,
            },
            3 => {
                let commit_kind = CommitKind::from_ordinal(input.read_unsigned_vint32()?)?;
                let min_epoch = apply_delta(txn_epoch, i128::from(input.read_vint()?))?;
                let extra = input.read_unsigned_vint()?;
                let deps = if extra & STR_HAS_DEPS != 0 {
                    Some(Deps::decode(input)?)
                } else {
                    None
                };
                let route = if extra & STR_HAS_FULL_ROUTE != 0 {
                    Some(Route::decode(input)?)
                } else {
                    None
                };
                ReadDataKind::StableThenRead {
                    commit_kind,
                    min_epoch,
                    deps,
                    route,
                }
            }
            4 => {
                let extra = input.read_unsigned_vint()?;
                let min_epoch = if extra & ATWUA_HAS_MIN_EPOCH != 0 {
                    apply_delta(txn_epoch, i128::from(input.read_vint()?))?
                } else {
                    txn_epoch
                };
                let deps = Deps::decode(input)?;
                let route = Route::decode(input)?;
                let writes = if extra & ATWUA_HAS_WRITES != 0 {
                    Some(TxnWrite::deserialize(schema, input, version)?)
                } else {
                    None
                };
                ReadDataKind::ApplyThenWaitUntilApplied {
                    min_epoch,
                    deps,
                    route,
                    writes,
                }
            }
            other => return Err(TxnError::unknown("read data kind", other).into()),
        };

        Ok(Self {
            txn_id,
            scope,
            txn,
            execute_at,
            execute_at_epoch,
            flags,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use crate::keys::{Domain, RoutingKey};
    use crate::schema::TableId;
    use crate::timestamp::TxnKind;

    fn id(epoch: u64, hlc: u64) -> TxnId {
        TxnId::new(epoch, hlc, TxnKind::Write, Domain::Key, 1).expect("id")
    }

    fn scope() -> Participants {
        Participants::keys(vec![RoutingKey::token(TableId(5), &b"k"[..])])
    }

    fn round_trip(read: &ReadData) -> ReadData {
        let schema = Schema::default();
        let bytes = read.to_bytes(&schema, Version::LATEST).expect("serialize");
        ReadData::from_bytes(&schema, &bytes, Version::LATEST).expect("deserialize")
    }

    #[test]
    fn header_packs_kind_flags_and_presence() {
        let read = ReadData::new(id(9, 100), scope(), ReadDataKind::WaitUntilApplied { min_epoch: 7 })
            .with_execute_at(Timestamp::new(9, 120, 0, 2).expect("ts"))
            .with_execute_at_epoch(11)
            .with_flags(ExecuteFlags::from_bits(0b10).expect("flags"));
        let bytes = read.to_bytes(&Schema::default(), Version::LATEST).expect("serialize");
        let header = Reader::new(&bytes).read_unsigned_vint().expect("header");
        assert_eq!(header, 1 | (0b10 << 3) | HAS_EXECUTE_AT | HAS_EXECUTE_AT_EPOCH);
        assert_eq!(round_trip(&read), read);
    }

    #[test]
    fn epoch_delta_is_omitted_when_implied() {
        let read = ReadData::new(id(4, 1), scope(), ReadDataKind::ReadTxnData);
        let bytes = read.to_bytes(&Schema::default(), Version::LATEST).expect("serialize");
        assert_eq!(Reader::new(&bytes).read_unsigned_vint().expect("header"), 0);
        assert_eq!(round_trip(&read).execute_at_epoch, 4);
    }

    #[test]
    fn stable_then_read_optional_parts() {
        let route = Route::new(RoutingKey::token(TableId(5), &b"k"[..]), scope());
        for (deps, route) in [
            (None, None),
            (Some(Deps::new(vec![id(3, 5), id(3, 2)])), None),
            (None, Some(route.clone())),
            (Some(Deps::new(vec![id(2, 9)])), Some(route)),
        ] {
            let read = ReadData::new(
                id(3, 10),
                scope(),
                ReadDataKind::StableThenRead {
                    commit_kind: CommitKind::StableSlowPath,
                    min_epoch: 2,
                    deps,
                    route,
                },
            );
            assert_eq!(round_trip(&read), read);
        }
    }

    #[test]
    fn apply_then_wait_skips_implied_min_epoch() {
        let route = Route::new(RoutingKey::token(TableId(5), &b"k"[..]), scope());
        let implied = ReadData::new(
            id(6, 1),
            scope(),
            ReadDataKind::ApplyThenWaitUntilApplied {
                min_epoch: 6,
                deps: Deps::default(),
                route: route.clone(),
                writes: None,
            },
        );
        let explicit = ReadData::new(
            id(6, 1),
            scope(),
            ReadDataKind::ApplyThenWaitUntilApplied {
                min_epoch: 5,
                deps: Deps::default(),
                route,
                writes: None,
            },
        );
        let schema = Schema::default();
        let a = implied.to_bytes(&schema, Version::LATEST).expect("implied");
        let b = explicit.to_bytes(&schema, Version::LATEST).expect("explicit");
        assert_eq!(a.len() + 1, b.len());
        assert_eq!(round_trip(&implied), implied);
        assert_eq!(round_trip(&explicit), explicit);
    }

    #[test]
    fn execute_at_travels_as_a_delta_from_the_txn_id() {
        let txn_id = id(5, 1_000);
        let plain = ReadData::new(txn_id, scope(), ReadDataKind::ReadTxnData);
        let size = |read: &ReadData| read.to_bytes(&Schema::default(), Version::LATEST).expect("serialize").len();

        let same = plain.clone().with_execute_at(*txn_id.as_timestamp());
        assert_eq!(size(&same), size(&plain) + 1);
        assert_eq!(round_trip(&same), same);

        let later_epoch = plain
            .clone()
            .with_execute_at(Timestamp::new(8, 1_300, 0, 4).expect("ts"));
        assert_eq!(round_trip(&later_epoch), later_epoch);
        assert_eq!(round_trip(&later_epoch).execute_at_epoch, 8);

        let earlier = plain.with_execute_at(Timestamp::new(4, 1_300, 0, 4).expect("ts"));
        assert!(earlier.to_bytes(&Schema::default(), Version::LATEST).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut out = Vec::new();
        write_unsigned_vint(&mut out, 6);
        codec::serialize(&id(1, 1), &mut out).expect("id");
        scope().encode(&mut out);
        let err = ReadData::from_bytes(&Schema::default(), &out, Version::LATEST).unwrap_err();
        assert!(matches!(classify(&err), Some(TxnError::UnknownKind { what: "read data kind", .. })));
    }
}
