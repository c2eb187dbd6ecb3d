use std::fmt;

use crate::codec::Reader;
use crate::error::TxnError;
use crate::keys::Domain;

use super::codec::{self, Encodable};

/// Largest epoch representable on the wire (48 bits).
pub const MAX_EPOCH: u64 = (1 << 48) - 1;

/// (epoch, hlc, flags, node), ordered field by field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub epoch: u64,
    pub hlc: u64,
    pub flags: u16,
    pub node: u32,
}

impl Timestamp {
    /// Fails when `epoch` does not fit the 48-bit wire field.
    pub fn new(epoch: u64, hlc: u64, flags: u16, node: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(epoch <= MAX_EPOCH, "epoch {epoch} exceeds {MAX_EPOCH}");
        Ok(Self {
            epoch,
            hlc,
            flags,
            node,
        })
    }

    /// Write timestamp for every cell produced when this transaction executes.
    pub fn unique_hlc(&self) -> i64 {
        i64::try_from(self.hlc).unwrap_or(i64::MAX)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{:#x},{}]", self.epoch, self.hlc, self.flags, self.node)
    }
}

impl Encodable for Timestamp {
    fn timestamp(&self) -> Timestamp {
        *self
    }

    fn from_timestamp(ts: Timestamp) -> anyhow::Result<Self> {
        Ok(ts)
    }
}

/// Transaction kind, carried in the low bits of a [`TxnId`]'s flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxnKind {
    Read,
    Write,
    EphemeralRead,
    ExclusiveSyncPoint,
    SyncPoint,
}

const KIND_MASK: u16 = 0b111;
const RANGE_DOMAIN_BIT: u16 = 0b1000;

impl TxnKind {
    pub(crate) fn to_bits(self) -> u16 {
        match self {
            TxnKind::Read => 0,
            TxnKind::Write => 1,
            TxnKind::EphemeralRead => 2,
            TxnKind::ExclusiveSyncPoint => 3,
            TxnKind::SyncPoint => 4,
        }
    }

    pub(crate) fn from_bits(bits: u16) -> anyhow::Result<Self> {
        Ok(match bits {
            0 => TxnKind::Read,
            1 => TxnKind::Write,
            2 => TxnKind::EphemeralRead,
            3 => TxnKind::ExclusiveSyncPoint,
            4 => TxnKind::SyncPoint,
            other => return Err(TxnError::unknown("txn kind", other).into()),
        })
    }

    /// Only write transactions may carry an update.
    pub fn is_write(self) -> bool {
        self == TxnKind::Write
    }

    pub fn is_sync_point(self) -> bool {
        matches!(self, TxnKind::ExclusiveSyncPoint | TxnKind::SyncPoint)
    }
}

/// A timestamp identifying a transaction; its low flag bits carry the kind
/// and domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(Timestamp);

impl TxnId {
    /// Packs `kind` and `domain` into the flag bits.
    pub fn new(epoch: u64, hlc: u64, kind: TxnKind, domain: Domain, node: u32) -> anyhow::Result<Self> {
        let domain_bit = match domain {
            Domain::Key => 0,
            Domain::Range => RANGE_DOMAIN_BIT,
        };
        Ok(Self(Timestamp::new(epoch, hlc, kind.to_bits() | domain_bit, node)?))
    }

    /// The underlying timestamp, flag bits included.
    pub fn as_timestamp(&self) -> &Timestamp {
        &self.0
    }

    pub fn epoch(&self) -> u64 {
        self.0.epoch
    }

    /// Kind decoded from the low flag bits.
    pub fn kind(&self) -> TxnKind {
        // Validated on construction and decode.
        TxnKind::from_bits(self.0.flags & KIND_MASK).unwrap_or(TxnKind::Read)
    }

    /// Key or range domain, from the domain flag bit.
    pub fn domain(&self) -> Domain {
        if self.0.flags & RANGE_DOMAIN_BIT != 0 {
            Domain::Range
        } else {
            Domain::Key
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{}", self.kind(), self.0)
    }
}

impl Encodable for TxnId {
    fn timestamp(&self) -> Timestamp {
        self.0
    }

    fn from_timestamp(ts: Timestamp) -> anyhow::Result<Self> {
        TxnKind::from_bits(ts.flags & KIND_MASK)?;
        Ok(Self(ts))
    }
}

/// Recovery ballot; `ZERO` and `MAX` encode as single sentinel bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ballot(Timestamp);

impl Ballot {
    /// Lowest ballot, held before any recovery round.
    pub const ZERO: Ballot = Ballot(Timestamp {
        epoch: 0,
        hlc: 0,
        flags: 0,
        node: 0,
    });

    /// Highest ballot, above every real one.
    pub const MAX: Ballot = Ballot(Timestamp {
        epoch: MAX_EPOCH,
        hlc: u64::MAX,
        flags: u16::MAX,
        node: u32::MAX,
    });

    pub fn new(ts: Timestamp) -> Self {
        Self(ts)
    }

    pub fn as_timestamp(&self) -> &Timestamp {
        &self.0
    }
}

impl Encodable for Ballot {
    fn timestamp(&self) -> Timestamp {
        self.0
    }

    fn from_timestamp(ts: Timestamp) -> anyhow::Result<Self> {
        Ok(Self(ts))
    }

    fn encode_special(&self) -> Option<u8> {
        if *self == Ballot::ZERO {
            Some(codec::BALLOT_ZERO)
        } else if *self == Ballot::MAX {
            Some(codec::BALLOT_MAX)
        } else {
            None
        }
    }

    fn decode_special(byte: u8) -> Option<Self> {
        match byte {
            codec::BALLOT_ZERO => Some(Ballot::ZERO),
            codec::BALLOT_MAX => Some(Ballot::MAX),
            _ => None,
        }
    }
}

/// Sorted, unique dependency set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Deps {
    ids: Vec<TxnId>,
}

impl Deps {
    /// Sorts and de-duplicates `ids`.
    pub fn new(mut ids: Vec<TxnId>) -> Self {
        ids.sort();
        ids.dedup();
        Self { ids }
    }

    pub fn ids(&self) -> &[TxnId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &TxnId) -> bool {
        self.ids.binary_search(id).is_ok()
    }

    /// Sorted union of both dependency sets.
    pub fn merge(&self, other: &Deps) -> Deps {
        Deps::new(self.ids.iter().chain(other.ids.iter()).copied().collect())
    }

    /// Columnar timestamp array form.
    pub fn encode(&self, out: &mut Vec<u8>) -> anyhow::Result<()> {
        codec::serialize_array(&self.ids, out)
    }

    pub fn decode(input: &mut Reader<'_>) -> anyhow::Result<Self> {
        let ids: Vec<TxnId> = codec::deserialize_array(input)?;
        anyhow::ensure!(
            ids.windows(2).all(|w| w[0] < w[1]),
            "deps on the wire are not strictly sorted"
        );
        Ok(Self { ids })
    }
}
