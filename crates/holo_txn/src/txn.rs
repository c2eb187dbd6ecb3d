//! The portion of a transaction a replica receives, and its route.

use bytes::BufMut;

use crate::codec::{write_bool, Reader, Version, WireFormat};
use crate::keys::{Participants, RoutingKey, Seekables};
use crate::read::TxnRead;
use crate::schema::{Schema, TableMetadatas};
use crate::timestamp::TxnKind;
use crate::update::TxnUpdate;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialTxn {
    kind: TxnKind,
    keys: Seekables,
    read: TxnRead,
    update: Option<TxnUpdate>,
    /// Registry every table reference inside the txn is resolved against.
    tables: TableMetadatas,
}

impl PartialTxn {
    pub fn new(
        kind: TxnKind,
        tables: TableMetadatas,
        keys: Seekables,
        read: TxnRead,
        update: Option<TxnUpdate>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            read.tables().is_empty() || *read.tables() == tables,
            "txn read built against {:?}, txn carries {:?}",
            read.tables(),
            tables
        );
        let read = if read.tables().is_empty() && !read.is_empty() {
            read.with_tables(tables.clone())
        } else {
            read
        };
        if let Some(update) = &update {
            anyhow::ensure!(kind.is_write(), "{kind:?} txn carries an update");
            anyhow::ensure!(
                *update.tables() == tables,
                "txn update built against {:?}, txn carries {:?}",
                update.tables(),
                tables
            );
        }
        Ok(Self {
            kind,
            keys,
            read,
            update,
            tables,
        })
    }

    pub fn kind(&self) -> TxnKind {
        self.kind
    }

    pub fn keys(&self) -> &Seekables {
        &self.keys
    }

    pub fn read(&self) -> &TxnRead {
        &self.read
    }

    pub fn update(&self) -> Option<&TxnUpdate> {
        self.update.as_ref()
    }

    pub fn tables(&self) -> &TableMetadatas {
        &self.tables
    }

    /// The part of this txn that concerns `participants`.
    pub fn intersecting(&self, participants: &Participants) -> Self {
        Self {
            kind: self.kind,
            keys: self.keys.intersecting(participants),
            read: self.read.intersecting(participants),
            update: self
                .update
                .as_ref()
                .map(|update| update.intersecting(participants)),
            tables: self.tables.clone(),
        }
    }

    pub fn unmemoize(&self) {
        self.read.unmemoize();
        if let Some(update) = &self.update {
            update.unmemoize();
        }
    }
}

impl WireFormat for PartialTxn {
    type Context = Schema;

    fn serialize(&self, _: &Schema, out: &mut Vec<u8>, version: Version) -> anyhow::Result<()> {
        self.tables.serialize_self(out);
        out.put_u8(self.kind.to_bits() as u8);
        self.keys.serialize(&self.tables, out, version)?;
        self.read.serialize(&self.tables, out, version)?;
        match &self.update {
            Some(update) => {
                write_bool(out, true);
                update.serialize(&self.tables, out, version)
            }
            None => {
                write_bool(out, false);
                Ok(())
            }
        }
    }

    fn deserialize(schema: &Schema, input: &mut Reader<'_>, version: Version) -> anyhow::Result<Self> {
        let tables = TableMetadatas::deserialize_self(schema, input)?;
        let kind = TxnKind::from_bits(u16::from(input.read_u8()?))?;
        let keys = Seekables::deserialize(&tables, input, version)?;
        let read = TxnRead::deserialize(&tables, input, version)?;
        let update = if input.read_bool()? {
            Some(TxnUpdate::deserialize(&tables, input, version)?)
        } else {
            None
        };
        Self::new(kind, tables, keys, read, update)
    }
}

/// Home key plus every key or range the txn touches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub home_key: RoutingKey,
    pub participants: Participants,
}

impl Route {
    pub fn new(home_key: RoutingKey, participants: Participants) -> Self {
        Self {
            home_key,
            participants,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        self.home_key.encode(out);
        self.participants.encode(out);
    }

    pub fn decode(input: &mut Reader<'_>) -> anyhow::Result<Self> {
        let home_key = RoutingKey::decode(input)?;
        let participants = Participants::decode(input)?;
        Ok(Self {
            home_key,
            participants,
        })
    }
}
