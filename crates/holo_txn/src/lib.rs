//! Transactional payloads carried by Accord messages.
//!
//! This crate holds the reads, updates and writes a transaction ships to its
//! replicas, their versioned wire format, and the slice/merge operations a
//! coordinator uses to split them across shards and combine partial results.
//! Execution goes through a caller-supplied `DataStore`; consensus itself
//! lives elsewhere.

pub mod codec;
pub mod condition;
pub mod config;
pub mod data;
pub mod error;
pub mod keys;
pub mod memo;
pub mod message;
pub mod partition;
pub mod read;
pub mod reference;
pub mod schema;
pub mod sorted;
pub mod store;
pub mod timestamp;
pub mod txn;
pub mod update;
pub mod write;

pub use codec::{Version, WireFormat};
pub use config::{CodecConfig, ExecutionContext};
pub use error::TxnError;
pub use message::{ReadData, ReadDataKind};
pub use read::TxnRead;
pub use store::{ClusterEpoch, DataStore, MemoryStore};
pub use txn::{PartialTxn, Route};
pub use update::TxnUpdate;
pub use write::TxnWrite;
