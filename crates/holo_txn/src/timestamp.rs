//! Logical timestamps and their compact encodings.
//!
//! `types` defines `Timestamp`, `TxnId`, `Ballot` and `Deps`; `codec` holds
//! the variable-width, comparable and columnar array encodings.

pub mod codec;
mod types;

pub use codec::Encodable;
pub use types::{Ballot, Deps, Timestamp, TxnId, TxnKind, MAX_EPOCH};
