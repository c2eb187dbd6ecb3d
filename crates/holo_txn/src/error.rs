//! Typed failure taxonomy attached to `anyhow` errors.
//!
//! Everything in this crate returns `anyhow::Result`. The fatal categories
//! below are wrapped into the `anyhow::Error` so callers that need to tell a
//! version skew apart from a caller bug can `downcast_ref::<TxnError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxnError {
    /// A discriminant on the wire does not name any known variant.
    #[error("unknown {what} discriminant: {value}")]
    UnknownKind { what: &'static str, value: u64 },

    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("input truncated while reading {what}")]
    Truncated { what: &'static str },

    /// The same key arrived from two sources with different bytes.
    #[error("conflicting update bytes for key {key}")]
    MergeConflict { key: String },

    #[error("topology epoch {current} is behind required epoch {required}")]
    EpochNotReady { required: u64, current: u64 },

    #[error("timestamp field {field} needs {bits} bits which exceeds its encoding")]
    FieldOverflow { field: &'static str, bits: u32 },

    #[error("reference to txn data {name:#x} cannot be resolved")]
    UnresolvedReference { name: u32 },
}

impl TxnError {
    pub(crate) fn unknown(what: &'static str, value: impl Into<u64>) -> Self {
        Self::UnknownKind {
            what,
            value: value.into(),
        }
    }
}

/// Return the typed cause of an error chain, if any.
pub fn classify(err: &anyhow::Error) -> Option<&TxnError> {
    err.chain().find_map(|cause| cause.downcast_ref::<TxnError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_sees_through_context() {
        let err: anyhow::Result<()> = Err(TxnError::Truncated { what: "varint" }.into());
        let err = err.context("decode txn read").unwrap_err();
        assert_eq!(
            classify(&err),
            Some(&TxnError::Truncated { what: "varint" })
        );
        assert!(err.to_string().contains("decode txn read"));
    }

    #[test]
    fn plain_errors_are_unclassified() {
        let err = anyhow::anyhow!("boom");
        assert!(classify(&err).is_none());
    }
}
