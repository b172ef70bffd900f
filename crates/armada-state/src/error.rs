//! Persistence-layer failures.
//!
//! The store wraps a single embedded database, so callers rarely branch
//! on these; the variants classify what went wrong for logs and task
//! results. `Backend` names the rejected operation, `Corrupt` flags a
//! stored value that no longer decodes into its record type, and
//! `TxnAborted` means the write never became visible.

use std::fmt::Display;

use thiserror::Error;

/// Result alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The backing database file could not be created or opened.
    #[error("state database unavailable: {0}")]
    Unavailable(String),

    /// A transaction failed to begin or commit; nothing was written.
    #[error("state transaction aborted: {0}")]
    TxnAborted(String),

    /// The storage engine rejected a table operation.
    #[error("state {op} rejected: {detail}")]
    Backend { op: &'static str, detail: String },

    /// A record refused to serialize into its column value.
    #[error("record not storable: {0}")]
    Encode(String),

    /// A stored column value no longer matches its record type.
    #[error("stored record corrupt: {0}")]
    Corrupt(String),

    /// A row the caller depends on is gone.
    #[error("missing row: {0}")]
    MissingRow(String),
}

impl StateError {
    /// Adapter for redb table operations: `map_err(StateError::backend("read"))`.
    pub(crate) fn backend<E: Display>(op: &'static str) -> impl Fn(E) -> Self {
        move |e| Self::Backend {
            op,
            detail: e.to_string(),
        }
    }

    pub(crate) fn txn<E: Display>(e: E) -> Self {
        Self::TxnAborted(e.to_string())
    }

    pub(crate) fn encode<E: Display>(e: E) -> Self {
        Self::Encode(e.to_string())
    }

    pub(crate) fn corrupt<E: Display>(e: E) -> Self {
        Self::Corrupt(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_adapter_names_the_operation() {
        let err = StateError::backend("write")("value too large");
        assert_eq!(err.to_string(), "state write rejected: value too large");
    }

    #[test]
    fn corrupt_and_txn_carry_the_cause() {
        assert!(StateError::corrupt("expected u32 at .index")
            .to_string()
            .contains(".index"));
        assert!(StateError::txn("storage full").to_string().starts_with("state transaction"));
    }
}
