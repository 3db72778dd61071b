//! Transactions Module
//!
//! Optimistic, read-committed transactions. Writes are buffered in the
//! caller's [`Transaction`] and replicated as one atomic batch at commit,
//! after the versions read at first access are validated on every node.

mod transaction;

pub use transaction::{Transaction, TxExpiryScope, TxId};

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxConcurrency {
    /// Validate at commit time, never lock while active
    Optimistic,
    /// Lock keys on first access
    Pessimistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxIsolation {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Active,
    Committing,
    Committed,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Active => "ACTIVE",
            TxState::Committing => "COMMITTING",
            TxState::Committed => "COMMITTED",
            TxState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}
