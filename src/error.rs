//! Error taxonomy for reconciliation.
//!
//! Identity and key derivation cannot fail. Everything that touches a collaborator
//! returns one of the errors below, and the driver decides per item whether to
//! continue or abort the remaining queue.

use std::fmt;

/// Failure reported by a remote collaborator (ledger query, factory, data store).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Transport, HTTP, timeout or malformed-response failure. Says nothing about remote state.
    Communication(String),
    /// The call reached the ledger and was rejected.
    ExecutionReverted(String),
}

impl LedgerError {
    pub fn communication(reason: impl Into<String>) -> Self {
        Self::Communication(reason.into())
    }

    pub fn reverted(reason: impl Into<String>) -> Self {
        Self::ExecutionReverted(reason.into())
    }

    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication(_))
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication(reason) => write!(f, "communication error: {}", reason),
            Self::ExecutionReverted(reason) => write!(f, "execution reverted: {}", reason),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Failure to resolve a token symbol through the token registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    UnknownSymbol(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSymbol(symbol) => write!(f, "unknown token symbol: {}", symbol),
        }
    }
}

impl std::error::Error for ResolveError {}
