//! Market Reconciler Library
//!
//! Brings a ledger-backed market registry in line with a declarative list of markets:
//! creates the markets that are missing, then writes each market parameter whose stored
//! value differs from the desired one.
//!
//! Exposes the reconciliation engine for the binary and the integration tests.

pub mod audit;
pub mod config;
pub mod error;
pub mod identity;
pub mod keys;
pub mod ledger;
pub mod models;
pub mod reconciler;
pub mod sync;

pub use error::{LedgerError, ResolveError};
pub use models::{DesiredState, MarketIdentity, MarketSpec, RegistryAddresses, TokenTriple};
pub use reconciler::{Collaborators, ReconcileOptions, ReconcileOutcome, ReconcileReport, Reconciler};
