//! Collaborator interfaces for the remote ledger.
//!
//! - [`rpc::RpcLedger`]: EVM JSON-RPC endpoint
//! - [`memory::MemoryLedger`]: in-process ledger with failure injection

pub mod memory;
pub mod rpc;

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, ResolveError};
use crate::models::{TokenIdentity, TokenTriple};

pub use memory::MemoryLedger;
pub use rpc::{RpcLedger, RpcLedgerConfig};

/// Receipt of a mined state-changing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
}

/// Resolves token symbols to addresses.
pub trait TokenRegistry: Send + Sync {
    fn resolve(&self, symbol: &str) -> Result<TokenIdentity, ResolveError>;
}

/// Read-only ledger queries.
#[async_trait::async_trait]
pub trait LedgerQuery: Send + Sync {
    /// Whether executable code is deployed at `address`.
    async fn code_exists_at(&self, address: Address) -> Result<bool, LedgerError>;
}

#[async_trait::async_trait]
pub trait MarketFactory: Send + Sync {
    async fn create_market(&self, triple: &TokenTriple) -> Result<TransactionResult, LedgerError>;
}

/// Remote key-value store holding market parameters.
#[async_trait::async_trait]
pub trait DataStore: Send + Sync {
    /// `None` when nothing is stored under `key`.
    async fn read_uint(&self, key: B256) -> Result<Option<U256>, LedgerError>;

    async fn write_uint(&self, key: B256, value: U256) -> Result<TransactionResult, LedgerError>;
}
