//! In-process ledger.
//!
//! Implements the factory, code query and data store against local maps, with
//! counters and failure injection. The factory places code at the identity the
//! real factory would use.

use alloy_primitives::{keccak256, Address, B256, U256};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::{DataStore, LedgerQuery, MarketFactory, TransactionResult};
use crate::error::LedgerError;
use crate::identity::IdentityDeriver;
use crate::models::TokenTriple;

#[derive(Debug, Default)]
struct MemoryState {
    code: HashSet<Address>,
    values: HashMap<B256, U256>,
    block_number: u64,
    probes: usize,
    reads: usize,
    creations: Vec<TokenTriple>,
    writes: Vec<(B256, U256)>,
    failing_creations: HashMap<TokenTriple, String>,
    failing_writes: HashMap<B256, String>,
    unreachable: bool,
}

impl MemoryState {
    fn next_receipt(&mut self, payload: &[u8]) -> TransactionResult {
        self.block_number += 1;
        let mut preimage = self.block_number.to_be_bytes().to_vec();
        preimage.extend_from_slice(payload);
        TransactionResult {
            tx_hash: keccak256(preimage),
            block_number: Some(self.block_number),
            gas_used: Some(21_000),
        }
    }

    fn check_reachable(&self) -> Result<(), LedgerError> {
        if self.unreachable {
            return Err(LedgerError::communication("endpoint unreachable"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryLedger {
    deriver: IdentityDeriver,
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new(deriver: IdentityDeriver) -> Self {
        Self {
            deriver,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn deploy_code_at(&self, address: Address) {
        self.state.lock().code.insert(address);
    }

    pub fn set_uint(&self, key: B256, value: U256) {
        self.state.lock().values.insert(key, value);
    }

    pub fn uint(&self, key: B256) -> Option<U256> {
        self.state.lock().values.get(&key).copied()
    }

    pub fn has_code(&self, address: Address) -> bool {
        self.state.lock().code.contains(&address)
    }

    /// Make `create_market` revert for this triple.
    pub fn fail_creation_for(&self, triple: TokenTriple, reason: &str) {
        self.state
            .lock()
            .failing_creations
            .insert(triple, reason.to_string());
    }

    /// Make `write_uint` revert for this key.
    pub fn fail_writes_for(&self, key: B256, reason: &str) {
        self.state.lock().failing_writes.insert(key, reason.to_string());
    }

    /// Every call fails with a communication error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn probe_count(&self) -> usize {
        self.state.lock().probes
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn creation_count(&self) -> usize {
        self.state.lock().creations.len()
    }

    pub fn creations(&self) -> Vec<TokenTriple> {
        self.state.lock().creations.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn writes(&self) -> Vec<(B256, U256)> {
        self.state.lock().writes.clone()
    }

    pub fn reset_counters(&self) {
        let mut state = self.state.lock();
        state.probes = 0;
        state.reads = 0;
        state.creations.clear();
        state.writes.clear();
    }
}

#[async_trait::async_trait]
impl LedgerQuery for MemoryLedger {
    async fn code_exists_at(&self, address: Address) -> Result<bool, LedgerError> {
        let mut state = self.state.lock();
        state.check_reachable()?;
        state.probes += 1;
        Ok(state.code.contains(&address))
    }
}

#[async_trait::async_trait]
impl MarketFactory for MemoryLedger {
    async fn create_market(&self, triple: &TokenTriple) -> Result<TransactionResult, LedgerError> {
        let identity = self.deriver.derive(triple);
        let mut state = self.state.lock();
        state.check_reachable()?;
        state.creations.push(*triple);

        if let Some(reason) = state.failing_creations.get(triple) {
            return Err(LedgerError::reverted(reason.clone()));
        }
        if !state.code.insert(identity.address()) {
            return Err(LedgerError::reverted("market already exists"));
        }

        Ok(state.next_receipt(identity.address().as_slice()))
    }
}

#[async_trait::async_trait]
impl DataStore for MemoryLedger {
    async fn read_uint(&self, key: B256) -> Result<Option<U256>, LedgerError> {
        let mut state = self.state.lock();
        state.check_reachable()?;
        state.reads += 1;
        Ok(state.values.get(&key).copied())
    }

    async fn write_uint(&self, key: B256, value: U256) -> Result<TransactionResult, LedgerError> {
        let mut state = self.state.lock();
        state.check_reachable()?;
        state.writes.push((key, value));

        if let Some(reason) = state.failing_writes.get(&key) {
            return Err(LedgerError::reverted(reason.clone()));
        }
        state.values.insert(key, value);

        Ok(state.next_receipt(key.as_slice()))
    }
}
