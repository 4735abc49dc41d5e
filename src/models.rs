//! Domain types shared by the deriver, collaborators and the driver.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Address of a fungible token, resolved from its symbol.
pub type TokenIdentity = Address;

/// Deterministic address of a market token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketIdentity(pub Address);

impl MarketIdentity {
    pub fn address(&self) -> Address {
        self.0
    }
}

impl fmt::Display for MarketIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered (index, long collateral, short collateral) token triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenTriple {
    pub index: TokenIdentity,
    pub long: TokenIdentity,
    pub short: TokenIdentity,
}

impl TokenTriple {
    pub fn new(index: TokenIdentity, long: TokenIdentity, short: TokenIdentity) -> Self {
        Self { index, long, short }
    }
}

/// The three fixed registry contracts a market identity depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAddresses {
    pub market_factory: Address,
    pub role_store: Address,
    pub data_store: Address,
}

/// Desired state of one market: token symbols plus the scalar parameters to keep in sync.
///
/// A parameter missing from `parameters` is left alone. Zero is a real value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSpec {
    /// Index, long and short token symbols in that order.
    pub tokens: [String; 3],
    #[serde(default)]
    pub parameters: BTreeMap<String, U256>,
}

impl MarketSpec {
    pub fn new(index: &str, long: &str, short: &str) -> Self {
        Self {
            tokens: [index.to_string(), long.to_string(), short.to_string()],
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(self, name: &str, value: u64) -> Self {
        self.with_factor(name, U256::from(value))
    }

    /// Full-width variant for factors scaled past `u64` (e.g. 30-decimal fixed point).
    pub fn with_factor(mut self, name: &str, value: U256) -> Self {
        self.parameters.insert(name.to_string(), value);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<U256> {
        self.parameters.get(name).copied()
    }

    /// `INDEX:LONG:SHORT`, as used in logs.
    pub fn label(&self) -> String {
        self.tokens.join(":")
    }
}

/// Everything the desired-state source hands to the driver.
#[derive(Debug, Clone)]
pub struct DesiredState {
    /// Network name, used only for logging.
    pub network: String,
    pub registry: RegistryAddresses,
    pub markets: Vec<MarketSpec>,
}
