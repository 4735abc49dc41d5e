//! Data store key derivation.
//!
//! Keys are read back by the exchange contracts, so the byte layout is a contract with
//! them:
//!
//! ```text
//! hashString(NAME)            = keccak256(abi.encode(NAME))
//! key(NAME, market)           = keccak256(abi.encode(hashString(NAME), market))
//! key(NAME, market, flag)     = keccak256(abi.encode(hashString(NAME), market, flag))
//! ```
//!
//! [`PARAMETER_TABLE`] maps every parameter name accepted in a deployment file to the
//! function that derives its key.

use alloy_primitives::{keccak256, B256};
use alloy_sol_types::SolValue;

use crate::models::MarketIdentity;

/// Storage key of one scalar parameter in the data store.
pub type ParameterKey = B256;

pub const RESERVE_FACTOR: &str = "RESERVE_FACTOR";
pub const MAX_PNL_FACTOR: &str = "MAX_PNL_FACTOR";
pub const MAX_PNL_FACTOR_FOR_WITHDRAWALS: &str = "MAX_PNL_FACTOR_FOR_WITHDRAWALS";
pub const POSITION_FEE_FACTOR: &str = "POSITION_FEE_FACTOR";
pub const POSITION_IMPACT_EXPONENT_FACTOR: &str = "POSITION_IMPACT_EXPONENT_FACTOR";
pub const SWAP_FEE_FACTOR: &str = "SWAP_FEE_FACTOR";
pub const SWAP_IMPACT_EXPONENT_FACTOR: &str = "SWAP_IMPACT_EXPONENT_FACTOR";
pub const POSITION_IMPACT_FACTOR: &str = "POSITION_IMPACT_FACTOR";
pub const MAX_POSITION_IMPACT_FACTOR: &str = "MAX_POSITION_IMPACT_FACTOR";
pub const SWAP_IMPACT_FACTOR: &str = "SWAP_IMPACT_FACTOR";

pub fn hash_string(value: &str) -> B256 {
    keccak256((value.to_string(),).abi_encode_params())
}

/// Key scoped to a market.
pub fn market_key(name: &str, market: &MarketIdentity) -> ParameterKey {
    keccak256((hash_string(name), market.address()).abi_encode_params())
}

/// Key scoped to a market and a side (long/short or positive/negative).
pub fn flagged_market_key(name: &str, market: &MarketIdentity, flag: bool) -> ParameterKey {
    keccak256((hash_string(name), market.address(), flag).abi_encode_params())
}

pub fn reserve_factor_key(market: &MarketIdentity, is_long: bool) -> ParameterKey {
    flagged_market_key(RESERVE_FACTOR, market, is_long)
}

pub fn max_pnl_factor_key(market: &MarketIdentity, is_long: bool) -> ParameterKey {
    flagged_market_key(MAX_PNL_FACTOR, market, is_long)
}

pub fn max_pnl_factor_for_withdrawals_key(market: &MarketIdentity, is_long: bool) -> ParameterKey {
    flagged_market_key(MAX_PNL_FACTOR_FOR_WITHDRAWALS, market, is_long)
}

pub fn position_fee_factor_key(market: &MarketIdentity) -> ParameterKey {
    market_key(POSITION_FEE_FACTOR, market)
}

pub fn position_impact_exponent_factor_key(market: &MarketIdentity) -> ParameterKey {
    market_key(POSITION_IMPACT_EXPONENT_FACTOR, market)
}

pub fn swap_fee_factor_key(market: &MarketIdentity) -> ParameterKey {
    market_key(SWAP_FEE_FACTOR, market)
}

pub fn swap_impact_exponent_factor_key(market: &MarketIdentity) -> ParameterKey {
    market_key(SWAP_IMPACT_EXPONENT_FACTOR, market)
}

pub fn position_impact_factor_key(market: &MarketIdentity, is_positive: bool) -> ParameterKey {
    flagged_market_key(POSITION_IMPACT_FACTOR, market, is_positive)
}

pub fn max_position_impact_factor_key(market: &MarketIdentity, is_positive: bool) -> ParameterKey {
    flagged_market_key(MAX_POSITION_IMPACT_FACTOR, market, is_positive)
}

pub fn swap_impact_factor_key(market: &MarketIdentity, is_positive: bool) -> ParameterKey {
    flagged_market_key(SWAP_IMPACT_FACTOR, market, is_positive)
}

/// How a parameter's key is derived.
#[derive(Clone, Copy)]
pub enum KeyDerivation {
    /// One value per market.
    Market(fn(&MarketIdentity) -> ParameterKey),
    /// Long (`true`) or short (`false`) variant.
    PerSide(fn(&MarketIdentity, bool) -> ParameterKey, bool),
    /// Positive (`true`) or negative (`false`) variant.
    SignedPair(fn(&MarketIdentity, bool) -> ParameterKey, bool),
}

impl std::fmt::Debug for KeyDerivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market(_) => write!(f, "Market"),
            Self::PerSide(_, flag) => write!(f, "PerSide({})", flag),
            Self::SignedPair(_, flag) => write!(f, "SignedPair({})", flag),
        }
    }
}

/// One row of the parameter dispatch table.
#[derive(Debug, Clone, Copy)]
pub struct ParameterBinding {
    /// Name used in deployment files.
    pub name: &'static str,
    /// Human wording used in audit descriptions.
    pub label: &'static str,
    pub derivation: KeyDerivation,
}

impl ParameterBinding {
    pub fn key(&self, market: &MarketIdentity) -> ParameterKey {
        match self.derivation {
            KeyDerivation::Market(derive) => derive(market),
            KeyDerivation::PerSide(derive, flag) | KeyDerivation::SignedPair(derive, flag) => {
                derive(market, flag)
            }
        }
    }

    /// Side wording for logs, if the parameter has one.
    pub fn side(&self) -> Option<&'static str> {
        match self.derivation {
            KeyDerivation::Market(_) => None,
            KeyDerivation::PerSide(_, flag) => Some(if flag { "long" } else { "short" }),
            KeyDerivation::SignedPair(_, flag) => Some(if flag { "positive" } else { "negative" }),
        }
    }

    pub fn describe(&self, market: &MarketIdentity) -> String {
        match self.derivation {
            KeyDerivation::Market(_) => format!("{} for {}", self.name, market),
            KeyDerivation::PerSide(_, flag) => {
                format!("{} {} {}", self.label, market, if flag { "long" } else { "short" })
            }
            KeyDerivation::SignedPair(_, flag) => format!(
                "{} {} for {}",
                if flag { "positive" } else { "negative" },
                self.label,
                market
            ),
        }
    }
}

/// Every synchronizable parameter, in synchronization order.
pub static PARAMETER_TABLE: &[ParameterBinding] = &[
    ParameterBinding {
        name: "reserveFactorLongs",
        label: "reserve factor",
        derivation: KeyDerivation::PerSide(reserve_factor_key, true),
    },
    ParameterBinding {
        name: "reserveFactorShorts",
        label: "reserve factor",
        derivation: KeyDerivation::PerSide(reserve_factor_key, false),
    },
    ParameterBinding {
        name: "maxPnlFactorLongs",
        label: "max pnl factor",
        derivation: KeyDerivation::PerSide(max_pnl_factor_key, true),
    },
    ParameterBinding {
        name: "maxPnlFactorShorts",
        label: "max pnl factor",
        derivation: KeyDerivation::PerSide(max_pnl_factor_key, false),
    },
    ParameterBinding {
        name: "maxPnlFactorForWithdrawalsLongs",
        label: "max pnl factor for withdrawals",
        derivation: KeyDerivation::PerSide(max_pnl_factor_for_withdrawals_key, true),
    },
    ParameterBinding {
        name: "maxPnlFactorForWithdrawalsShorts",
        label: "max pnl factor for withdrawals",
        derivation: KeyDerivation::PerSide(max_pnl_factor_for_withdrawals_key, false),
    },
    ParameterBinding {
        name: "positionFeeFactor",
        label: "position fee factor",
        derivation: KeyDerivation::Market(position_fee_factor_key),
    },
    ParameterBinding {
        name: "positionImpactExponentFactor",
        label: "position impact exponent factor",
        derivation: KeyDerivation::Market(position_impact_exponent_factor_key),
    },
    ParameterBinding {
        name: "swapFeeFactor",
        label: "swap fee factor",
        derivation: KeyDerivation::Market(swap_fee_factor_key),
    },
    ParameterBinding {
        name: "swapImpactExponentFactor",
        label: "swap impact exponent factor",
        derivation: KeyDerivation::Market(swap_impact_exponent_factor_key),
    },
    ParameterBinding {
        name: "positivePositionImpactFactor",
        label: "position impact factor",
        derivation: KeyDerivation::SignedPair(position_impact_factor_key, true),
    },
    ParameterBinding {
        name: "negativePositionImpactFactor",
        label: "position impact factor",
        derivation: KeyDerivation::SignedPair(position_impact_factor_key, false),
    },
    ParameterBinding {
        name: "positiveMaxPositionImpactFactor",
        label: "max position impact factor",
        derivation: KeyDerivation::SignedPair(max_position_impact_factor_key, true),
    },
    ParameterBinding {
        name: "negativeMaxPositionImpactFactor",
        label: "max position impact factor",
        derivation: KeyDerivation::SignedPair(max_position_impact_factor_key, false),
    },
    ParameterBinding {
        name: "positiveSwapImpactFactor",
        label: "swap impact factor",
        derivation: KeyDerivation::SignedPair(swap_impact_factor_key, true),
    },
    ParameterBinding {
        name: "negativeSwapImpactFactor",
        label: "swap impact factor",
        derivation: KeyDerivation::SignedPair(swap_impact_factor_key, false),
    },
];

/// Look up a parameter by its deployment-file name.
pub fn binding(name: &str) -> Option<&'static ParameterBinding> {
    PARAMETER_TABLE.iter().find(|b| b.name == name)
}

/// Derive the key of a named parameter.
pub fn derive_key(name: &str, market: &MarketIdentity) -> Option<ParameterKey> {
    binding(name).map(|b| b.key(market))
}
