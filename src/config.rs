//! Deployment file: network endpoint, registry contracts, token table and desired markets.
//!
//! ```toml
//! [network]
//! name = "localhost"
//! rpc_url = "http://127.0.0.1:8545"
//! deployer = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
//!
//! [contracts]
//! market_factory = "0x..."
//! role_store = "0x..."
//! data_store = "0x..."
//! market_token_artifact = "artifacts/MarketToken.json"
//!
//! [tokens]
//! ETH = "0x..."
//! USDC = "0x..."
//!
//! [[markets]]
//! tokens = ["ETH", "ETH", "USDC"]
//! reserveFactorLongs = "500000000000000000000000000000"
//! positionFeeFactor = 0
//! ```
//!
//! Values may be TOML integers or decimal / `0x` hex strings. Validation collects every
//! problem instead of stopping at the first.

use alloy_primitives::{Address, Bytes, U256};
use anyhow::{anyhow, Context, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::ResolveError;
use crate::keys;
use crate::ledger::{RpcLedgerConfig, TokenRegistry};
use crate::models::{DesiredState, MarketSpec, RegistryAddresses, TokenIdentity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub rpc_url: String,
    /// Unlocked account on the node that sends every transaction.
    pub deployer: Address,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_confirmation_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractsConfig {
    pub market_factory: Address,
    pub role_store: Address,
    pub data_store: Address,
    /// Market token creation code, hex encoded.
    #[serde(default)]
    pub market_token_bytecode: Option<String>,
    /// Compiled artifact JSON with a `bytecode` field, relative to the deployment file.
    #[serde(default)]
    pub market_token_artifact: Option<PathBuf>,
}

/// Unsigned 256-bit value accepted as a TOML integer or a decimal / hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FactorValue(pub U256);

impl<'de> Deserialize<'de> for FactorValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FactorVisitor;

        impl<'de> Visitor<'de> for FactorVisitor {
            type Value = FactorValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a non-negative integer or an integer string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(FactorValue(U256::from(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(|v| FactorValue(U256::from(v)))
                    .map_err(|_| E::custom(format!("negative value {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let cleaned: String = v.trim().chars().filter(|c| *c != '_').collect();
                U256::from_str(&cleaned)
                    .map(FactorValue)
                    .map_err(|e| E::custom(format!("invalid value {:?}: {}", v, e)))
            }
        }

        deserializer.deserialize_any(FactorVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEntry {
    pub tokens: Vec<String>,
    /// Every other key is a parameter.
    #[serde(flatten)]
    pub parameters: BTreeMap<String, FactorValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub network: NetworkConfig,
    pub contracts: ContractsConfig,
    #[serde(default)]
    pub tokens: BTreeMap<String, Address>,
    #[serde(default)]
    pub markets: Vec<MarketEntry>,
    /// Directory the deployment file was loaded from; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// A problem in the deployment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    pub field: String,
    pub description: String,
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.field, self.description)
    }
}

fn violation(field: impl Into<String>, description: impl Into<String>) -> ConfigViolation {
    ConfigViolation {
        field: field.into(),
        description: description.into(),
    }
}

impl DeploymentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read deployment file {}", path.display()))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse deployment file {}", path.display()))?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// `RECONCILER_RPC_URL` and `RECONCILER_DEPLOYER` win over the file.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("RECONCILER_RPC_URL") {
            if !url.is_empty() {
                info!("RPC URL overridden from environment");
                self.network.rpc_url = url;
            }
        }
        if let Ok(deployer) = std::env::var("RECONCILER_DEPLOYER") {
            if !deployer.is_empty() {
                self.network.deployer = Address::from_str(deployer.trim())
                    .with_context(|| format!("invalid RECONCILER_DEPLOYER {:?}", deployer))?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();

        if self.network.rpc_url.trim().is_empty() {
            violations.push(violation("network.rpc_url", "RPC URL is empty"));
        }
        if self.network.deployer.is_zero() {
            violations.push(violation("network.deployer", "deployer is the zero address"));
        }
        if self.network.poll_interval_ms == 0 {
            violations.push(violation("network.poll_interval_ms", "poll interval must be positive"));
        }

        for (field, address) in [
            ("contracts.market_factory", self.contracts.market_factory),
            ("contracts.role_store", self.contracts.role_store),
            ("contracts.data_store", self.contracts.data_store),
        ] {
            if address.is_zero() {
                violations.push(violation(field, "address is the zero address"));
            }
        }

        match (
            &self.contracts.market_token_bytecode,
            &self.contracts.market_token_artifact,
        ) {
            (Some(_), Some(_)) => violations.push(violation(
                "contracts.market_token_bytecode",
                "set either market_token_bytecode or market_token_artifact, not both",
            )),
            (None, None) => violations.push(violation(
                "contracts.market_token_bytecode",
                "market token creation code is required (market_token_bytecode or market_token_artifact)",
            )),
            _ => {}
        }

        for (i, market) in self.markets.iter().enumerate() {
            if market.tokens.len() != 3 {
                violations.push(violation(
                    format!("markets[{}].tokens", i),
                    format!(
                        "expected [index, long, short] symbols, got {} entries",
                        market.tokens.len()
                    ),
                ));
            }
            for name in market.parameters.keys() {
                if keys::binding(name).is_none() {
                    violations.push(violation(
                        format!("markets[{}].{}", i, name),
                        "unknown market parameter",
                    ));
                }
            }
        }

        violations
    }

    pub fn registry(&self) -> RegistryAddresses {
        RegistryAddresses {
            market_factory: self.contracts.market_factory,
            role_store: self.contracts.role_store,
            data_store: self.contracts.data_store,
        }
    }

    /// Market token creation code, inline or from the artifact file.
    pub fn creation_code(&self) -> Result<Bytes> {
        if let Some(raw) = &self.contracts.market_token_bytecode {
            return parse_bytecode(raw).context("invalid contracts.market_token_bytecode");
        }

        let artifact = self
            .contracts
            .market_token_artifact
            .as_ref()
            .ok_or_else(|| anyhow!("no market token creation code configured"))?;
        let path = self.base_dir.join(artifact);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read artifact {}", path.display()))?;
        let json: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse artifact {}", path.display()))?;
        let raw = json
            .get("bytecode")
            .and_then(|v| v.as_str().or_else(|| v.get("object").and_then(|o| o.as_str())))
            .ok_or_else(|| anyhow!("artifact {} has no bytecode field", path.display()))?;
        parse_bytecode(raw).with_context(|| format!("invalid bytecode in {}", path.display()))
    }

    /// Ordered desired-state list. Call after [`validate`](Self::validate) passes.
    pub fn desired_state(&self) -> Result<DesiredState> {
        let markets = self
            .markets
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let tokens: [String; 3] = entry
                    .tokens
                    .clone()
                    .try_into()
                    .map_err(|_| anyhow!("markets[{}] must name exactly three tokens", i))?;
                Ok(MarketSpec {
                    tokens,
                    parameters: entry
                        .parameters
                        .iter()
                        .map(|(name, value)| (name.clone(), value.0))
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(DesiredState {
            network: self.network.name.clone(),
            registry: self.registry(),
            markets,
        })
    }

    pub fn token_registry(&self) -> StaticTokenRegistry {
        StaticTokenRegistry::from_pairs(self.tokens.iter().map(|(s, a)| (s.as_str(), *a)))
    }

    pub fn rpc_ledger_config(&self) -> RpcLedgerConfig {
        RpcLedgerConfig {
            rpc_url: self.network.rpc_url.clone(),
            deployer: self.network.deployer,
            market_factory: self.contracts.market_factory,
            data_store: self.contracts.data_store,
            request_timeout: Duration::from_secs(self.network.request_timeout_secs),
            confirmation_timeout: Duration::from_secs(self.network.confirmation_timeout_secs),
            poll_interval: Duration::from_millis(self.network.poll_interval_ms),
        }
    }
}

fn parse_bytecode(raw: &str) -> Result<Bytes> {
    let bytes = hex::decode(raw.trim().trim_start_matches("0x"))?;
    if bytes.is_empty() {
        return Err(anyhow!("bytecode is empty"));
    }
    Ok(Bytes::from(bytes))
}

/// Token registry backed by the deployment file's `[tokens]` table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenRegistry {
    tokens: HashMap<String, TokenIdentity>,
}

impl StaticTokenRegistry {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, TokenIdentity)>) -> Self {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(symbol, address)| (symbol.to_string(), address))
                .collect(),
        }
    }
}

impl TokenRegistry for StaticTokenRegistry {
    fn resolve(&self, symbol: &str) -> Result<TokenIdentity, ResolveError> {
        self.tokens
            .get(symbol)
            .copied()
            .ok_or_else(|| ResolveError::UnknownSymbol(symbol.to_string()))
    }
}
