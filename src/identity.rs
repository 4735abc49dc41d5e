//! Market identity derivation.
//!
//! The market factory deploys every market token with CREATE2, so the token address
//! is known before the market exists:
//!
//! ```text
//! salt     = keccak256(abi.encode("GMX_MARKET", indexToken, longToken, shortToken))
//! initCode = marketTokenCreationCode ++ abi.encode(roleStore, dataStore)
//! address  = keccak256(0xff ++ marketFactory ++ salt ++ keccak256(initCode))[12..]
//! ```
//!
//! This must stay byte-for-byte identical to the factory's own scheme. A drift here
//! makes every probe answer for the wrong address.

use alloy_primitives::{keccak256, Address, Bytes, B256};
use alloy_sol_types::SolValue;

use crate::models::{MarketIdentity, RegistryAddresses, TokenTriple};

/// Salt namespace used by the market factory.
pub const MARKET_SALT_NAMESPACE: &str = "GMX_MARKET";

/// CREATE2 salt for a token triple.
pub fn market_salt(triple: &TokenTriple) -> B256 {
    let encoded = (
        MARKET_SALT_NAMESPACE.to_string(),
        triple.index,
        triple.long,
        triple.short,
    )
        .abi_encode_params();
    keccak256(encoded)
}

/// Market token creation code with its constructor arguments appended.
pub fn market_init_code(creation_code: &[u8], role_store: Address, data_store: Address) -> Vec<u8> {
    let mut init_code = creation_code.to_vec();
    init_code.extend_from_slice(&(role_store, data_store).abi_encode_params());
    init_code
}

/// Derive a market identity from scratch.
pub fn derive_market_identity(
    triple: &TokenTriple,
    registry: &RegistryAddresses,
    creation_code: &[u8],
) -> MarketIdentity {
    let init_code = market_init_code(creation_code, registry.role_store, registry.data_store);
    MarketIdentity(
        registry
            .market_factory
            .create2_from_code(market_salt(triple), init_code),
    )
}

/// Identity deriver bound to one deployment.
///
/// The init code only depends on the registry addresses, so its hash is computed once.
#[derive(Debug, Clone)]
pub struct IdentityDeriver {
    registry: RegistryAddresses,
    init_code_hash: B256,
}

impl IdentityDeriver {
    pub fn new(registry: RegistryAddresses, creation_code: &Bytes) -> Self {
        let init_code = market_init_code(creation_code, registry.role_store, registry.data_store);
        Self {
            registry,
            init_code_hash: keccak256(init_code),
        }
    }

    pub fn registry(&self) -> &RegistryAddresses {
        &self.registry
    }

    pub fn init_code_hash(&self) -> B256 {
        self.init_code_hash
    }

    pub fn derive(&self, triple: &TokenTriple) -> MarketIdentity {
        MarketIdentity(
            self.registry
                .market_factory
                .create2(market_salt(triple), self.init_code_hash),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256, bytes};

    const WETH: Address = address!("82af49447d8a07e3bd95bd0d56f35241523fbab1");
    const USDC: Address = address!("af88d065e77c8cc2239327c5edb3a432268e5831");

    fn registry() -> RegistryAddresses {
        RegistryAddresses {
            market_factory: address!("2222222222222222222222222222222222222222"),
            role_store: address!("3333333333333333333333333333333333333333"),
            data_store: address!("4444444444444444444444444444444444444444"),
        }
    }

    #[test]
    fn test_create2_matches_eip1014_vector() {
        let derived = Address::ZERO.create2_from_code(B256::ZERO, [0x00u8]);
        assert_eq!(derived, address!("4d1a2e2bb4f88f0250f26ffff098b0b30b26bf38"));
    }

    #[test]
    fn test_market_salt_pinned() {
        let triple = TokenTriple::new(WETH, WETH, USDC);
        assert_eq!(
            market_salt(&triple),
            b256!("f3ef317e831d44658668825c96b3322c532f3237c9e24e31b594c79792db0ad7")
        );
    }

    #[test]
    fn test_market_identity_pinned() {
        let triple = TokenTriple::new(WETH, WETH, USDC);
        let code = bytes!("6080604052");

        let identity = derive_market_identity(&triple, &registry(), &code);
        assert_eq!(
            identity.address(),
            address!("c625b2669851a55c2a4922992bd5b1b995e0ad79")
        );
        assert_eq!(IdentityDeriver::new(registry(), &code).derive(&triple), identity);
    }

    #[test]
    fn test_derivation_is_deterministic_and_order_sensitive() {
        let code = bytes!("6080604052");
        let deriver = IdentityDeriver::new(registry(), &code);

        let a = deriver.derive(&TokenTriple::new(WETH, WETH, USDC));
        let b = deriver.derive(&TokenTriple::new(WETH, WETH, USDC));
        let swapped = deriver.derive(&TokenTriple::new(WETH, USDC, WETH));

        assert_eq!(a, b);
        assert_ne!(a, swapped);
    }

    #[test]
    fn test_registry_addresses_change_identity() {
        let code = bytes!("6080604052");
        let triple = TokenTriple::new(WETH, WETH, USDC);
        let base = IdentityDeriver::new(registry(), &code).derive(&triple);

        let mut other = registry();
        other.data_store = address!("5555555555555555555555555555555555555555");
        assert_ne!(IdentityDeriver::new(other, &code).derive(&triple), base);

        let mut other = registry();
        other.market_factory = address!("5555555555555555555555555555555555555555");
        assert_ne!(IdentityDeriver::new(other, &code).derive(&triple), base);
    }
}
