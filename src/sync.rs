//! Diff-then-write synchronization of scalar parameters.
//!
//! Every desired value is compared against the stored one before anything is sent,
//! so a second run with unchanged inputs writes nothing and an interrupted run only
//! finishes what is left.

use alloy_primitives::U256;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::LedgerError;
use crate::keys::ParameterKey;
use crate::ledger::DataStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The stored value differed. `applied` is false on a dry run.
    Written {
        previous: Option<U256>,
        applied: bool,
    },
    Skipped,
}

/// Unset keys read as zero on chain, so they compare equal to a desired zero.
pub fn values_match(stored: Option<U256>, desired: U256) -> bool {
    stored.unwrap_or(U256::ZERO) == desired
}

pub struct ConfigSynchronizer<'a> {
    store: &'a dyn DataStore,
    audit: &'a dyn AuditSink,
    dry_run: bool,
}

impl<'a> ConfigSynchronizer<'a> {
    pub fn new(store: &'a dyn DataStore, audit: &'a dyn AuditSink) -> Self {
        Self {
            store,
            audit,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn sync_if_different(
        &self,
        key: ParameterKey,
        desired: U256,
        description: &str,
    ) -> Result<SyncOutcome, LedgerError> {
        let stored = self.store.read_uint(key).await?;

        if values_match(stored, desired) {
            self.audit.record(&AuditEvent::ParameterSkipped {
                key,
                description: description.to_string(),
                value: desired,
            });
            return Ok(SyncOutcome::Skipped);
        }

        if !self.dry_run {
            self.store.write_uint(key, desired).await?;
        }

        self.audit.record(&AuditEvent::ParameterWritten {
            key,
            description: description.to_string(),
            old_value: stored,
            new_value: desired,
            applied: !self.dry_run,
        });

        Ok(SyncOutcome::Written {
            previous: stored,
            applied: !self.dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::identity::IdentityDeriver;
    use crate::ledger::MemoryLedger;
    use crate::models::RegistryAddresses;
    use alloy_primitives::{Address, Bytes, B256};

    fn ledger() -> MemoryLedger {
        let registry = RegistryAddresses {
            market_factory: Address::repeat_byte(1),
            role_store: Address::repeat_byte(2),
            data_store: Address::repeat_byte(3),
        };
        MemoryLedger::new(IdentityDeriver::new(registry, &Bytes::from_static(&[0x60, 0x80])))
    }

    #[tokio::test]
    async fn test_converges_after_one_write() {
        let store = ledger();
        let audit = MemoryAuditSink::new();
        let sync = ConfigSynchronizer::new(&store, &audit);
        let key = B256::repeat_byte(7);

        let first = sync.sync_if_different(key, U256::from(7000u64), "reserve factor").await.unwrap();
        let second = sync.sync_if_different(key, U256::from(7000u64), "reserve factor").await.unwrap();

        assert_eq!(
            first,
            SyncOutcome::Written {
                previous: None,
                applied: true
            }
        );
        assert_eq!(second, SyncOutcome::Skipped);
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.read_count(), 2);
        assert_eq!(audit.write_count(), 1);
    }

    #[tokio::test]
    async fn test_exact_comparison() {
        let store = ledger();
        let audit = MemoryAuditSink::new();
        let key = B256::repeat_byte(7);
        let big = U256::from(10u64).pow(U256::from(30u64));
        store.set_uint(key, big);

        let sync = ConfigSynchronizer::new(&store, &audit);
        let outcome = sync.sync_if_different(key, big + U256::from(1u64), "factor").await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Written {
                previous: Some(big),
                applied: true
            }
        );
        assert_eq!(store.uint(key), Some(big + U256::from(1u64)));
    }

    #[tokio::test]
    async fn test_zero_against_unset_is_skipped() {
        let store = ledger();
        let audit = MemoryAuditSink::new();
        let sync = ConfigSynchronizer::new(&store, &audit);

        let outcome = sync.sync_if_different(B256::repeat_byte(9), U256::ZERO, "fee").await.unwrap();

        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(store.read_count(), 1);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_reads_but_never_writes() {
        let store = ledger();
        let audit = MemoryAuditSink::new();
        let sync = ConfigSynchronizer::new(&store, &audit).dry_run(true);

        let outcome = sync.sync_if_different(B256::repeat_byte(9), U256::from(1u64), "fee").await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Written {
                previous: None,
                applied: false
            }
        );
        assert_eq!(store.write_count(), 0);
        assert_eq!(audit.write_count(), 0);
        assert_eq!(audit.events().len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_surfaced() {
        let store = ledger();
        let audit = MemoryAuditSink::new();
        let key = B256::repeat_byte(9);
        store.fail_writes_for(key, "not a controller");

        let sync = ConfigSynchronizer::new(&store, &audit);
        let err = sync.sync_if_different(key, U256::from(1u64), "fee").await.unwrap_err();

        assert_eq!(err, LedgerError::reverted("not a controller"));
        assert!(audit.events().is_empty());
    }
}
