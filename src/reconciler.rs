//! Reconciliation driver.
//!
//! Two passes over the desired markets:
//! 1. creation: derive identity, probe for code, create when absent
//! 2. configuration: re-derive identity, sync every parameter the market sets
//!
//! Writes (creations and parameter updates) are issued one at a time and in list order.
//! Existence probes are reads and may run ahead of the creation loop
//! (`probe_concurrency`). A per-market failure never stops the run; a communication
//! failure aborts the remaining queue unless the caller asks to continue.

use alloy_primitives::Bytes;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{LedgerError, ResolveError};
use crate::identity::IdentityDeriver;
use crate::keys::{self, PARAMETER_TABLE};
use crate::ledger::{DataStore, LedgerQuery, MarketFactory, TokenRegistry, TransactionResult};
use crate::models::{DesiredState, MarketIdentity, MarketSpec, TokenTriple};
use crate::sync::{ConfigSynchronizer, SyncOutcome};

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Probe and read everything, send nothing.
    pub dry_run: bool,
    /// Stop the whole run on the first communication error.
    pub abort_on_communication_error: bool,
    /// Existence probes allowed in flight during the creation pass.
    pub probe_concurrency: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            abort_on_communication_error: true,
            probe_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub markets_created: usize,
    pub markets_existing: usize,
    pub markets_failed: usize,
    pub markets_skipped: usize,
    pub parameters_written: usize,
    pub parameters_skipped: usize,
    pub parameters_failed: usize,
}

impl ReconcileReport {
    pub fn failures(&self) -> usize {
        self.markets_failed + self.markets_skipped + self.parameters_failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The desired-state list was empty.
    NothingToDo,
    Completed(ReconcileReport),
    /// A communication error stopped the run; `report` covers what happened before it.
    Aborted {
        report: ReconcileReport,
        error: LedgerError,
    },
}

impl ReconcileOutcome {
    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            Self::NothingToDo => None,
            Self::Completed(report) | Self::Aborted { report, .. } => Some(report),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Exists,
    Absent,
}

/// External collaborators used by the driver.
#[derive(Clone)]
pub struct Collaborators {
    pub tokens: Arc<dyn TokenRegistry>,
    pub ledger: Arc<dyn LedgerQuery>,
    pub factory: Arc<dyn MarketFactory>,
    pub store: Arc<dyn DataStore>,
}

impl Collaborators {
    /// All three ledger roles served by one backend.
    pub fn from_ledger<L>(tokens: Arc<dyn TokenRegistry>, ledger: Arc<L>) -> Self
    where
        L: LedgerQuery + MarketFactory + DataStore + 'static,
    {
        Self {
            tokens,
            ledger: ledger.clone(),
            factory: ledger.clone(),
            store: ledger,
        }
    }
}

/// A market whose symbols resolved.
struct ResolvedMarket<'a> {
    spec: &'a MarketSpec,
    label: String,
    triple: TokenTriple,
}

pub struct Reconciler {
    creation_code: Bytes,
    collaborators: Collaborators,
    audit: Arc<dyn AuditSink>,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(creation_code: Bytes, collaborators: Collaborators, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            creation_code,
            collaborators,
            audit,
            options: ReconcileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    pub fn resolve(&self, spec: &MarketSpec) -> Result<TokenTriple, ResolveError> {
        let tokens = &self.collaborators.tokens;
        Ok(TokenTriple::new(
            tokens.resolve(&spec.tokens[0])?,
            tokens.resolve(&spec.tokens[1])?,
            tokens.resolve(&spec.tokens[2])?,
        ))
    }

    pub async fn probe(&self, identity: MarketIdentity) -> Result<ProbeResult, LedgerError> {
        let exists = self.collaborators.ledger.code_exists_at(identity.address()).await?;
        Ok(if exists {
            ProbeResult::Exists
        } else {
            ProbeResult::Absent
        })
    }

    /// Create the market, or only announce it on a dry run (`Ok(None)`).
    pub async fn create(&self, triple: &TokenTriple) -> Result<Option<TransactionResult>, LedgerError> {
        if self.options.dry_run {
            return Ok(None);
        }
        self.collaborators.factory.create_market(triple).await.map(Some)
    }

    pub async fn reconcile(&self, desired: &DesiredState) -> ReconcileOutcome {
        if desired.markets.is_empty() {
            warn!(network = %desired.network, "no markets configured for network {}", desired.network);
            return ReconcileOutcome::NothingToDo;
        }

        info!(
            network = %desired.network,
            markets = desired.markets.len(),
            dry_run = self.options.dry_run,
            "starting market reconciliation"
        );

        let deriver = IdentityDeriver::new(desired.registry, &self.creation_code);
        let mut report = ReconcileReport::default();
        let markets = self.resolve_all(&desired.markets, &mut report);

        if let Err(error) = self.creation_pass(&deriver, &markets, &mut report).await {
            error!(error = %error, "creation pass aborted");
            return ReconcileOutcome::Aborted { report, error };
        }
        if let Err(error) = self.configuration_pass(&deriver, &markets, &mut report).await {
            error!(error = %error, "configuration pass aborted");
            return ReconcileOutcome::Aborted { report, error };
        }

        info!(
            created = report.markets_created,
            existing = report.markets_existing,
            failed = report.markets_failed + report.markets_skipped,
            written = report.parameters_written,
            skipped = report.parameters_skipped,
            parameter_failures = report.parameters_failed,
            "reconciliation complete"
        );
        ReconcileOutcome::Completed(report)
    }

    fn resolve_all<'a>(&self, specs: &'a [MarketSpec], report: &mut ReconcileReport) -> Vec<ResolvedMarket<'a>> {
        let mut markets = Vec::with_capacity(specs.len());
        for spec in specs {
            let label = spec.label();
            match self.resolve(spec) {
                Ok(triple) => markets.push(ResolvedMarket { spec, label, triple }),
                Err(e) => {
                    report.markets_skipped += 1;
                    self.audit.record(&AuditEvent::MarketSkipped {
                        market: label,
                        reason: e.to_string(),
                    });
                }
            }
        }
        markets
    }

    fn should_abort(&self, error: &LedgerError) -> bool {
        self.options.abort_on_communication_error && error.is_communication()
    }

    async fn creation_pass(
        &self,
        deriver: &IdentityDeriver,
        markets: &[ResolvedMarket<'_>],
        report: &mut ReconcileReport,
    ) -> Result<(), LedgerError> {
        let mut probes = stream::iter(markets.iter().map(|market| {
            let identity = deriver.derive(&market.triple);
            async move { (market, identity, self.probe(identity).await) }
        }))
        .buffered(self.options.probe_concurrency.max(1));

        // Identities created earlier in this pass; read-ahead probes may predate them.
        let mut created: HashSet<MarketIdentity> = HashSet::new();

        while let Some((market, identity, probe)) = probes.next().await {
            let probe = match probe {
                Ok(ProbeResult::Absent) if created.contains(&identity) => Ok(ProbeResult::Exists),
                other => other,
            };

            let failure = match probe {
                Ok(ProbeResult::Exists) => {
                    report.markets_existing += 1;
                    self.audit.record(&AuditEvent::MarketAlreadyExists {
                        market: market.label.clone(),
                        identity,
                    });
                    continue;
                }
                Ok(ProbeResult::Absent) => {
                    info!(market = %market.label, identity = %identity, "creating market {}", market.label);
                    match self.create(&market.triple).await {
                        Ok(receipt) => {
                            created.insert(identity);
                            report.markets_created += 1;
                            self.audit.record(&AuditEvent::MarketCreated {
                                market: market.label.clone(),
                                identity,
                                tx_hash: receipt.map(|r| r.tx_hash),
                                applied: !self.options.dry_run,
                            });
                            continue;
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            report.markets_failed += 1;
            self.audit.record(&AuditEvent::MarketCreationFailed {
                market: market.label.clone(),
                identity,
                reason: failure.to_string(),
            });
            if self.should_abort(&failure) {
                return Err(failure);
            }
        }

        Ok(())
    }

    async fn configuration_pass(
        &self,
        deriver: &IdentityDeriver,
        markets: &[ResolvedMarket<'_>],
        report: &mut ReconcileReport,
    ) -> Result<(), LedgerError> {
        let sync = ConfigSynchronizer::new(self.collaborators.store.as_ref(), self.audit.as_ref())
            .dry_run(self.options.dry_run);

        for market in markets {
            // Recomputed: pass 1 may have changed remote state, nothing is cached.
            let identity = deriver.derive(&market.triple);

            for name in market.spec.parameters.keys() {
                if keys::binding(name).is_none() {
                    warn!(market = %market.label, parameter = %name, "ignoring unknown parameter");
                }
            }

            for binding in PARAMETER_TABLE {
                let Some(desired) = market.spec.parameter(binding.name) else {
                    continue;
                };
                let key = binding.key(&identity);
                let description = binding.describe(&identity);

                match sync.sync_if_different(key, desired, &description).await {
                    Ok(SyncOutcome::Written { .. }) => report.parameters_written += 1,
                    Ok(SyncOutcome::Skipped) => report.parameters_skipped += 1,
                    Err(e) => {
                        report.parameters_failed += 1;
                        self.audit.record(&AuditEvent::ParameterSyncFailed {
                            market: market.label.clone(),
                            parameter: binding.name.to_string(),
                            side: binding.side().map(str::to_string),
                            key,
                            description,
                            reason: e.to_string(),
                        });
                        if self.should_abort(&e) {
                            return Err(e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
