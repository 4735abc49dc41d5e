//! Audit stream: one event per reconciliation decision.

use alloy_primitives::{B256, U256};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::MarketIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    MarketAlreadyExists {
        market: String,
        identity: MarketIdentity,
    },
    /// `applied` is false for a dry run.
    MarketCreated {
        market: String,
        identity: MarketIdentity,
        tx_hash: Option<B256>,
        applied: bool,
    },
    MarketCreationFailed {
        market: String,
        identity: MarketIdentity,
        reason: String,
    },
    /// The market could not be resolved and takes no part in the run.
    MarketSkipped { market: String, reason: String },
    ParameterWritten {
        key: B256,
        description: String,
        old_value: Option<U256>,
        new_value: U256,
        applied: bool,
    },
    ParameterSkipped {
        key: B256,
        description: String,
        value: U256,
    },
    ParameterSyncFailed {
        market: String,
        parameter: String,
        /// `long`/`short` or `positive`/`negative`, for parameters that have a side.
        side: Option<String>,
        key: B256,
        description: String,
        reason: String,
    },
}

impl AuditEvent {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::MarketCreated { applied: true, .. } | Self::ParameterWritten { applied: true, .. }
        )
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Emits every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        match event {
            AuditEvent::MarketAlreadyExists { market, identity } => {
                info!(market = %market, identity = %identity, "market already exists");
            }
            AuditEvent::MarketCreated {
                market,
                identity,
                tx_hash,
                applied,
            } => {
                if *applied {
                    info!(market = %market, identity = %identity, tx_hash = ?tx_hash, "market created");
                } else {
                    info!(market = %market, identity = %identity, "dry run: would create market");
                }
            }
            AuditEvent::MarketCreationFailed {
                market,
                identity,
                reason,
            } => {
                warn!(market = %market, identity = %identity, reason = %reason, "market creation failed");
            }
            AuditEvent::MarketSkipped { market, reason } => {
                warn!(market = %market, reason = %reason, "market skipped");
            }
            AuditEvent::ParameterWritten {
                key,
                description,
                old_value,
                new_value,
                applied,
            } => {
                let old = old_value.map(|v| v.to_string()).unwrap_or_else(|| "unset".to_string());
                if *applied {
                    info!(key = %key, old = %old, new = %new_value, "updated {}", description);
                } else {
                    info!(key = %key, old = %old, new = %new_value, "dry run: would update {}", description);
                }
            }
            AuditEvent::ParameterSkipped {
                key,
                description,
                value,
            } => {
                info!(key = %key, value = %value, "skipping {}, already set", description);
            }
            AuditEvent::ParameterSyncFailed {
                market,
                parameter,
                side,
                key,
                description,
                reason,
            } => {
                warn!(
                    market = %market,
                    parameter = %parameter,
                    side = ?side,
                    key = %key,
                    reason = %reason,
                    "failed to sync {}",
                    description
                );
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn write_count(&self) -> usize {
        self.events.lock().iter().filter(|e| e.is_write()).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

#[derive(Serialize)]
struct AuditLine<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

/// Appends one JSON object per event to a file.
pub struct JsonLinesAuditSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesAuditSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, event: &AuditEvent) {
        let line = AuditLine {
            ts: Utc::now(),
            event,
        };
        let mut writer = self.writer.lock();
        let result = serde_json::to_writer(&mut *writer, &line)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            warn!(error = %e, "failed to append audit event");
        }
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for FanoutSink {
    fn record(&self, event: &AuditEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}
