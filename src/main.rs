//! reconcile-markets
//!
//! Creates missing markets and syncs their parameters against a deployment file.
//!
//! Usage:
//!   reconcile-markets --config deploy/localhost.toml [--dry-run] [--audit-log audit.jsonl]
//!
//! Environment Variables:
//!   RECONCILER_CONFIG   - Path to the deployment file
//!   RECONCILER_RPC_URL  - Overrides network.rpc_url
//!   RECONCILER_DEPLOYER - Overrides network.deployer
//!   RUST_LOG            - Log filter (default: market_reconciler=info)

use anyhow::{bail, Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use market_reconciler::audit::{FanoutSink, JsonLinesAuditSink, TracingAuditSink};
use market_reconciler::config::DeploymentConfig;
use market_reconciler::ledger::RpcLedger;
use market_reconciler::{Collaborators, ReconcileOptions, ReconcileOutcome, Reconciler};

#[derive(Parser, Debug)]
#[command(name = "reconcile-markets")]
#[command(about = "Create missing markets and sync their parameters")]
struct Args {
    /// Path to the TOML deployment file
    #[arg(short, long, env = "RECONCILER_CONFIG")]
    config: PathBuf,

    /// Probe and read only; report what would be sent
    #[arg(long)]
    dry_run: bool,

    /// Keep going after communication errors instead of aborting the run
    #[arg(long)]
    continue_on_error: bool,

    /// Existence probes in flight during the creation pass
    #[arg(long, default_value = "1")]
    probe_concurrency: usize,

    /// Append audit events as JSON lines to this file
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(short, long, default_value = "market_reconciler=info,reconcile_markets=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    load_env();
    init_tracing(&args.log_level);

    let mut config = DeploymentConfig::load(&args.config)?;
    config.apply_env_overrides()?;

    let violations = config.validate();
    if !violations.is_empty() {
        for v in &violations {
            error!("{}", v);
        }
        bail!(
            "deployment file {} has {} problem(s)",
            args.config.display(),
            violations.len()
        );
    }

    let desired = config.desired_state()?;
    let creation_code = config.creation_code()?;
    info!(
        network = %desired.network,
        rpc_url = %config.network.rpc_url,
        market_factory = %desired.registry.market_factory,
        data_store = %desired.registry.data_store,
        "loaded deployment file {}",
        args.config.display()
    );

    let ledger = Arc::new(RpcLedger::new(config.rpc_ledger_config())?);
    let collaborators = Collaborators::from_ledger(Arc::new(config.token_registry()), ledger);

    let mut audit = FanoutSink::new().with(Arc::new(TracingAuditSink));
    if let Some(path) = &args.audit_log {
        let sink = JsonLinesAuditSink::open(path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        audit = audit.with(Arc::new(sink));
    }

    let options = ReconcileOptions {
        dry_run: args.dry_run,
        abort_on_communication_error: !args.continue_on_error,
        probe_concurrency: args.probe_concurrency,
    };

    let reconciler = Reconciler::new(creation_code, collaborators, Arc::new(audit)).with_options(options);

    match reconciler.reconcile(&desired).await {
        ReconcileOutcome::NothingToDo => Ok(()),
        ReconcileOutcome::Completed(report) => {
            info!("{}", serde_json::to_string(&report)?);
            if report.failures() > 0 {
                warn!(failures = report.failures(), "re-run reconciliation after fixing the failures");
                bail!("{} market or parameter operation(s) failed", report.failures());
            }
            Ok(())
        }
        ReconcileOutcome::Aborted { report, error } => {
            info!("{}", serde_json::to_string(&report)?);
            bail!("reconciliation aborted: {}", error)
        }
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try the package directory when running with --manifest-path from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
