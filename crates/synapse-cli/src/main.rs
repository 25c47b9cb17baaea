//! Synapse CLI - auditable multi-agent simulation runs
//!
//! The `synapse` command drives runs against the reference collaborators and
//! inspects the hash-chained ledger they leave behind.
//!
//! ## Commands
//!
//! - `run`: launch a run, stream one line per epoch, print its manifest
//! - `list`: show stored runs, optionally filtered by status
//! - `verify`: recompute a run's hash chain
//! - `manifest`: rebuild a run's manifest from the ledger
//! - `reconcile`: fail runs whose worker lease has lapsed

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use synapse_core::{
    init_tracing, reference_collaborators, CostCondition, ProtocolId, RunManager, RunStatus,
    ScenarioPreset, Settings, SimulationConfig, StreamItem,
};
use synapse_ledger::{ChainVerdict, RunId, RunRecord, SurrealEpochStore, DEFAULT_DATABASE_URL};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "synapse")]
#[command(author = "Synapse Maintainers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Auditable multi-agent simulation runs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and machine-readable output
    #[arg(long, global = true)]
    json: bool,

    /// SurrealDB endpoint holding runs and epoch records
    #[arg(long, global = true, env = "SYNAPSE_DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a run against the reference grid world and wait for it
    Run(RunArgs),

    /// List stored runs, newest first
    List {
        /// Only show runs in this status
        #[arg(long, value_parser = parse_status)]
        status: Option<RunStatus>,
    },

    /// Recompute a run's hash chain from genesis
    Verify {
        /// Run ID
        run_id: String,
    },

    /// Print a run's manifest rebuilt from its committed epochs
    Manifest {
        /// Run ID
        run_id: String,
    },

    /// Mark failed the runs whose worker stopped renewing its lease
    Reconcile,
}

/// Unset flags keep the value of the preset (or the defaults without one);
/// `--condition` is applied after the preset and before explicit costs.
#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Environment preset: deep_sea, aerial or social
    #[arg(long, value_parser = parse_preset)]
    preset: Option<ScenarioPreset>,

    /// Campaign cost condition: baseline, low_pressure, high_pressure, extreme or control
    #[arg(long, value_parser = parse_condition)]
    condition: Option<CostCondition>,

    /// Number of epochs [default: 100]
    #[arg(long)]
    epochs: Option<u64>,

    /// Episodes per epoch [default: 10]
    #[arg(long)]
    episodes: Option<u32>,

    /// Step limit per episode [default: 100]
    #[arg(long)]
    max_steps: Option<u32>,

    /// Run seed (defaults to SYNAPSE_DEFAULT_SEED)
    #[arg(long)]
    seed: Option<u64>,

    /// Protocol: 0/baseline or 1/interrogative [default: interrogative]
    #[arg(long, value_parser = parse_protocol)]
    protocol: Option<ProtocolId>,

    /// Signal vector length per agent [default: 8]
    #[arg(long)]
    signal_dim: Option<usize>,

    /// Energy budget per agent and episode [default: 100]
    #[arg(long)]
    energy_budget: Option<f64>,

    /// Communication tax per unit of signal magnitude [default: 0.01]
    #[arg(long)]
    tax_rate: Option<f64>,

    /// Tax multiplier for DECLARE signals [default: 1.0]
    #[arg(long)]
    declare_cost: Option<f64>,

    /// Tax multiplier for QUERY signals [default: 1.5]
    #[arg(long)]
    query_cost: Option<f64>,

    /// Tax multiplier for RESPOND signals [default: 0.8]
    #[arg(long)]
    respond_cost: Option<f64>,

    /// Pick signal types by argmax instead of sampling
    #[arg(long)]
    eval: bool,
}

impl RunArgs {
    fn to_config(&self, settings: &Settings) -> SimulationConfig {
        let mut config = self
            .preset
            .map_or_else(SimulationConfig::default, |p| p.config());
        if let Some(condition) = self.condition {
            condition.apply(&mut config);
        }

        config.seed = self.seed.unwrap_or(settings.default_seed);
        config.training = !self.eval;
        override_with(&mut config.num_epochs, self.epochs);
        override_with(&mut config.episodes_per_epoch, self.episodes);
        override_with(&mut config.max_steps, self.max_steps);
        override_with(&mut config.protocol, self.protocol);
        override_with(&mut config.signal_dim, self.signal_dim);
        override_with(&mut config.energy_budget, self.energy_budget);
        override_with(&mut config.communication_tax_rate, self.tax_rate);
        override_with(&mut config.costs.declare, self.declare_cost);
        override_with(&mut config.costs.query, self.query_cost);
        override_with(&mut config.costs.respond, self.respond_cost);
        config
    }
}

fn parse_protocol(raw: &str) -> std::result::Result<ProtocolId, String> {
    match raw.to_ascii_lowercase().as_str() {
        "baseline" => Ok(ProtocolId::Baseline),
        "interrogative" => Ok(ProtocolId::Interrogative),
        other => other
            .parse::<u8>()
            .map_err(|_| format!("unknown protocol {raw:?}"))
            .and_then(|id| ProtocolId::try_from(id).map_err(|e| e.to_string())),
    }
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn parse_preset(raw: &str) -> std::result::Result<ScenarioPreset, String> {
    ScenarioPreset::parse(&raw.to_ascii_lowercase().replace('-', "_"))
        .ok_or_else(|| format!("unknown preset {raw:?} (deep_sea, aerial, social)"))
}

fn parse_condition(raw: &str) -> std::result::Result<CostCondition, String> {
    CostCondition::parse(&raw.to_ascii_lowercase().replace('-', "_")).ok_or_else(|| {
        format!("unknown condition {raw:?} (baseline, low_pressure, high_pressure, extreme, control)")
    })
}

fn parse_status(raw: &str) -> std::result::Result<RunStatus, String> {
    RunStatus::parse(raw).ok_or_else(|| format!("unknown run status {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let mut settings = Settings::from_env().context("Invalid SYNAPSE_* settings")?;
    settings.database_url = cli.database_url.clone();

    let store = SurrealEpochStore::connect(&settings.database_url)
        .await
        .context("Failed to connect to Synapse database")?;
    let manager = RunManager::new(Arc::new(store), &settings);

    match cli.command {
        Commands::Run(args) => cmd_run(&manager, args.to_config(&settings), cli.json).await,
        Commands::List { status } => cmd_list(&manager, status, cli.json).await,
        Commands::Verify { run_id } => cmd_verify(&manager, &RunId::from(run_id.as_str())).await,
        Commands::Manifest { run_id } => {
            cmd_manifest(&manager, &RunId::from(run_id.as_str())).await
        }
        Commands::Reconcile => cmd_reconcile(&manager).await,
    }
}

/// Launch a run, stream its epochs until the end sentinel, print the manifest.
///
/// Ctrl-C requests a stop; the run ends at its next epoch boundary.
async fn cmd_run(manager: &RunManager, config: SimulationConfig, json: bool) -> Result<()> {
    let run_id = manager
        .launch(config.clone(), reference_collaborators(&config))
        .await
        .context("Failed to launch run")?;
    let queue = manager.subscribe(&run_id)?;

    info!(run_id = %run_id, seed = config.seed, protocol = %config.protocol, "run launched");

    let mut interrupted = false;
    loop {
        tokio::select! {
            item = queue.pull(Duration::from_secs(1)) => match item {
                Some(StreamItem::Epoch(metrics)) => {
                    if json {
                        println!("{}", serde_json::to_string(&metrics)?);
                    } else {
                        println!("{}", epoch_line(&metrics));
                    }
                }
                Some(StreamItem::End) => break,
                None => {}
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!(run_id = %run_id, "interrupt received, stopping at next epoch boundary");
                manager.stop(&run_id).await?;
            }
        }
    }

    let snapshot = manager.wait(&run_id).await?;
    if snapshot.stream_dropped > 0 {
        warn!(dropped = snapshot.stream_dropped, "some epochs were not streamed");
    }
    let manifest = manager.manifest(&run_id).await?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);

    match snapshot.status {
        RunStatus::Failed => bail!(
            "run {} failed after {} epochs: {}",
            run_id,
            snapshot.current_epoch,
            snapshot.failure.unwrap_or_default()
        ),
        status => {
            info!(run_id = %run_id, %status, epochs = snapshot.current_epoch, "run finished");
            Ok(())
        }
    }
}

/// One human-readable line per streamed epoch.
fn epoch_line(metrics: &Value) -> String {
    let num = |k: &str| metrics.get(k).and_then(Value::as_f64).unwrap_or(0.0);
    let mut line = format!(
        "epoch {:>4}  survival {:.3}  target {:.3}  roi {:.4}  tau {:.3}",
        metrics.get("epoch").and_then(Value::as_u64).unwrap_or(0),
        num("survival_rate"),
        num("target_reached_rate"),
        num("energy_roi"),
        num("tau"),
    );
    if let Some(h) = metrics
        .get("inquiry")
        .and_then(|i| i.get("type_entropy"))
        .and_then(Value::as_f64)
    {
        line.push_str(&format!("  type_entropy {h:.3}"));
    }
    if metrics.get("comm_killed").and_then(Value::as_bool) == Some(true) {
        line.push_str("  [comm killed]");
    }
    line
}

#[derive(Serialize)]
struct RunRow<'a> {
    run_id: &'a str,
    status: &'a str,
    current_epoch: u64,
    total_epochs: u64,
    final_hash: Option<&'a str>,
    failure_reason: Option<&'a str>,
}

impl<'a> From<&'a RunRecord> for RunRow<'a> {
    fn from(run: &'a RunRecord) -> Self {
        Self {
            run_id: &run.run_id.0,
            status: run.status.as_str(),
            current_epoch: run.current_epoch,
            total_epochs: run.total_epochs,
            final_hash: run.final_hash.as_ref().map(|h| h.as_str()),
            failure_reason: run.failure_reason.as_deref(),
        }
    }
}

async fn cmd_list(manager: &RunManager, status: Option<RunStatus>, json: bool) -> Result<()> {
    let runs = manager.list_runs(status).await?;

    if json {
        let rows: Vec<RunRow> = runs.iter().map(RunRow::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    for run in &runs {
        let head = run.final_hash.as_ref().map_or("-", |h| h.short());
        println!(
            "{}  {:<9} {:>5}/{:<5} {}  {}",
            run.run_id,
            run.status.as_str(),
            run.current_epoch,
            run.total_epochs,
            head,
            run.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
        if let Some(reason) = &run.failure_reason {
            println!("    failure: {}", reason);
        }
    }

    Ok(())
}

async fn cmd_verify(manager: &RunManager, run_id: &RunId) -> Result<()> {
    let verdict = manager
        .verify(run_id)
        .await
        .with_context(|| format!("Failed to verify run '{}'", run_id))?;

    match verdict {
        ChainVerdict::Valid => {
            let run = manager.store().get_run(run_id).await?;
            println!(
                "Chain valid: {} epochs, head {}",
                run.current_epoch,
                run.chain_head().as_str()
            );
            Ok(())
        }
        ChainVerdict::Broken { epoch, reason } => {
            bail!("Chain broken at epoch {}: {}", epoch, reason)
        }
    }
}

async fn cmd_manifest(manager: &RunManager, run_id: &RunId) -> Result<()> {
    let manifest = manager
        .manifest(run_id)
        .await
        .with_context(|| format!("Failed to build manifest for run '{}'", run_id))?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

async fn cmd_reconcile(manager: &RunManager) -> Result<()> {
    let reconciled = manager
        .reconcile()
        .await
        .context("Failed to reconcile orphaned runs")?;
    if reconciled.is_empty() {
        println!("No orphaned runs.");
        return Ok(());
    }
    warn!(count = reconciled.len(), "marked orphaned runs failed");
    for run_id in &reconciled {
        println!("Marked failed: {}", run_id);
    }
    Ok(())
}
