//! AlphaFlow Pipeline Shell
//!
//! Thin CLI over the core: replay recorded features into signals and a
//! backtest, drive a signal tape through the execution adapter, run the
//! backtest/dry-run equivalence harness, and dump gate statistics.
//!
//! Exit codes: 0 success, 1 hard contract violation or fatal pipeline
//! error, 2 configuration validation failure.

use alphaflow_backend::adapter::{signal_to_order, AdapterEventLog, OrderAdapter, PaperAdapter};
use alphaflow_backend::config::{Config, ExecutorMode};
use alphaflow_backend::equiv::{run_equivalence, MarkPoint};
use alphaflow_backend::errors::PipelineError;
use alphaflow_backend::exec::TradeSimulator;
use alphaflow_backend::replay::clock::Clock;
use alphaflow_backend::replay::{Pace, ReplayFeeder, RunManifest};
use alphaflow_backend::signal::GateStats;
use alphaflow_backend::sink::{DualSinkWriter, SqliteSignalStore};
use alphaflow_backend::models::Signal;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "alphaflow", about = "Market-microstructure signal pipeline")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "RUN_ID")]
    run_id: Option<String>,

    #[arg(long, global = true, env = "V13_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay recorded feature files through the signal core, persist the
    /// signals, and run the trade simulator over the confirmed stream.
    Replay {
        /// Directory of feature JSONL files.
        #[arg(long)]
        features: PathBuf,
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Shadow the tape at wall-clock pace instead of as-fast.
        #[arg(long)]
        wall_pace: bool,
    },
    /// Drive a persisted signal tape through the execution adapter.
    Exec {
        /// SQLite signal store to read the tape from.
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        tape_run_id: String,
        /// Force dry-run regardless of executor.mode.
        #[arg(long)]
        dry_run: bool,
    },
    /// Backtest vs dry-run equivalence over a recorded feature tape.
    Equiv {
        #[arg(long)]
        features: PathBuf,
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
    },
    /// Per-decision-code signal counts from the relational sink.
    GateStats {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        gate_run_id: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "run failed");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), PipelineError> {
    let mut cfg = match &cli.config {
        Some(path) => Config::from_toml_path(path)?,
        None => Config::default(),
    };
    if let Some(dir) = &cli.output_dir {
        cfg.sink.output_dir = dir.display().to_string();
        cfg.executor.output_dir = dir.display().to_string();
    }
    let cfg = cfg.resolved()?;

    if matches!(
        std::env::var("V13_SIGNAL_V2").as_deref(),
        Ok("0") | Ok("false")
    ) {
        warn!("V13_SIGNAL_V2 disabled has no effect: this pipeline only emits signal/v2");
    }

    let run_id = cli
        .run_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..10].to_string());
    info!(run_id = %run_id, config_hash = %cfg.config_hash(), "starting");

    match cli.command {
        Command::Replay {
            features,
            symbols,
            wall_pace,
        } => replay_command(cfg, run_id, features, symbols, wall_pace).await,
        Command::Exec {
            db,
            tape_run_id,
            dry_run,
        } => exec_command(cfg, run_id, db, tape_run_id, dry_run).await,
        Command::Equiv { features, symbols } => {
            equiv_command(cfg, run_id, features, symbols).await
        }
        Command::GateStats { db, gate_run_id } => gate_stats_command(db, gate_run_id),
    }
}

async fn replay_command(
    cfg: Config,
    run_id: String,
    features: PathBuf,
    symbols: Vec<String>,
    wall_pace: bool,
) -> Result<(), PipelineError> {
    let output_dir = PathBuf::from(&cfg.sink.output_dir);
    let mut manifest = RunManifest::new(run_id.as_str());
    manifest.config = cfg.effective_params();
    manifest.effective_params = cfg.effective_params();
    let input_files: Vec<PathBuf> = std::fs::read_dir(&features)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|x| x == "jsonl").unwrap_or(false))
                .collect()
        })
        .unwrap_or_default();
    manifest.data_fingerprint = alphaflow_backend::replay::fingerprint_paths(&input_files);
    manifest.data_source_info = serde_json::json!({
        "features_dir": features.display().to_string(),
        "symbols": symbols,
    });

    let sink = DualSinkWriter::spawn(cfg.sink.clone())
        .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))?;
    let clock = if wall_pace {
        Clock::Wall
    } else {
        Clock::sim_from(0)
    };
    let pace = if wall_pace { Pace::Wall } else { Pace::AsFast };

    let mut feeder = ReplayFeeder::new(cfg.clone(), run_id.as_str(), Some(sink), clock);
    let signals = feeder.replay_dir(&features, &symbols, pace)?;

    // Drive the simulator off the same tape: each signal's feature context
    // is the mark, then the signal itself.
    let mut sim = TradeSimulator::new(&cfg)?;
    for signal in &signals {
        if let Some(mid) = signal.meta_mid_price() {
            sim.on_tick(
                &signal.symbol,
                signal.ts_ms,
                mid,
                signal.meta_scenario(),
                signal.meta_spread_bps().unwrap_or(2.0),
            );
        }
        sim.on_signal(signal);
    }
    sim.close_all();

    let run_dir = output_dir.join(format!("run-{}", run_id));
    sim.write_trades_jsonl(&run_dir.join("trades.jsonl"))
        .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))?;

    let (core, feeder_stats, sink_health) = feeder.finish();
    manifest.feeder_stats = serde_json::to_value(&feeder_stats).unwrap_or_default();
    manifest.trade_stats = serde_json::to_value(sim.stats()).unwrap_or_default();
    manifest.sink_health = serde_json::to_value(&sink_health).unwrap_or_default();
    manifest.finalize(core.gate_stats());
    manifest
        .write(&output_dir)
        .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))?;

    info!(
        signals = signals.len(),
        trades = sim.trades().len(),
        "replay run complete"
    );
    if sim.contract_violations() > 0 {
        return Err(PipelineError::ContractViolation(format!(
            "{} contract-violating signals reached the executor boundary",
            sim.contract_violations()
        )));
    }
    Ok(())
}

async fn exec_command(
    cfg: Config,
    run_id: String,
    db: PathBuf,
    tape_run_id: String,
    dry_run: bool,
) -> Result<(), PipelineError> {
    let store = SqliteSignalStore::open(&db, cfg.sink.busy_timeout_ms)
        .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))?;
    let tape = store
        .read_by_run(&tape_run_id)
        .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))?;
    info!(signals = tape.len(), tape_run_id = %tape_run_id, "tape loaded");

    let mut exec_cfg = cfg.clone();
    if dry_run || !matches!(cfg.executor.mode, ExecutorMode::Live) {
        exec_cfg.adapter.dry_run = true;
    }

    let events = AdapterEventLog::new(&cfg.executor.output_dir, run_id.as_str());
    let mut adapter = PaperAdapter::new(&exec_cfg, Some(events));

    let mut submitted = 0usize;
    let mut violations = 0u64;
    for signal in &tape {
        if signal.confirm && !signal.contract_ok() {
            violations += 1;
            warn!(signal_id = %signal.signal_id, "contract violation on tape");
            continue;
        }
        if let Some(mid) = signal.meta_mid_price() {
            adapter.set_mark(
                &signal.symbol,
                signal.ts_ms,
                mid,
                signal.meta_scenario(),
                signal.meta_spread_bps().unwrap_or(2.0),
            );
        }
        let Some(order) = signal_to_order(signal, cfg.executor.order_size_usd) else {
            continue;
        };
        match adapter.submit(order).await {
            Ok(_) => submitted += 1,
            // Order-local failures: log and move to the next signal.
            Err(e @ PipelineError::AdapterRejected(_))
            | Err(e @ PipelineError::RateLimited(_))
            | Err(e @ PipelineError::Timeout(_)) => {
                warn!(error = %e, "order dropped");
            }
            Err(e) => return Err(e),
        }
    }
    let fills = adapter.fetch_fills();
    adapter.close().await?;
    info!(submitted, fills = fills.len(), "exec run complete");

    if violations > 0 {
        return Err(PipelineError::ContractViolation(format!(
            "{} contract-violating signals on tape",
            violations
        )));
    }
    Ok(())
}

async fn equiv_command(
    cfg: Config,
    run_id: String,
    features: PathBuf,
    symbols: Vec<String>,
) -> Result<(), PipelineError> {
    let mut feeder = ReplayFeeder::new(cfg.clone(), run_id.as_str(), None, Clock::sim_from(0));
    let signals = feeder.replay_dir(&features, &symbols, Pace::AsFast)?;
    let marks: Vec<MarkPoint> = signals.iter().filter_map(mark_from_signal).collect();

    let report = run_equivalence(&cfg, &signals, &marks).await?;
    let body = serde_json::to_string_pretty(&report)
        .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))?;
    println!("{}", body);

    if !report.passed() {
        return Err(PipelineError::ContractViolation(format!(
            "equivalence failed: {}",
            report.failures.join("; ")
        )));
    }
    Ok(())
}

fn mark_from_signal(signal: &Signal) -> Option<MarkPoint> {
    Some(MarkPoint {
        symbol: signal.symbol.clone(),
        ts_ms: signal.ts_ms,
        mid: signal.meta_mid_price()?,
        scenario: signal.meta_scenario(),
        spread_bps: signal.meta_spread_bps().unwrap_or(2.0),
    })
}

fn gate_stats_command(db: PathBuf, run_id: Option<String>) -> Result<(), PipelineError> {
    let store = SqliteSignalStore::open(&db, 30_000)
        .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))?;
    let raw = match run_id {
        Some(id) => store.gate_stats(&id),
        None => store.gate_stats_all(),
    }
    .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))?;
    let stats: GateStats = raw.into_iter().collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats)
            .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))?
    );
    Ok(())
}
