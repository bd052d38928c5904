//! Flow Runner - live trading engine entry point
//!
//! `run` (the default) starts the supervised decision loop. The other
//! subcommands are operator actions against the persisted state:
//! clearing a capital-risk freeze, resetting or rebuilding the learned
//! weights, and printing a status summary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flow_runner::learner::AdaptiveWeightLearner;
use flow_runner::{
    supervise, Broker, BrokerCredentials, FileSignalCache, HttpBroker, PaperBroker, Settings,
    SignalCache, StateManager, TradingMode, TradingRunner, WeightModel,
};

const EXIT_CRASH_LOOP: u8 = 1;
const EXIT_INIT_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "flow-runner", version, about = "Signal-driven live trading engine")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "FLOW_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "FLOW_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the decision loop (default)
    Run,
    /// Clear a persisted capital-risk freeze
    ResetFreeze,
    /// Reset learned multipliers to neutral
    ResetWeights,
    /// Rebuild the weight model by replaying the outcome log
    RebuildWeights,
    /// Print a summary of the persisted state
    Status,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => return run(settings).await,
        Command::ResetFreeze => reset_freeze(&settings),
        Command::ResetWeights => reset_weights(&settings),
        Command::RebuildWeights => rebuild_weights(&settings),
        Command::Status => status(&settings),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_INIT_FAILURE)
        }
    }
}

fn build_broker(
    settings: &Settings,
    cache: Arc<dyn SignalCache>,
) -> anyhow::Result<Arc<dyn Broker>> {
    match settings.trading_mode {
        TradingMode::Live => {
            let credentials = BrokerCredentials::from_env()?;
            let broker = HttpBroker::new(&settings.broker, credentials)
                .context("failed to build broker client")?;
            info!("Live trading against {}", settings.broker.base_url);
            Ok(Arc::new(broker))
        }
        TradingMode::Paper => {
            info!("Paper trading against cached signal prices");
            Ok(Arc::new(PaperBroker::new(cache, &settings.broker)))
        }
    }
}

async fn run(settings: Settings) -> ExitCode {
    let cache_path = settings.signal_cache_path();
    let cache: Arc<dyn SignalCache> = Arc::new(FileSignalCache::new(&cache_path));
    if let Err(e) = cache.refresh() {
        warn!("Initial signal cache read failed: {:#}", e);
    }

    let broker = match build_broker(&settings, cache.clone()) {
        Ok(broker) => broker,
        Err(e) => {
            error!("Initialization failed: {:#}", e);
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    info!(
        "Starting Flow Runner: {} symbols configured, signals from {}",
        settings.symbols.len(),
        cache_path.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let watchdog = settings.watchdog.clone();
    let interval = settings.cycle.interval();
    let outcome = supervise(
        move |heartbeat, stop| {
            let runner = TradingRunner::new(settings.clone(), broker.clone(), cache.clone());
            runner.run(heartbeat, stop)
        },
        shutdown_rx,
        &watchdog,
        interval,
    )
    .await;

    match outcome {
        Ok(()) => {
            info!("Flow Runner stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Aborting: {}", e);
            ExitCode::from(EXIT_CRASH_LOOP)
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn reset_freeze(settings: &Settings) -> anyhow::Result<()> {
    let state = StateManager::new(settings.state_dir.clone());
    let cleared = state
        .risk
        .update(|risk| risk.reset_freeze())
        .context("updating risk state")?;
    match cleared {
        Some(freeze) => println!("Cleared freeze from {}: {}", freeze.at, freeze.reason),
        None => println!("Not frozen"),
    }
    Ok(())
}

fn reset_weights(settings: &Settings) -> anyhow::Result<()> {
    let state = StateManager::new(settings.state_dir.clone());
    let base = settings.scoring.base_weight_map();
    let prior = settings.learner.prior_strength;
    state
        .weights
        .update(|model| *model = WeightModel::neutral(&base, prior))
        .context("resetting weights")?;
    println!("Weights reset to neutral ({} components)", base.len());
    Ok(())
}

fn rebuild_weights(settings: &Settings) -> anyhow::Result<()> {
    let state = StateManager::new(settings.state_dir.clone());
    let outcomes = state.outcomes.read_all().context("reading outcome log")?;
    let base = settings.scoring.base_weight_map();
    let rebuilt = AdaptiveWeightLearner::replay(&settings.learner, &base, &outcomes);
    state
        .weights
        .update(|model| *model = rebuilt)
        .context("writing rebuilt weights")?;
    println!("Rebuilt weights from {} outcomes", outcomes.len());
    Ok(())
}

fn status(settings: &Settings) -> anyhow::Result<()> {
    let state = StateManager::new(settings.state_dir.clone());
    let now = state.read_now().context("reading now.json")?;
    let risk = state.risk.load().context("reading risk state")?;
    let positions = state.positions.load().context("reading positions")?;
    let deferred = state.deferred.load().context("reading deferred queue")?;

    let summary = serde_json::json!({
        "state_dir": state.state_dir(),
        "now": now,
        "frozen": risk.freeze,
        "consecutive_losses": risk.healing.consecutive_losses,
        "degraded_mode": positions.degraded_mode,
        "divergence_count": positions.divergence_count,
        "open_positions": positions.internal_positions.keys().collect::<Vec<_>>(),
        "deferred": deferred.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
