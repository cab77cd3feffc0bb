// =============================================================================
// Meridian Equities Engine — Main Entry Point
// =============================================================================
//
// `meridian start` boots the engine in Paused mode for safety; the operator
// goes live with `meridian resume` (or POST /api/v1/resume). The other
// subcommands are thin clients against a running engine's REST surface.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod config;
mod engine;
mod errors;
mod execution;
mod indicators;
mod journal;
mod market_data;
mod orders;
mod positions;
mod regime;
mod risk;
mod scheduler;
mod signals;
mod sizing;
mod strategies;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::{paper::PaperBroker, run_broker_task, BrokerHandle};
use crate::config::EngineConfig;
use crate::journal::Journal;
use crate::orders::manager::run_order_events;
use crate::scheduler::{run_scheduler, SessionClock};

#[derive(Parser)]
#[command(name = "meridian", about = "Automated equities trading engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine (boots Paused; resume to go live).
    Start {
        /// Path to the JSON config file.
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        /// Bind address for the operator REST surface.
        #[arg(long, default_value = "127.0.0.1:7070")]
        bind: String,
        /// Directory for the trade log, daily snapshots, and audit log.
        #[arg(long, default_value = "journal")]
        journal_dir: PathBuf,
    },
    /// Print the status snapshot of a running engine.
    Status {
        #[arg(long, default_value = "127.0.0.1:7070")]
        addr: String,
    },
    /// Halt trading (entries blocked, exits still run).
    Halt {
        #[arg(long, default_value = "127.0.0.1:7070")]
        addr: String,
    },
    /// Clear a halt and go live.
    Resume {
        #[arg(long, default_value = "127.0.0.1:7070")]
        addr: String,
    },
    /// Market-close every open position.
    CloseAll {
        #[arg(long, default_value = "127.0.0.1:7070")]
        addr: String,
    },
    /// Gracefully stop a running engine.
    Stop {
        #[arg(long, default_value = "127.0.0.1:7070")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Start {
            config,
            bind,
            journal_dir,
        } => start(config, bind, journal_dir).await,
        Command::Status { addr } => client_get(&addr, "status").await,
        Command::Halt { addr } => client_post(&addr, "halt").await,
        Command::Resume { addr } => client_post(&addr, "resume").await,
        Command::CloseAll { addr } => client_post(&addr, "close-all").await,
        Command::Stop { addr } => client_post(&addr, "stop").await,
    }
}

// ---------------------------------------------------------------------------
// Engine bootstrap
// ---------------------------------------------------------------------------

async fn start(config_path: PathBuf, bind: String, journal_dir: PathBuf) -> Result<()> {
    info!("Meridian Equities Engine starting");

    // ── 1. Config (fatal on any diagnostic) ─────────────────────────────
    let config = EngineConfig::load(&config_path)
        .with_context(|| format!("cannot start with config {}", config_path.display()))?;
    if config.universe.tickers.is_empty() {
        bail!("universe.tickers is empty — nothing to trade");
    }
    // Fail fast on a bad session block rather than inside the scheduler.
    SessionClock::from_config(&config.session)?;

    // ── 2. Broker: the paper client behind the broker trait. The live
    //      gateway client is deployed as an external component implementing
    //      the same trait; this binary refuses to pretend otherwise. ──────
    if !config.execution.paper_trading {
        bail!(
            "execution.paper_trading=false requires the external gateway client; \
             this build trades paper only"
        );
    }
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let paper = PaperBroker::new(event_tx);

    let (broker_tx, broker_rx) = mpsc::channel(64);
    tokio::spawn(run_broker_task(Box::new(paper), broker_rx));
    let broker = BrokerHandle::new(broker_tx);
    broker.connect().await.context("broker connect failed")?;

    // ── 3. Journal + shared state ───────────────────────────────────────
    let journal = Arc::new(Journal::open(&journal_dir)?);
    let (shutdown_tx, _) = watch::channel(false);
    let state = AppState::new(config, broker, journal, shutdown_tx)?;

    info!(
        tickers = state.universe.read().len(),
        strategies = ?state.runtime.ids(),
        paper = state.config.execution.paper_trading,
        "engine configured (Paused — resume to go live)"
    );

    // ── 4. Broker event loop + bar subscriptions ────────────────────────
    tokio::spawn(run_order_events(
        state.orders.clone(),
        state.cache.clone(),
        event_rx,
    ));
    let mut feeds = state.universe.read().tickers();
    feeds.push(state.config.universe.index_proxy.clone());
    for symbol in feeds {
        if let Err(e) = state
            .broker
            .subscribe_bars(&symbol, market_data::Timeframe::Min30)
            .await
        {
            warn!(symbol = %symbol, error = %e, "bar subscription failed");
        }
    }

    // ── 5. Scheduler ────────────────────────────────────────────────────
    let (sched_tx, sched_rx) = mpsc::channel(16);
    tokio::spawn(run_scheduler(
        state.clock.clone(),
        state.config.execution.cycle_interval,
        state.cycle_guard.clone(),
        sched_tx,
        state.shutdown.subscribe(),
    ));

    // ── 6. Operator REST surface ────────────────────────────────────────
    let api_state = state.clone();
    let bind_clone = bind.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_clone).await {
            Ok(listener) => {
                info!(addr = %bind_clone, "operator API listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "operator API failed");
                }
            }
            Err(e) => error!(addr = %bind_clone, error = %e, "operator API bind failed"),
        }
    });

    // ── 7. Engine loop + Ctrl-C ─────────────────────────────────────────
    let engine_state = state.clone();
    let engine_task = tokio::spawn(engine::run_engine(engine_state, sched_rx));

    let ctrl_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C — requesting graceful shutdown");
            ctrl_state.request_shutdown(false);
        }
    });

    engine_task.await.context("engine task panicked")?;
    info!("Meridian shut down cleanly");
    Ok(())
}

// ---------------------------------------------------------------------------
// Client subcommands against a running engine
// ---------------------------------------------------------------------------

async fn client_get(addr: &str, path: &str) -> Result<()> {
    let url = format!("http://{addr}/api/v1/{path}");
    let body: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("engine not reachable at {addr}"))?
        .json()
        .await
        .context("bad response from engine")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn client_post(addr: &str, path: &str) -> Result<()> {
    let url = format!("http://{addr}/api/v1/{path}");
    let body: serde_json::Value = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("engine not reachable at {addr}"))?
        .json()
        .await
        .context("bad response from engine")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if body.get("ok") != Some(&serde_json::Value::Bool(true)) {
        bail!("engine reported failure");
    }
    Ok(())
}
