// =============================================================================
// Central application state — Meridian trading engine
// =============================================================================
//
// Ties the single-owner subsystems together and builds the operator status
// snapshot. AppState never mutates positions or orders itself; it only holds
// the owners. A monotone version counter signals snapshot consumers that
// fresh data exists.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::broker::BrokerHandle;
use crate::config::EngineConfig;
use crate::execution::{ExecutionManager, ExecutionStats};
use crate::journal::Journal;
use crate::market_data::{BarCache, Universe};
use crate::orders::OrderManager;
use crate::positions::{Position, PositionTracker};
use crate::regime::RegimeDetector;
use crate::risk::RiskKernel;
use crate::scheduler::{CycleGuard, SessionClock};
use crate::sizing::PositionSizer;
use crate::strategies::StrategyRuntime;
use crate::types::TradingMode;

/// How many bars each cycle pulls per symbol.
pub const BAR_LOOKBACK: usize = 120;

pub struct AppState {
    pub config: EngineConfig,
    pub trading_mode: RwLock<TradingMode>,

    pub broker: BrokerHandle,
    pub cache: Arc<BarCache>,
    pub universe: RwLock<Universe>,
    pub kernel: Arc<RiskKernel>,
    pub tracker: Arc<PositionTracker>,
    pub orders: Arc<OrderManager>,
    pub execution: Arc<ExecutionManager>,
    pub regime: Arc<RegimeDetector>,
    pub journal: Arc<Journal>,
    pub runtime: StrategyRuntime,
    pub clock: SessionClock,
    pub cycle_guard: Arc<CycleGuard>,

    /// Flips true exactly once; every task watches it.
    pub shutdown: watch::Sender<bool>,
    /// Set when the operator requested an emergency halt (close-all first).
    pub emergency: AtomicU64,

    pub state_version: AtomicU64,
    pub start_time: Instant,
}

impl AppState {
    /// Wire every subsystem from a validated config and a live broker
    /// handle. The engine always boots Paused; the operator resumes.
    pub fn new(
        config: EngineConfig,
        broker: BrokerHandle,
        journal: Arc<Journal>,
        shutdown: watch::Sender<bool>,
    ) -> Result<Arc<Self>> {
        let clock = SessionClock::from_config(&config.session)?;
        let universe = Universe::new(config.universe.to_symbol_meta());

        let tracker = Arc::new(PositionTracker::new(config.starting_cash));
        let kernel = Arc::new(RiskKernel::new(
            config.risk.clone(),
            config.limits.max_positions,
        ));
        let orders = Arc::new(OrderManager::new(
            broker.clone(),
            tracker.clone(),
            journal.clone(),
            kernel.clone(),
            config.execution.max_order_retries,
        ));
        let sizer = PositionSizer::new(config.sizing.clone(), config.limits.clone());
        let execution = Arc::new(ExecutionManager::new(
            kernel.clone(),
            sizer,
            tracker.clone(),
            orders.clone(),
            journal.clone(),
            broker.clone(),
            config.signals.clone(),
            config.strategies.clone(),
            config.limits.clone(),
            config.stops,
            config.risk.max_portfolio_exposure,
        ));
        let runtime = StrategyRuntime::from_config(&config.strategies, &config.stops);

        Ok(Arc::new(Self {
            config,
            trading_mode: RwLock::new(TradingMode::Paused),
            broker,
            cache: Arc::new(BarCache::new(500)),
            universe: RwLock::new(universe),
            kernel,
            tracker,
            orders,
            execution,
            regime: Arc::new(RegimeDetector::new()),
            journal,
            runtime,
            clock,
            cycle_guard: CycleGuard::new(),
            shutdown,
            emergency: AtomicU64::new(0),
            state_version: AtomicU64::new(1),
            start_time: Instant::now(),
        }))
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn trading_mode(&self) -> TradingMode {
        *self.trading_mode.read()
    }

    pub fn set_trading_mode(&self, mode: TradingMode) {
        *self.trading_mode.write() = mode;
        self.increment_version();
    }

    /// Ask every task to wind down. `emergency` additionally closes all
    /// positions before disconnect.
    pub fn request_shutdown(&self, emergency: bool) {
        if emergency {
            self.emergency.store(1, Ordering::SeqCst);
        }
        let _ = self.shutdown.send(true);
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst) != 0
    }

    /// Operator status snapshot for the REST surface.
    pub fn build_status(&self) -> StatusSnapshot {
        let snapshot = self.tracker.snapshot();
        let regime = self.regime.current();
        StatusSnapshot {
            state_version: self.state_version.load(Ordering::SeqCst),
            uptime_secs: self.start_time.elapsed().as_secs(),
            trading_mode: self.trading_mode().to_string(),
            halt_state: self.kernel.halt_state().to_string(),
            equity: snapshot.equity,
            cash: snapshot.cash,
            peak_equity: snapshot.peak_equity,
            drawdown: snapshot.drawdown(),
            realized_day_pnl: snapshot.realized_day_pnl,
            daily_trade_count: snapshot.daily_trade_count,
            consecutive_losses: snapshot.consecutive_losses,
            open_positions: self.tracker.open_positions(),
            working_orders: self.orders.working_orders(None).len(),
            regime: regime.as_ref().map(|r| r.regime.to_string()),
            aggressiveness: regime.map(|r| r.aggressiveness),
            execution: self.execution.stats(),
            cycle_overruns: self.cycle_guard.overruns(),
        }
    }
}

/// Serialisable status payload for `GET /api/v1/status` and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state_version: u64,
    pub uptime_secs: u64,
    pub trading_mode: String,
    pub halt_state: String,
    pub equity: f64,
    pub cash: f64,
    pub peak_equity: f64,
    pub drawdown: f64,
    pub realized_day_pnl: f64,
    pub daily_trade_count: u32,
    pub consecutive_losses: u32,
    pub open_positions: Vec<Position>,
    pub working_orders: usize,
    pub regime: Option<String>,
    pub aggressiveness: Option<f64>,
    pub execution: ExecutionStats,
    pub cycle_overruns: u64,
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TickerConfig;
    use tokio::sync::mpsc;

    fn state() -> (Arc<AppState>, tempfile::TempDir) {
        let mut config = EngineConfig::default();
        config.universe.tickers.push(TickerConfig {
            symbol: "AAPL".into(),
            tier: Default::default(),
        });

        let (tx, _rx) = mpsc::channel(1);
        let broker = BrokerHandle::new(tx);
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(Journal::open(dir.path()).unwrap());
        let (shutdown, _) = watch::channel(false);
        let state = AppState::new(config, broker, journal, shutdown).unwrap();
        (state, dir)
    }

    #[test]
    fn boots_paused_and_running() {
        let (s, _dir) = state();
        assert_eq!(s.trading_mode(), TradingMode::Paused);
        assert!(!s.kernel.is_halted());

        let status = s.build_status();
        assert_eq!(status.trading_mode, "Paused");
        assert_eq!(status.halt_state, "RUNNING");
        assert_eq!(status.equity, 100_000.0);
        assert!(status.open_positions.is_empty());
    }

    #[test]
    fn version_counter_moves_on_mode_change() {
        let (s, _dir) = state();
        let before = s.build_status().state_version;
        s.set_trading_mode(TradingMode::Live);
        assert!(s.build_status().state_version > before);
        assert_eq!(s.trading_mode(), TradingMode::Live);
    }

    #[test]
    fn shutdown_flag_observable() {
        let (s, _dir) = state();
        let mut rx = s.shutdown.subscribe();
        assert!(!*rx.borrow());
        s.request_shutdown(true);
        assert!(*rx.borrow_and_update());
        assert!(s.is_emergency());
    }
}
