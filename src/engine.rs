// =============================================================================
// Engine — per-cycle orchestration and shutdown discipline
// =============================================================================
//
// One cycle, in order:
//
//   1. Global working-order sweep.
//   2. Refresh index-proxy bars, run the regime detector.
//   3. Per symbol: refresh bars (stale symbols are skipped, not the cycle),
//      sample positions against the newest bar and dispatch any exits, run
//      the enabled strategies, collapse signals through consensus and the
//      enhancer, and feed surviving intents to the execution pipeline.
//   4. Re-evaluate the halt state machine against a fresh snapshot.
//
// Cycle N's orders are fully dispatched before cycle N+1 starts: the
// scheduler skips ticks while the cycle guard is held.
//
// Shutdown: no new cycles, the current cycle finishes, a global sweep runs,
// the daily summary is written, and the broker disconnects. An emergency
// halt additionally closes every open position with market orders first.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app_state::{AppState, BAR_LOOKBACK};
use crate::broker::OrderSide;
use crate::errors::EngineError;
use crate::indicators::volatility::current_realized_vol;
use crate::journal::DailyRecord;
use crate::market_data::{closes, Timeframe};
use crate::positions::ExitRequest;
use crate::regime::{MarketRegime, RegimeState};
use crate::scheduler::SchedulerEvent;
use crate::signals::consensus::build_intents;
use crate::signals::enhancer::{enhance, Enhanced};
use crate::signals::Signal;
use crate::strategies::{CycleContext, StrategyId};
use crate::types::{Direction, TradingMode};

/// Drive the engine off the scheduler's event stream. Returns when the
/// stream closes or shutdown is requested.
pub async fn run_engine(state: Arc<AppState>, mut events: mpsc::Receiver<SchedulerEvent>) {
    let mut shutdown = state.shutdown.subscribe();

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match event {
            SchedulerEvent::Cycle { id } => {
                run_cycle(&state, id).await;
                state.cycle_guard.end();
                state.increment_version();
            }
            SchedulerEvent::SessionOpen => {
                info!("session open");
                state.tracker.roll_day();
                state.execution.roll_day();
                screen_universe(&state);
            }
            SchedulerEvent::SessionClose => {
                info!("session close");
                write_daily_summary(&state);
            }
            SchedulerEvent::Idle => {
                debug!("idle tick");
            }
        }
    }

    shutdown_sequence(&state).await;
}

// ---------------------------------------------------------------------------
// One cycle
// ---------------------------------------------------------------------------

async fn run_cycle(state: &Arc<AppState>, cycle_id: u64) {
    let now = Utc::now();
    let now_ms = now.timestamp_millis();
    debug!(cycle_id, "cycle start");

    // 1. Working-order hygiene before anything new goes out.
    state.orders.global_cancel_sweep().await;

    // 2. Regime from the index proxy.
    let proxy_symbol = state.config.universe.index_proxy.clone();
    let proxy_bars = match state
        .cache
        .get_bars(&state.broker, &proxy_symbol, Timeframe::Min30, BAR_LOOKBACK, now_ms)
        .await
    {
        Ok(bars) => {
            state.regime.update(&bars);
            bars
        }
        Err(e) => {
            warn!(symbol = %proxy_symbol, error = %e, "proxy bars unavailable");
            Vec::new()
        }
    };
    let regime = state.regime.current().unwrap_or_else(fallback_regime);

    let ctx = CycleContext {
        cycle_id,
        now_ms,
        proxy_bars,
        minutes_to_close: state.clock.minutes_to_close(now),
        minutes_since_open: state.clock.minutes_since_open(now),
    };

    let tickers = state.universe.read().tickers();
    let mut disabled_this_cycle: Vec<StrategyId> = Vec::new();

    for symbol in tickers {
        if let Err(e) = process_symbol(
            state,
            &symbol,
            cycle_id,
            now_ms,
            &regime,
            &ctx,
            &mut disabled_this_cycle,
        )
        .await
        {
            // Per-symbol failures skip the symbol, never the cycle.
            warn!(symbol = %symbol, error = %e, "symbol skipped this cycle");
        }
    }

    // 4. Halt rules against the post-cycle snapshot.
    let snapshot = state.tracker.snapshot();
    state.kernel.evaluate_halt(&snapshot, now_ms);

    debug!(cycle_id, equity = snapshot.equity, "cycle complete");
}

async fn process_symbol(
    state: &Arc<AppState>,
    symbol: &str,
    cycle_id: u64,
    now_ms: i64,
    regime: &RegimeState,
    ctx: &CycleContext,
    disabled_this_cycle: &mut Vec<StrategyId>,
) -> Result<(), EngineError> {
    let bars = state
        .cache
        .get_bars(&state.broker, symbol, Timeframe::Min30, BAR_LOOKBACK, now_ms)
        .await?;
    let Some(last_bar) = bars.last() else {
        return Ok(());
    };

    // Position sample and exit monitoring come before new signals: a stop
    // hit on this bar must not coexist with a fresh entry for the symbol.
    if let Some(exit) = state.tracker.update_from_bar(last_bar) {
        dispatch_exit(state, &exit).await;
    }

    // Strategy evaluation over an isolated snapshot of the bars.
    let signals = state
        .runtime
        .evaluate_symbol(symbol, &bars, ctx, disabled_this_cycle);
    if signals.is_empty() {
        return Ok(());
    }

    let intents = build_intents(
        cycle_id,
        symbol,
        &signals,
        &state.config.signals,
        &state.config.sizing,
        regime,
        now_ms,
    );
    if intents.is_empty() {
        return Ok(());
    }

    let realized_vol = current_realized_vol(&closes(&bars), 20);
    let volume_floor = volume_floor_for(state, &signals);
    let universe = state.universe.read().clone();

    for intent in intents {
        // Entries only while Live; exits always flow.
        if intent.kind.is_entry() && state.trading_mode() != TradingMode::Live {
            debug!(symbol, "paused — entry intent dropped");
            continue;
        }

        let intent = match enhance(intent, &bars, volume_floor, &state.config.signals, ctx) {
            Enhanced::Kept(intent) => intent,
            Enhanced::Dropped { confidence, floor } => {
                debug!(
                    symbol,
                    confidence = format!("{confidence:.3}"),
                    floor,
                    "intent dropped below confidence floor"
                );
                continue;
            }
        };

        let env = crate::execution::CycleEnv {
            cycle_id,
            universe: &universe,
            regime,
            realized_vol,
            now_ms,
        };
        let outcome = state.execution.process(&intent, &env).await;
        debug!(symbol, outcome = ?outcome, "pipeline outcome");
    }

    Ok(())
}

/// Highest volume-ratio threshold among the strategies that contributed the
/// cycle's signals; the enhancer treats it as the participation floor.
fn volume_floor_for(state: &Arc<AppState>, signals: &[Signal]) -> f64 {
    signals
        .iter()
        .map(|s| {
            state
                .config
                .strategies
                .params_for(s.strategy)
                .volume_threshold
        })
        .fold(0.0, f64::max)
}

async fn dispatch_exit(state: &Arc<AppState>, exit: &ExitRequest) {
    let side = match exit.direction {
        Direction::Long => OrderSide::Sell,
        Direction::Short => OrderSide::Buy,
    };
    match state
        .orders
        .submit_market_close(&exit.symbol, side, exit.qty, &exit.reason.to_string())
        .await
    {
        Ok(order_id) => {
            info!(
                symbol = %exit.symbol,
                reason = %exit.reason,
                order_id = %order_id,
                qty = exit.qty,
                "exit order submitted"
            );
        }
        Err(e) => {
            error!(symbol = %exit.symbol, error = %e, "exit order failed");
            // Allow the next sample to retry the exit.
            state.tracker.clear_closing(&exit.symbol);
        }
    }
}

/// Session-open refresh point: evict symbols whose trailing average volume
/// fell through the screener floor. The market-cap floor needs fundamental
/// data the broker feed does not carry and is enforced upstream.
fn screen_universe(state: &Arc<AppState>) {
    let screener = &state.config.universe.screener;
    if screener.min_avg_volume <= 0.0 {
        return;
    }
    let mut avg_volumes = std::collections::HashMap::new();
    for symbol in state.universe.read().tickers() {
        let key = crate::market_data::BarKey::new(&symbol, Timeframe::Min30);
        let bars = state.cache.snapshot(&key, 20);
        if !bars.is_empty() {
            let avg = bars.iter().map(|b| b.volume).sum::<f64>() / bars.len() as f64;
            avg_volumes.insert(symbol, avg);
        }
    }
    state.universe.write().apply_volume_screen(&avg_volumes, screener);
}

/// Used until the detector has enough proxy data: neutral regime, moderate
/// weights.
fn fallback_regime() -> RegimeState {
    RegimeState {
        regime: MarketRegime::Ranging,
        ema_slope: 0.0,
        adx: 0.0,
        vol_percentile: 0.5,
        proxy_drawdown: 0.0,
        confidence: 0.0,
        aggressiveness: MarketRegime::Ranging.aggressiveness(),
        strategy_weights: MarketRegime::Ranging.strategy_weights(),
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

fn write_daily_summary(state: &Arc<AppState>) {
    let snapshot = state.tracker.snapshot();
    let record = DailyRecord {
        date: Utc::now().format("%Y-%m-%d").to_string(),
        equity: snapshot.equity,
        peak_equity: snapshot.peak_equity,
        realized_day_pnl: snapshot.realized_day_pnl,
        open_position_count: snapshot.positions.len(),
    };
    info!(
        equity = record.equity,
        realized_day_pnl = record.realized_day_pnl,
        open_positions = record.open_position_count,
        "daily summary"
    );
    state.journal.record_daily(&record);
}

/// Close every open position with market orders (emergency halt path).
pub async fn close_all_positions(state: &Arc<AppState>) {
    for position in state.tracker.open_positions() {
        let side = match position.direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };
        match state
            .orders
            .submit_market_close(&position.symbol, side, position.qty, "CLOSE_ALL")
            .await
        {
            Ok(_) => info!(symbol = %position.symbol, qty = position.qty, "position closed"),
            Err(e) => error!(symbol = %position.symbol, error = %e, "close-all order failed"),
        }
    }
}

async fn shutdown_sequence(state: &Arc<AppState>) {
    info!(emergency = state.is_emergency(), "shutdown sequence started");

    if state.is_emergency() {
        close_all_positions(state).await;
    }

    state.orders.global_cancel_sweep().await;
    write_daily_summary(state);
    state.broker.disconnect().await;

    info!("shutdown sequence complete");
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::broker::{run_broker_task, BrokerClient, BrokerHandle};
    use crate::config::{EngineConfig, TickerConfig};
    use crate::journal::Journal;
    use crate::market_data::{Bar, BarKey};
    use crate::orders::manager::run_order_events;
    use crate::positions::PositionMeta;
    use tokio::sync::watch;

    fn bar(symbol: &str, i: i64, close: f64) -> Bar {
        Bar {
            symbol: symbol.into(),
            timeframe: Timeframe::Min30,
            open_time: i * 1_800_000,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1_000.0,
        }
    }

    async fn rig(bars_per_symbol: &[(&str, Vec<Bar>)]) -> (Arc<AppState>, tempfile::TempDir, i64) {
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut paper = PaperBroker::new(event_tx);
        let mut newest_close = 0;
        for (symbol, bars) in bars_per_symbol {
            if let Some(last) = bars.last() {
                newest_close = newest_close.max(last.close_time());
            }
            paper.load_bars(BarKey::new(*symbol, Timeframe::Min30), bars.clone());
        }
        let _ = paper.connect().await;

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(run_broker_task(Box::new(paper), rx));
        let broker = BrokerHandle::new(tx);

        let mut config = EngineConfig::default();
        for (symbol, _) in bars_per_symbol {
            if *symbol != "SPY" {
                config.universe.tickers.push(TickerConfig {
                    symbol: symbol.to_string(),
                    tier: Default::default(),
                });
            }
        }
        config.strategies.enabled = vec![StrategyId::EmaCross, StrategyId::Momentum];

        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(Journal::open(dir.path()).unwrap());
        let (shutdown, _) = watch::channel(false);
        let state = AppState::new(config, broker, journal, shutdown).unwrap();

        // Order events flow into the manager as in production.
        tokio::spawn(run_order_events(
            state.orders.clone(),
            state.cache.clone(),
            event_rx,
        ));

        (state, dir, newest_close)
    }

    #[tokio::test]
    async fn stop_hit_position_is_closed_during_cycle() {
        // AAPL bars end with a close below the registered stop.
        let aapl: Vec<Bar> = (0..60)
            .map(|i| bar("AAPL", i, if i < 59 { 150.0 } else { 145.0 }))
            .collect();
        let spy: Vec<Bar> = (0..60).map(|i| bar("SPY", i, 400.0)).collect();
        let (state, _dir, newest) = rig(&[("AAPL", aapl), ("SPY", spy)]).await;

        state
            .tracker
            .register_entry(
                "AAPL",
                150.0,
                PositionMeta {
                    direction: Direction::Long,
                    stop: Some(147.0),
                    take: Some(156.0),
                    trailing_percent: None,
                },
            )
            .unwrap();
        state
            .tracker
            .apply_fill("AAPL", OrderSide::Buy, 10.0, 150.0, 0.0, 0)
            .unwrap();

        // Drive one cycle "now" = just after the newest bar closed, so the
        // cache is fresh and no refresh path interferes.
        run_cycle_at(&state, 1, newest + 1_000).await;
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        assert!(
            state.tracker.position("AAPL").is_none(),
            "stop-hit position must be closed by the cycle"
        );
        assert_eq!(state.tracker.closed_positions().len(), 1);
    }

    /// Cycle driver with an injected clock, mirroring run_cycle.
    async fn run_cycle_at(state: &Arc<AppState>, cycle_id: u64, now_ms: i64) {
        state.orders.global_cancel_sweep().await;

        let proxy_symbol = state.config.universe.index_proxy.clone();
        let proxy_bars = state
            .cache
            .get_bars(&state.broker, &proxy_symbol, Timeframe::Min30, BAR_LOOKBACK, now_ms)
            .await
            .unwrap_or_default();
        state.regime.update(&proxy_bars);
        let regime = state.regime.current().unwrap_or_else(fallback_regime);

        let ctx = CycleContext {
            cycle_id,
            now_ms,
            proxy_bars,
            minutes_to_close: Some(120),
            minutes_since_open: Some(120),
        };

        let tickers = state.universe.read().tickers();
        let mut disabled = Vec::new();
        for symbol in tickers {
            let _ = process_symbol(state, &symbol, cycle_id, now_ms, &regime, &ctx, &mut disabled)
                .await;
        }
        let snapshot = state.tracker.snapshot();
        state.kernel.evaluate_halt(&snapshot, now_ms);
    }

    #[tokio::test]
    async fn stale_symbol_skips_but_cycle_survives() {
        // MSFT has no bars at all; AAPL is healthy. The cycle must process
        // AAPL and merely skip MSFT.
        let aapl: Vec<Bar> = (0..60).map(|i| bar("AAPL", i, 150.0)).collect();
        let spy: Vec<Bar> = (0..60).map(|i| bar("SPY", i, 400.0)).collect();
        let (state, _dir, newest) = rig(&[("AAPL", aapl), ("SPY", spy)]).await;
        state.universe.write().replace(
            [("MSFT", Default::default()), ("AAPL", Default::default())]
                .iter()
                .map(|(s, tier)| crate::market_data::SymbolMeta {
                    symbol: s.to_string(),
                    tier: *tier,
                })
                .collect(),
        );

        run_cycle_at(&state, 1, newest + 1_000).await;
        // No panic, no halt: the stale symbol was contained.
        assert!(!state.kernel.is_halted());
    }

    #[tokio::test]
    async fn emergency_shutdown_closes_positions() {
        let aapl: Vec<Bar> = (0..60).map(|i| bar("AAPL", i, 150.0)).collect();
        let (state, _dir, _) = rig(&[("AAPL", aapl)]).await;

        state
            .tracker
            .apply_fill("AAPL", OrderSide::Buy, 10.0, 150.0, 0.0, 0)
            .unwrap();
        assert!(state.tracker.position("AAPL").is_some());

        state.request_shutdown(true);
        shutdown_sequence(&state).await;
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        assert!(state.tracker.position("AAPL").is_none());
        // Daily summary written.
        let daily = std::fs::read_to_string(_dir.path().join("daily.csv")).unwrap();
        assert!(daily.lines().count() >= 2);
    }
}
