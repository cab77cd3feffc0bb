// =============================================================================
// Position tracker — live P&L, exits, trailing stops, portfolio state
// =============================================================================
//
// The tracker exclusively owns positions and the portfolio accounting built
// from them. Entries merge at volume-weighted average price; exits reduce
// quantity and realize side-signed, commission-adjusted PnL; a position is
// destroyed when its quantity nets to zero.
//
// Exit monitoring per bar sample:
//   1. gap-through — a bar opening beyond the stop is an immediate StopHit
//      at that bar's open
//   2. stop hit at the close
//   3. take hit at the close
//   4. trailing hit against the monotone anchor (anchor never retreats)
//
// A firing exit marks the position `closing` so later samples cannot
// request a duplicate close.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::OrderSide;
use crate::errors::EngineError;
use crate::market_data::Bar;
use crate::risk::{PortfolioSnapshot, PositionExposure};
use crate::sizing::TradeStats;
use crate::types::Direction;

const QTY_EPSILON: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Why a position was (or is being) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopHit,
    TakeHit,
    TrailingHit,
    StrategyExit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopHit => write!(f, "STOP_HIT"),
            Self::TakeHit => write!(f, "TAKE_HIT"),
            Self::TrailingHit => write!(f, "TRAILING_HIT"),
            Self::StrategyExit => write!(f, "STRATEGY_EXIT"),
        }
    }
}

/// A close the tracker wants the order manager to execute.
#[derive(Debug, Clone)]
pub struct ExitRequest {
    pub symbol: String,
    pub direction: Direction,
    pub qty: f64,
    pub reason: ExitReason,
    /// Price at which the exit condition was evaluated.
    pub ref_price: f64,
}

/// Protective levels registered before the entry fill arrives.
#[derive(Debug, Clone)]
pub struct PositionMeta {
    pub direction: Direction,
    pub stop: Option<f64>,
    pub take: Option<f64>,
    pub trailing_percent: Option<f64>,
}

/// A live position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    /// Remaining open quantity, always > 0.
    pub qty: f64,
    pub avg_entry: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    /// Accumulated over partial exits of this position.
    pub realized_pnl: f64,
    pub stop: Option<f64>,
    pub take: Option<f64>,
    pub trailing_percent: Option<f64>,
    /// Best price seen in the position's favour; monotone non-decreasing for
    /// longs, non-increasing for shorts.
    pub trailing_anchor: Option<f64>,
    pub opened_at: i64,
    pub last_price_at: i64,
    pub high_water: f64,
    pub low_water: f64,
    pub commission_total: f64,
    /// Set when an exit order has been requested, to prevent duplicates.
    pub closing: bool,
    /// Set when bracket protection could not be established.
    pub flagged: Option<String>,
}

impl Position {
    /// Current trailing stop level, if trailing is configured.
    pub fn trailing_stop(&self) -> Option<f64> {
        let pct = self.trailing_percent?;
        let anchor = self.trailing_anchor?;
        Some(match self.direction {
            Direction::Long => anchor * (1.0 - pct / 100.0),
            Direction::Short => anchor * (1.0 + pct / 100.0),
        })
    }

    fn refresh_unrealized(&mut self) {
        self.unrealized_pnl =
            self.direction.sign() * (self.current_price - self.avg_entry) * self.qty;
    }

    /// Exit evaluation against one bar. Assumes the anchor has already been
    /// advanced for this bar.
    fn check_exit(&self, bar: &Bar) -> Option<(ExitReason, f64)> {
        if self.closing {
            return None;
        }
        let sign = self.direction.sign();

        // 1. Gap-through: the bar opened beyond the stop.
        if let Some(stop) = self.stop {
            if sign * (bar.open - stop) <= 0.0 {
                return Some((ExitReason::StopHit, bar.open));
            }
        }
        if let Some(trail) = self.trailing_stop() {
            if sign * (bar.open - trail) <= 0.0 {
                return Some((ExitReason::TrailingHit, bar.open));
            }
        }

        // 2. Stop at the close.
        if let Some(stop) = self.stop {
            if sign * (bar.close - stop) <= 0.0 {
                return Some((ExitReason::StopHit, bar.close));
            }
        }

        // 3. Take at the close.
        if let Some(take) = self.take {
            if sign * (bar.close - take) >= 0.0 {
                return Some((ExitReason::TakeHit, bar.close));
            }
        }

        // 4. Trailing at the close.
        if let Some(trail) = self.trailing_stop() {
            if sign * (bar.close - trail) <= 0.0 {
                return Some((ExitReason::TrailingHit, bar.close));
            }
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Portfolio accounting
// ---------------------------------------------------------------------------

struct PortfolioCore {
    cash: f64,
    peak_equity: f64,
    day_start_equity: f64,
    realized_day_pnl: f64,
    daily_trade_count: u32,
    consecutive_losses: u32,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct PositionTracker {
    positions: RwLock<HashMap<String, Position>>,
    closed: RwLock<Vec<Position>>,
    pending_meta: RwLock<HashMap<String, PositionMeta>>,
    portfolio: RwLock<PortfolioCore>,
}

impl PositionTracker {
    pub fn new(starting_cash: f64) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
            pending_meta: RwLock::new(HashMap::new()),
            portfolio: RwLock::new(PortfolioCore {
                cash: starting_cash,
                peak_equity: starting_cash,
                day_start_equity: starting_cash,
                realized_day_pnl: 0.0,
                daily_trade_count: 0,
                consecutive_losses: 0,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Entry registration
    // -------------------------------------------------------------------------

    /// Register protective levels for an entry about to be submitted. The
    /// stop must sit on the loss side of the reference entry and the take on
    /// the profit side; a violation is fatal.
    pub fn register_entry(
        &self,
        symbol: &str,
        reference_entry: f64,
        meta: PositionMeta,
    ) -> Result<(), EngineError> {
        let sign = meta.direction.sign();
        if let Some(stop) = meta.stop {
            if sign * (reference_entry - stop) <= 0.0 {
                return Err(EngineError::Invariant(format!(
                    "stop {stop} on wrong side of entry {reference_entry} for {} {symbol}",
                    meta.direction
                )));
            }
        }
        if let Some(take) = meta.take {
            if sign * (take - reference_entry) <= 0.0 {
                return Err(EngineError::Invariant(format!(
                    "take {take} on wrong side of entry {reference_entry} for {} {symbol}",
                    meta.direction
                )));
            }
        }
        self.pending_meta.write().insert(symbol.to_string(), meta);
        Ok(())
    }

    /// Discard registered levels when the entry never reached the broker.
    pub fn clear_pending_entry(&self, symbol: &str) {
        self.pending_meta.write().remove(symbol);
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Apply one broker fill. Entries merge at VWAP; opposite-side fills
    /// reduce and realize; net zero destroys the position.
    pub fn apply_fill(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
        commission: f64,
        ts: i64,
    ) -> Result<(), EngineError> {
        if qty <= 0.0 || price <= 0.0 {
            return Err(EngineError::Invariant(format!(
                "fill with non-positive qty/price for {symbol}: qty={qty} price={price}"
            )));
        }

        // Cash moves with the fill regardless of position bookkeeping.
        {
            let mut core = self.portfolio.write();
            match side {
                OrderSide::Buy => core.cash -= qty * price + commission,
                OrderSide::Sell => core.cash += qty * price - commission,
            }
        }

        let fill_direction = match side {
            OrderSide::Buy => Direction::Long,
            OrderSide::Sell => Direction::Short,
        };

        let mut positions = self.positions.write();
        match positions.get_mut(symbol) {
            None => {
                // Registered levels apply only when the fill direction
                // matches the registration; anything else opens bare.
                let meta = self
                    .pending_meta
                    .write()
                    .remove(symbol)
                    .filter(|m| m.direction == fill_direction)
                    .unwrap_or(PositionMeta {
                        direction: fill_direction,
                        stop: None,
                        take: None,
                        trailing_percent: None,
                    });
                let position = Position {
                    symbol: symbol.to_string(),
                    direction: fill_direction,
                    qty,
                    avg_entry: price,
                    current_price: price,
                    unrealized_pnl: 0.0,
                    realized_pnl: 0.0,
                    stop: meta.stop,
                    take: meta.take,
                    trailing_percent: meta.trailing_percent,
                    trailing_anchor: meta.trailing_percent.map(|_| price),
                    opened_at: ts,
                    last_price_at: ts,
                    high_water: price,
                    low_water: price,
                    commission_total: commission,
                    closing: false,
                    flagged: None,
                };
                info!(
                    symbol,
                    direction = %position.direction,
                    qty,
                    price,
                    stop = ?position.stop,
                    take = ?position.take,
                    "position opened"
                );
                positions.insert(symbol.to_string(), position);
            }
            Some(position) if position.direction == fill_direction => {
                // Scale-in: merge at volume-weighted average entry.
                let total = position.qty + qty;
                position.avg_entry =
                    (position.avg_entry * position.qty + price * qty) / total;
                position.qty = total;
                position.commission_total += commission;
                position.current_price = price;
                position.last_price_at = ts;
                position.refresh_unrealized();
                debug!(symbol, qty = total, avg_entry = position.avg_entry, "position scaled in");
            }
            Some(position) => {
                // Offsetting fill: realize PnL on the exited quantity.
                let exited = qty.min(position.qty);
                let pnl = position.direction.sign() * (price - position.avg_entry) * exited
                    - commission;
                position.realized_pnl += pnl;
                position.qty -= exited;
                position.current_price = price;
                position.last_price_at = ts;
                position.refresh_unrealized();

                let leftover = qty - exited;
                if position.qty <= QTY_EPSILON {
                    let closed = positions.remove(symbol).expect("present");
                    drop(positions);
                    self.finalize_close(closed);
                    if leftover > QTY_EPSILON {
                        warn!(
                            symbol,
                            leftover, "offsetting fill exceeded position — ignoring remainder"
                        );
                    }
                    return Ok(());
                }
            }
        }
        drop(positions);
        self.refresh_equity();
        Ok(())
    }

    fn finalize_close(&self, position: Position) {
        let total_pnl = position.realized_pnl;
        info!(
            symbol = %position.symbol,
            realized_pnl = total_pnl,
            commission = position.commission_total,
            "position closed"
        );

        {
            let mut core = self.portfolio.write();
            core.realized_day_pnl += total_pnl;
            core.daily_trade_count += 1;
            if total_pnl < 0.0 {
                core.consecutive_losses += 1;
            } else {
                core.consecutive_losses = 0;
            }
        }
        self.closed.write().push(position);
        self.refresh_equity();
    }

    // -------------------------------------------------------------------------
    // Price samples and exit monitoring
    // -------------------------------------------------------------------------

    /// Update a position from a completed bar and evaluate exits. The
    /// trailing anchor is advanced first (monotone rule), then the exit
    /// checks run. Returns the exit to execute, if any.
    pub fn update_from_bar(&self, bar: &Bar) -> Option<ExitRequest> {
        let exit = {
            let mut positions = self.positions.write();
            let position = positions.get_mut(&bar.symbol)?;

            position.current_price = bar.close;
            position.last_price_at = bar.close_time();
            position.high_water = position.high_water.max(bar.high);
            position.low_water = position.low_water.min(bar.low);
            position.refresh_unrealized();

            // Monotone anchor: advances only in the position's favour.
            if position.trailing_percent.is_some() {
                let anchor = position.trailing_anchor.unwrap_or(position.avg_entry);
                position.trailing_anchor = Some(match position.direction {
                    Direction::Long => anchor.max(bar.close),
                    Direction::Short => anchor.min(bar.close),
                });
            }

            match position.check_exit(bar) {
                Some((reason, ref_price)) => {
                    position.closing = true;
                    info!(
                        symbol = %bar.symbol,
                        reason = %reason,
                        ref_price,
                        qty = position.qty,
                        "exit triggered"
                    );
                    Some(ExitRequest {
                        symbol: bar.symbol.clone(),
                        direction: position.direction,
                        qty: position.qty,
                        reason,
                        ref_price,
                    })
                }
                None => None,
            }
        };
        self.refresh_equity();
        exit
    }

    /// Request a strategy-driven exit for an open position in `direction`.
    pub fn request_strategy_exit(&self, symbol: &str, direction: Direction) -> Option<ExitRequest> {
        let mut positions = self.positions.write();
        let position = positions.get_mut(symbol)?;
        if position.direction != direction || position.closing {
            return None;
        }
        position.closing = true;
        Some(ExitRequest {
            symbol: symbol.to_string(),
            direction,
            qty: position.qty,
            reason: ExitReason::StrategyExit,
            ref_price: position.current_price,
        })
    }

    /// Exit order failed; allow future exit attempts.
    pub fn clear_closing(&self, symbol: &str) {
        if let Some(position) = self.positions.write().get_mut(symbol) {
            position.closing = false;
        }
    }

    /// Mark a position whose bracket protection could not be established.
    pub fn flag(&self, symbol: &str, reason: impl Into<String>) {
        if let Some(position) = self.positions.write().get_mut(symbol) {
            position.flagged = Some(reason.into());
        }
    }

    // -------------------------------------------------------------------------
    // Portfolio views
    // -------------------------------------------------------------------------

    fn equity_locked(&self, positions: &HashMap<String, Position>, cash: f64) -> f64 {
        let market_value: f64 = positions
            .values()
            .map(|p| p.direction.sign() * p.qty * p.current_price)
            .sum();
        cash + market_value
    }

    fn refresh_equity(&self) {
        let positions = self.positions.read();
        let mut core = self.portfolio.write();
        let equity = self.equity_locked(&positions, core.cash);
        if equity > core.peak_equity {
            core.peak_equity = equity;
        }
    }

    pub fn equity(&self) -> f64 {
        let positions = self.positions.read();
        let core = self.portfolio.read();
        self.equity_locked(&positions, core.cash)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.closed.read().clone()
    }

    /// Read-only snapshot for the risk kernel.
    pub fn snapshot(&self) -> PortfolioSnapshot {
        let positions = self.positions.read();
        let core = self.portfolio.read();
        let equity = self.equity_locked(&positions, core.cash);
        PortfolioSnapshot {
            cash: core.cash,
            equity,
            peak_equity: core.peak_equity.max(equity),
            day_start_equity: core.day_start_equity,
            realized_day_pnl: core.realized_day_pnl,
            daily_trade_count: core.daily_trade_count,
            consecutive_losses: core.consecutive_losses,
            positions: positions
                .values()
                .map(|p| PositionExposure {
                    symbol: p.symbol.clone(),
                    direction: p.direction,
                    qty: p.qty,
                    current_price: p.current_price,
                    stop: p.stop,
                })
                .collect(),
        }
    }

    /// Roll daily counters at session open.
    pub fn roll_day(&self) {
        let equity = self.equity();
        let mut core = self.portfolio.write();
        core.day_start_equity = equity;
        core.realized_day_pnl = 0.0;
        core.daily_trade_count = 0;
        info!(day_start_equity = equity, "daily counters rolled");
    }

    /// Win statistics over closed positions, for the Kelly sizer.
    pub fn trade_stats(&self) -> Option<TradeStats> {
        let closed = self.closed.read();
        if closed.len() < 10 {
            return None;
        }
        let wins: Vec<f64> = closed
            .iter()
            .filter(|p| p.realized_pnl > 0.0)
            .map(|p| p.realized_pnl)
            .collect();
        let losses: Vec<f64> = closed
            .iter()
            .filter(|p| p.realized_pnl < 0.0)
            .map(|p| -p.realized_pnl)
            .collect();
        if losses.is_empty() || wins.is_empty() {
            return None;
        }
        let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
        let avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
        Some(TradeStats {
            win_rate: wins.len() as f64 / closed.len() as f64,
            payoff: avg_win / avg_loss,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Timeframe;

    fn tracker() -> PositionTracker {
        PositionTracker::new(100_000.0)
    }

    fn bar(symbol: &str, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: symbol.into(),
            timeframe: Timeframe::Min30,
            open_time: 0,
            open,
            high,
            low,
            close,
            volume: 1000.0,
        }
    }

    fn long_meta(stop: Option<f64>, take: Option<f64>, trailing: Option<f64>) -> PositionMeta {
        PositionMeta {
            direction: Direction::Long,
            stop,
            take,
            trailing_percent: trailing,
        }
    }

    #[test]
    fn entry_merge_at_vwap() {
        let t = tracker();
        t.apply_fill("AAPL", OrderSide::Buy, 100.0, 150.0, 1.0, 0).unwrap();
        t.apply_fill("AAPL", OrderSide::Buy, 50.0, 153.0, 1.0, 1).unwrap();
        let p = t.position("AAPL").unwrap();
        assert!((p.qty - 150.0).abs() < 1e-9);
        // (100*150 + 50*153) / 150 = 151.0
        assert!((p.avg_entry - 151.0).abs() < 1e-9);
        assert!((p.commission_total - 2.0).abs() < 1e-9);
    }

    #[test]
    fn full_exit_realizes_and_destroys() {
        let t = tracker();
        t.apply_fill("AAPL", OrderSide::Buy, 100.0, 150.0, 1.0, 0).unwrap();
        t.apply_fill("AAPL", OrderSide::Sell, 100.0, 156.0, 1.0, 1).unwrap();

        assert!(t.position("AAPL").is_none());
        let closed = t.closed_positions();
        assert_eq!(closed.len(), 1);
        // (156-150)*100 - 1 = 599
        assert!((closed[0].realized_pnl - 599.0).abs() < 1e-9);

        let snap = t.snapshot();
        assert!((snap.realized_day_pnl - 599.0).abs() < 1e-9);
        assert_eq!(snap.daily_trade_count, 1);
        assert_eq!(snap.consecutive_losses, 0);
        // Cash round trip: 100000 - 15000 - 1 + 15600 - 1 = 100598.
        assert!((snap.cash - 100_598.0).abs() < 1e-9);
        assert!((snap.equity - 100_598.0).abs() < 1e-9);
    }

    #[test]
    fn losing_exits_count_consecutively() {
        let t = tracker();
        for symbol in ["A", "B"] {
            t.apply_fill(symbol, OrderSide::Buy, 10.0, 100.0, 0.0, 0).unwrap();
            t.apply_fill(symbol, OrderSide::Sell, 10.0, 95.0, 0.0, 1).unwrap();
        }
        assert_eq!(t.snapshot().consecutive_losses, 2);

        // A winner resets the streak.
        t.apply_fill("C", OrderSide::Buy, 10.0, 100.0, 0.0, 0).unwrap();
        t.apply_fill("C", OrderSide::Sell, 10.0, 110.0, 0.0, 1).unwrap();
        assert_eq!(t.snapshot().consecutive_losses, 0);
    }

    #[test]
    fn short_pnl_signs() {
        let t = tracker();
        t.apply_fill("TSLA", OrderSide::Sell, 10.0, 200.0, 0.0, 0).unwrap();
        let p = t.position("TSLA").unwrap();
        assert_eq!(p.direction, Direction::Short);

        // Price falls: short profits.
        t.apply_fill("TSLA", OrderSide::Buy, 10.0, 190.0, 0.0, 1).unwrap();
        let closed = t.closed_positions();
        assert!((closed[0].realized_pnl - 100.0).abs() < 1e-9);
    }

    #[test]
    fn partial_exit_keeps_position() {
        let t = tracker();
        t.apply_fill("AAPL", OrderSide::Buy, 100.0, 150.0, 0.0, 0).unwrap();
        t.apply_fill("AAPL", OrderSide::Sell, 40.0, 155.0, 0.0, 1).unwrap();
        let p = t.position("AAPL").unwrap();
        assert!((p.qty - 60.0).abs() < 1e-9);
        assert!((p.realized_pnl - 200.0).abs() < 1e-9);
        // Not yet a closed trade.
        assert_eq!(t.snapshot().daily_trade_count, 0);
    }

    #[test]
    fn register_entry_rejects_wrong_side_levels() {
        let t = tracker();
        // Long stop above entry is an invariant violation.
        assert!(t
            .register_entry("AAPL", 150.0, long_meta(Some(151.0), None, None))
            .is_err());
        // Long take below entry too.
        assert!(t
            .register_entry("AAPL", 150.0, long_meta(Some(147.0), Some(149.0), None))
            .is_err());
        // Correct sides pass.
        assert!(t
            .register_entry("AAPL", 150.0, long_meta(Some(147.0), Some(156.0), None))
            .is_ok());
    }

    #[test]
    fn stop_hit_at_close() {
        let t = tracker();
        t.register_entry("AAPL", 150.0, long_meta(Some(147.0), None, None)).unwrap();
        t.apply_fill("AAPL", OrderSide::Buy, 10.0, 150.0, 0.0, 0).unwrap();

        assert!(t.update_from_bar(&bar("AAPL", 149.0, 149.5, 146.0, 146.5)).is_some());
        let exit = t
            .update_from_bar(&bar("AAPL", 149.0, 149.5, 146.0, 146.5));
        // Second sample: position already closing — no duplicate.
        assert!(exit.is_none());
    }

    #[test]
    fn gap_through_stop_exits_at_open() {
        let t = tracker();
        t.register_entry("AAPL", 150.0, long_meta(Some(147.0), None, None)).unwrap();
        t.apply_fill("AAPL", OrderSide::Buy, 10.0, 150.0, 0.0, 0).unwrap();

        // Bar gaps open far below the stop.
        let exit = t
            .update_from_bar(&bar("AAPL", 140.0, 142.0, 139.0, 141.0))
            .expect("gap must exit");
        assert_eq!(exit.reason, ExitReason::StopHit);
        assert!((exit.ref_price - 140.0).abs() < 1e-9);
    }

    #[test]
    fn take_hit() {
        let t = tracker();
        t.register_entry("AAPL", 150.0, long_meta(Some(147.0), Some(156.0), None)).unwrap();
        t.apply_fill("AAPL", OrderSide::Buy, 10.0, 150.0, 0.0, 0).unwrap();

        let exit = t
            .update_from_bar(&bar("AAPL", 155.0, 157.0, 154.5, 156.5))
            .expect("take must fire");
        assert_eq!(exit.reason, ExitReason::TakeHit);
    }

    #[test]
    fn trailing_stop_reference_sequence() {
        // LONG at 150, trailing 2%. Closes 150, 155, 160, 157, 155.
        // Anchor walks 150 -> 155 -> 160 and never retreats; the trail sits
        // at 147.0, 151.9, 156.8, 156.8, 156.8. The close at 155 <= 156.8
        // fires the trailing exit.
        let t = tracker();
        t.register_entry("AAPL", 150.0, long_meta(None, None, Some(2.0))).unwrap();
        t.apply_fill("AAPL", OrderSide::Buy, 10.0, 150.0, 0.0, 0).unwrap();

        let closes = [150.0, 155.0, 160.0, 157.0, 155.0];
        let expected_trail = [147.0, 151.9, 156.8, 156.8, 156.8];
        let mut fired = None;
        for (i, &close) in closes.iter().enumerate() {
            let b = bar("AAPL", close, close + 0.2, close - 0.2, close);
            let exit = t.update_from_bar(&b);
            let p = t.position("AAPL").unwrap();
            assert!(
                (p.trailing_stop().unwrap() - expected_trail[i]).abs() < 1e-9,
                "trail at step {i}: got {}, want {}",
                p.trailing_stop().unwrap(),
                expected_trail[i]
            );
            if let Some(e) = exit {
                fired = Some((i, e));
                break;
            }
        }
        let (step, exit) = fired.expect("trailing exit must fire");
        assert_eq!(step, 4);
        assert_eq!(exit.reason, ExitReason::TrailingHit);
        assert!((exit.ref_price - 155.0).abs() < 1e-9);
    }

    #[test]
    fn short_trailing_anchor_monotone_down() {
        let t = tracker();
        t.register_entry(
            "TSLA",
            200.0,
            PositionMeta {
                direction: Direction::Short,
                stop: None,
                take: None,
                trailing_percent: Some(2.0),
            },
        )
        .unwrap();
        t.apply_fill("TSLA", OrderSide::Sell, 10.0, 200.0, 0.0, 0).unwrap();

        t.update_from_bar(&bar("TSLA", 196.0, 196.5, 195.0, 195.0));
        let p = t.position("TSLA").unwrap();
        assert!((p.trailing_anchor.unwrap() - 195.0).abs() < 1e-9);

        // A bounce must not raise the anchor.
        let exit = t.update_from_bar(&bar("TSLA", 197.0, 199.5, 196.5, 199.2));
        let trail = 195.0 * 1.02; // 198.9
        assert!(exit.is_some(), "bounce through {trail} should stop the short");
    }

    #[test]
    fn strategy_exit_requires_matching_direction() {
        let t = tracker();
        t.apply_fill("AAPL", OrderSide::Buy, 10.0, 150.0, 0.0, 0).unwrap();

        assert!(t.request_strategy_exit("AAPL", Direction::Short).is_none());
        let exit = t.request_strategy_exit("AAPL", Direction::Long).unwrap();
        assert_eq!(exit.reason, ExitReason::StrategyExit);
        // Duplicate requests suppressed.
        assert!(t.request_strategy_exit("AAPL", Direction::Long).is_none());
        // Failure path re-arms.
        t.clear_closing("AAPL");
        assert!(t.request_strategy_exit("AAPL", Direction::Long).is_some());
    }

    #[test]
    fn peak_equity_is_non_decreasing() {
        let t = tracker();
        t.apply_fill("AAPL", OrderSide::Buy, 100.0, 150.0, 0.0, 0).unwrap();
        t.update_from_bar(&bar("AAPL", 160.0, 161.0, 159.0, 160.0));
        let peak_after_rise = t.snapshot().peak_equity;
        assert!(peak_after_rise > 100_000.0);

        t.update_from_bar(&bar("AAPL", 150.0, 151.0, 149.0, 150.0));
        let snap = t.snapshot();
        assert_eq!(snap.peak_equity, peak_after_rise);
        assert!(snap.equity < snap.peak_equity);
        assert!(snap.drawdown() > 0.0);
    }

    #[test]
    fn replaying_fills_is_deterministic() {
        let fills = [
            ("AAPL", OrderSide::Buy, 100.0, 150.0, 1.0),
            ("AAPL", OrderSide::Buy, 50.0, 152.0, 1.0),
            ("MSFT", OrderSide::Buy, 20.0, 300.0, 1.0),
            ("AAPL", OrderSide::Sell, 150.0, 155.0, 1.5),
            ("MSFT", OrderSide::Sell, 20.0, 290.0, 1.0),
        ];
        let run = || {
            let t = tracker();
            for (i, (symbol, side, qty, price, commission)) in fills.iter().enumerate() {
                t.apply_fill(symbol, *side, *qty, *price, *commission, i as i64)
                    .unwrap();
            }
            t.snapshot()
        };
        let a = run();
        let b = run();
        assert_eq!(a.cash, b.cash);
        assert_eq!(a.equity, b.equity);
        assert_eq!(a.realized_day_pnl, b.realized_day_pnl);
        assert_eq!(a.daily_trade_count, b.daily_trade_count);
    }

    #[test]
    fn roll_day_resets_counters() {
        let t = tracker();
        t.apply_fill("A", OrderSide::Buy, 10.0, 100.0, 0.0, 0).unwrap();
        t.apply_fill("A", OrderSide::Sell, 10.0, 90.0, 0.0, 1).unwrap();
        assert!(t.snapshot().realized_day_pnl < 0.0);

        t.roll_day();
        let snap = t.snapshot();
        assert_eq!(snap.realized_day_pnl, 0.0);
        assert_eq!(snap.daily_trade_count, 0);
        assert_eq!(snap.day_start_equity, snap.equity);
    }
}
