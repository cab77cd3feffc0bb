// =============================================================================
// Risk kernel — pure evaluation of portfolio state against hard limits
// =============================================================================
//
// The kernel owns exactly two things: the halt state machine and the broker
// fatal-error tally. Everything else is pure evaluation over read-only
// portfolio snapshots supplied by the position tracker.
//
// Checks:
//   1. Halt state       — Running / CoolDown(until) / Halted(reason).
//                         Halted exits only on explicit operator resume;
//                         CoolDown expires back to Running on its own.
//   2. Position count   — open positions < max_positions.
//   3. Exposure         — current + estimated <= max_portfolio_exposure x
//                         equity. Position exposure is qty x price when the
//                         price is positive; non-positive prices are skipped
//                         with a warning, never substituted with a constant.
//   4. Portfolio heat   — sum of (distance-to-stop x qty) / equity. A
//                         position without a stop is charged the configured
//                         max_position_heat penalty so a missing stop never
//                         shrinks measured risk.
// =============================================================================

use std::collections::HashSet;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RiskLimitsConfig;
use crate::market_data::Tier;
use crate::types::Direction;

/// Distinct broker-fatal symbols that escalate to a trading halt.
const FATAL_SYMBOL_LIMIT: usize = 3;

// ---------------------------------------------------------------------------
// Halt state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HaltState {
    Running,
    /// Entered on a consecutive-loss trip; expires back to Running.
    CoolDown { until_ms: i64 },
    /// Exited only by operator resume.
    Halted { reason: String },
}

impl HaltState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Halted { .. })
    }
}

impl std::fmt::Display for HaltState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::CoolDown { until_ms } => write!(f, "COOL_DOWN(until={until_ms})"),
            Self::Halted { reason } => write!(f, "HALTED({reason})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Why the kernel denied a new position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    Halted,
    CoolDown,
    MaxPositions,
    ExposureExceeded,
    HeatExceeded,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Halted => write!(f, "HALTED"),
            Self::CoolDown => write!(f, "COOL_DOWN"),
            Self::MaxPositions => write!(f, "MAX_POSITIONS"),
            Self::ExposureExceeded => write!(f, "EXPOSURE_EXCEEDED"),
            Self::HeatExceeded => write!(f, "HEAT_EXCEEDED"),
        }
    }
}

/// Typed risk verdict. Denials are decisions, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskDecision {
    Allow,
    Deny { reason: DenyReason },
}

impl RiskDecision {
    pub fn deny(reason: DenyReason) -> Self {
        Self::Deny { reason }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

// ---------------------------------------------------------------------------
// Portfolio snapshot (input to the pure evaluators)
// ---------------------------------------------------------------------------

/// Read-only exposure view of one open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionExposure {
    pub symbol: String,
    pub direction: Direction,
    pub qty: f64,
    pub current_price: f64,
    pub stop: Option<f64>,
}

/// Read-only portfolio state at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub cash: f64,
    pub equity: f64,
    pub peak_equity: f64,
    pub day_start_equity: f64,
    pub realized_day_pnl: f64,
    pub daily_trade_count: u32,
    pub consecutive_losses: u32,
    pub positions: Vec<PositionExposure>,
}

impl PortfolioSnapshot {
    /// drawdown = (peak - equity) / peak, zero on a degenerate peak.
    pub fn drawdown(&self) -> f64 {
        if self.peak_equity > 0.0 {
            (self.peak_equity - self.equity) / self.peak_equity
        } else {
            0.0
        }
    }

    /// Day loss as a fraction of day-start equity (negative when losing).
    pub fn day_pnl_frac(&self) -> f64 {
        if self.day_start_equity > 0.0 {
            self.realized_day_pnl / self.day_start_equity
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

pub struct RiskKernel {
    config: RiskLimitsConfig,
    max_positions: u32,
    halt: RwLock<HaltState>,
    fatal_symbols: RwLock<HashSet<String>>,
}

impl RiskKernel {
    pub fn new(config: RiskLimitsConfig, max_positions: u32) -> Self {
        info!(
            max_drawdown = config.max_drawdown,
            max_daily_loss = config.max_daily_loss,
            max_consecutive_losses = config.max_consecutive_losses,
            max_portfolio_heat = config.max_portfolio_heat,
            max_portfolio_exposure = config.max_portfolio_exposure,
            max_positions,
            "risk kernel initialised"
        );
        Self {
            config,
            max_positions,
            halt: RwLock::new(HaltState::Running),
            fatal_symbols: RwLock::new(HashSet::new()),
        }
    }

    pub fn halt_state(&self) -> HaltState {
        self.halt.read().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halt.read().is_halted()
    }

    // -------------------------------------------------------------------------
    // Operator controls
    // -------------------------------------------------------------------------

    pub fn operator_halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "operator halt");
        *self.halt.write() = HaltState::Halted { reason };
    }

    /// Explicit operator resume — the only exit from Halted. Also clears an
    /// active cool-down and the fatal-error tally.
    pub fn operator_resume(&self) {
        info!("operator resume — risk kernel running");
        *self.halt.write() = HaltState::Running;
        self.fatal_symbols.write().clear();
    }

    // -------------------------------------------------------------------------
    // Halt evaluation
    // -------------------------------------------------------------------------

    /// Evaluate the halt rules against a snapshot and transition the state
    /// machine. Returns the state after evaluation.
    pub fn evaluate_halt(&self, snapshot: &PortfolioSnapshot, now_ms: i64) -> HaltState {
        let mut halt = self.halt.write();

        // Halted sticks until the operator intervenes.
        if halt.is_halted() {
            return halt.clone();
        }

        let drawdown = snapshot.drawdown();
        if drawdown >= self.config.max_drawdown {
            warn!(
                drawdown = format!("{:.4}", drawdown),
                limit = self.config.max_drawdown,
                "max drawdown breached — halting"
            );
            *halt = HaltState::Halted {
                reason: "MAX_DRAWDOWN".into(),
            };
            return halt.clone();
        }

        if snapshot.day_pnl_frac() <= -self.config.max_daily_loss {
            warn!(
                day_pnl_frac = format!("{:.4}", snapshot.day_pnl_frac()),
                limit = self.config.max_daily_loss,
                "max daily loss breached — halting"
            );
            *halt = HaltState::Halted {
                reason: "DAILY_LOSS".into(),
            };
            return halt.clone();
        }

        let next = match halt.clone() {
            HaltState::CoolDown { until_ms } if now_ms >= until_ms => {
                info!("cool-down expired — running");
                Some(HaltState::Running)
            }
            HaltState::Running
                if snapshot.consecutive_losses >= self.config.max_consecutive_losses =>
            {
                let until_ms = now_ms + (self.config.cool_down_period as i64) * 1_000;
                warn!(
                    consecutive_losses = snapshot.consecutive_losses,
                    until_ms, "consecutive-loss limit hit — entering cool-down"
                );
                Some(HaltState::CoolDown { until_ms })
            }
            _ => None,
        };
        if let Some(next) = next {
            *halt = next;
        }

        halt.clone()
    }

    /// Record a fatal broker error for a symbol. Recurrence across several
    /// symbols halts trading.
    pub fn record_broker_fatal(&self, symbol: &str) {
        let mut fatal = self.fatal_symbols.write();
        fatal.insert(symbol.to_string());
        if fatal.len() >= FATAL_SYMBOL_LIMIT {
            warn!(
                symbols = fatal.len(),
                "fatal broker errors across multiple symbols — halting"
            );
            *self.halt.write() = HaltState::Halted {
                reason: "BROKER_ERRORS".into(),
            };
        }
    }

    // -------------------------------------------------------------------------
    // Pure evaluators
    // -------------------------------------------------------------------------

    /// Total open exposure: qty x price for positions with a positive price.
    /// Non-positive prices are skipped with a warning — exposure is never
    /// backfilled with a constant.
    pub fn exposure(&self, snapshot: &PortfolioSnapshot) -> f64 {
        let mut total = 0.0;
        for pos in &snapshot.positions {
            if pos.current_price > 0.0 {
                total += pos.qty * pos.current_price;
            } else {
                warn!(
                    symbol = %pos.symbol,
                    price = pos.current_price,
                    "skipping position with non-positive price in exposure"
                );
            }
        }
        total
    }

    /// Aggregate open risk over equity. Positions without stops are charged
    /// the max_position_heat penalty.
    pub fn portfolio_heat(&self, snapshot: &PortfolioSnapshot) -> f64 {
        if snapshot.equity <= 0.0 {
            return f64::INFINITY;
        }
        let mut heat = 0.0;
        for pos in &snapshot.positions {
            match pos.stop {
                Some(stop) if pos.current_price > 0.0 => {
                    heat += (pos.current_price - stop).abs() * pos.qty / snapshot.equity;
                }
                _ => {
                    heat += self.config.max_position_heat;
                }
            }
        }
        heat
    }

    /// Gate a prospective entry. `estimated_value` is the candidate
    /// notional; the tier multiplier scales it before the exposure check.
    pub fn can_open_new_position(
        &self,
        snapshot: &PortfolioSnapshot,
        symbol: &str,
        _direction: Direction,
        estimated_value: f64,
        tier: Tier,
    ) -> RiskDecision {
        match &*self.halt.read() {
            HaltState::Halted { .. } => return RiskDecision::deny(DenyReason::Halted),
            HaltState::CoolDown { .. } => return RiskDecision::deny(DenyReason::CoolDown),
            HaltState::Running => {}
        }

        if snapshot.positions.len() as u32 >= self.max_positions {
            return RiskDecision::deny(DenyReason::MaxPositions);
        }

        let scaled_estimate = estimated_value * tier.size_multiplier();
        let exposure = self.exposure(snapshot);
        let max_exposure = self.config.max_portfolio_exposure * snapshot.equity;
        if exposure + scaled_estimate > max_exposure {
            warn!(
                symbol,
                exposure = format!("{:.2}", exposure),
                estimate = format!("{:.2}", scaled_estimate),
                limit = format!("{:.2}", max_exposure),
                "exposure limit would be exceeded"
            );
            return RiskDecision::deny(DenyReason::ExposureExceeded);
        }

        if self.portfolio_heat(snapshot) > self.config.max_portfolio_heat {
            return RiskDecision::deny(DenyReason::HeatExceeded);
        }

        RiskDecision::Allow
    }
}

impl std::fmt::Debug for RiskKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskKernel")
            .field("halt", &*self.halt.read())
            .field("max_positions", &self.max_positions)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> RiskKernel {
        RiskKernel::new(RiskLimitsConfig::default(), 5)
    }

    fn snapshot(equity: f64, positions: Vec<PositionExposure>) -> PortfolioSnapshot {
        PortfolioSnapshot {
            cash: equity,
            equity,
            peak_equity: equity,
            day_start_equity: equity,
            realized_day_pnl: 0.0,
            daily_trade_count: 0,
            consecutive_losses: 0,
            positions,
        }
    }

    fn position(symbol: &str, qty: f64, price: f64, stop: Option<f64>) -> PositionExposure {
        PositionExposure {
            symbol: symbol.into(),
            direction: Direction::Long,
            qty,
            current_price: price,
            stop,
        }
    }

    #[test]
    fn allow_with_headroom() {
        let k = kernel();
        let snap = snapshot(100_000.0, vec![position("AAPL", 10.0, 150.0, Some(147.0))]);
        let decision = k.can_open_new_position(&snap, "MSFT", Direction::Long, 2_000.0, Tier::Standard);
        assert!(decision.is_allowed());
    }

    #[test]
    fn exposure_boundary_is_inclusive() {
        // equity 100k, open exposure 58k, limit 60%: a 2 000 estimate fills
        // the budget exactly and is allowed; 2 001 is not.
        let k = kernel();
        let snap = snapshot(100_000.0, vec![position("TSLA", 580.0, 100.0, Some(98.0))]);
        assert!(k
            .can_open_new_position(&snap, "MSFT", Direction::Long, 2_000.0, Tier::Standard)
            .is_allowed());
        assert_eq!(
            k.can_open_new_position(&snap, "MSFT", Direction::Long, 2_001.0, Tier::Standard),
            RiskDecision::deny(DenyReason::ExposureExceeded)
        );
    }

    #[test]
    fn max_positions_denied() {
        let k = RiskKernel::new(RiskLimitsConfig::default(), 1);
        let snap = snapshot(100_000.0, vec![position("AAPL", 10.0, 150.0, Some(147.0))]);
        assert_eq!(
            k.can_open_new_position(&snap, "MSFT", Direction::Long, 1_000.0, Tier::Standard),
            RiskDecision::deny(DenyReason::MaxPositions)
        );
    }

    #[test]
    fn halted_denies_entries() {
        let k = kernel();
        k.operator_halt("manual");
        let snap = snapshot(100_000.0, vec![]);
        assert_eq!(
            k.can_open_new_position(&snap, "AAPL", Direction::Long, 1_000.0, Tier::Standard),
            RiskDecision::deny(DenyReason::Halted)
        );
        // Resume is the only way back.
        k.operator_resume();
        assert!(k
            .can_open_new_position(&snap, "AAPL", Direction::Long, 1_000.0, Tier::Standard)
            .is_allowed());
    }

    #[test]
    fn drawdown_trips_halt() {
        let k = kernel();
        let mut snap = snapshot(96_000.0, vec![]);
        snap.peak_equity = 120_000.0; // drawdown 20% == limit
        let state = k.evaluate_halt(&snap, 0);
        assert!(state.is_halted());
        // Sticks across later evaluations even when state recovers.
        let healthy = snapshot(120_000.0, vec![]);
        assert!(k.evaluate_halt(&healthy, 0).is_halted());
    }

    #[test]
    fn drawdown_just_below_limit_keeps_running() {
        let k = kernel();
        let mut snap = snapshot(96_001.0, vec![]);
        snap.peak_equity = 120_000.0; // 19.999...%
        assert!(k.evaluate_halt(&snap, 0).is_running());
    }

    #[test]
    fn daily_loss_trips_halt() {
        let k = kernel();
        let mut snap = snapshot(97_000.0, vec![]);
        snap.day_start_equity = 100_000.0;
        snap.realized_day_pnl = -3_000.0; // exactly -3%
        assert!(k.evaluate_halt(&snap, 0).is_halted());
    }

    #[test]
    fn consecutive_losses_cool_down_then_running() {
        let k = kernel();
        let mut snap = snapshot(100_000.0, vec![]);
        snap.consecutive_losses = 4;

        let state = k.evaluate_halt(&snap, 1_000_000);
        let until = match state {
            HaltState::CoolDown { until_ms } => until_ms,
            other => panic!("expected CoolDown, got {other:?}"),
        };
        assert_eq!(until, 1_000_000 + 3_600 * 1_000);

        // Still cooling before expiry.
        snap.consecutive_losses = 0;
        assert!(matches!(
            k.evaluate_halt(&snap, until - 1),
            HaltState::CoolDown { .. }
        ));
        // Expires back to running.
        assert!(k.evaluate_halt(&snap, until).is_running());
    }

    #[test]
    fn cool_down_denies_entries() {
        let k = kernel();
        let mut snap = snapshot(100_000.0, vec![]);
        snap.consecutive_losses = 4;
        k.evaluate_halt(&snap, 0);
        assert_eq!(
            k.can_open_new_position(&snap, "AAPL", Direction::Long, 1_000.0, Tier::Standard),
            RiskDecision::deny(DenyReason::CoolDown)
        );
    }

    #[test]
    fn heat_counts_stop_distance_and_penalises_missing_stops() {
        let k = kernel();
        // 100 shares, $3 to stop, equity 100k => 0.003 heat.
        let snap = snapshot(100_000.0, vec![position("AAPL", 100.0, 150.0, Some(147.0))]);
        assert!((k.portfolio_heat(&snap) - 0.003).abs() < 1e-12);

        // A stopless position is charged the penalty, not zero.
        let snap = snapshot(100_000.0, vec![position("AAPL", 100.0, 150.0, None)]);
        assert!((k.portfolio_heat(&snap) - 0.02).abs() < 1e-12);
    }

    #[test]
    fn heat_limit_denies() {
        let k = kernel();
        // Three stopless positions: 3 x 0.02 = 0.06 heat, at the limit; a
        // fourth pushes past it.
        let positions: Vec<PositionExposure> = (0..4)
            .map(|i| position(&format!("S{i}"), 1.0, 10.0, None))
            .collect();
        let snap = snapshot(100_000.0, positions);
        assert_eq!(
            k.can_open_new_position(&snap, "AAPL", Direction::Long, 100.0, Tier::Standard),
            RiskDecision::deny(DenyReason::HeatExceeded)
        );
    }

    #[test]
    fn non_positive_price_skipped_in_exposure() {
        let k = kernel();
        let snap = snapshot(
            100_000.0,
            vec![
                position("GOOD", 10.0, 100.0, Some(98.0)),
                position("BAD", 10.0, 0.0, Some(98.0)),
            ],
        );
        // Only the valid position counts; the bad one is skipped, not
        // replaced by any constant.
        assert!((k.exposure(&snap) - 1_000.0).abs() < 1e-12);
    }

    #[test]
    fn tier_multiplier_scales_estimate() {
        let k = kernel();
        // 60% of 100k = 60k budget; 59k already used.
        let snap = snapshot(100_000.0, vec![position("AAPL", 590.0, 100.0, Some(99.0))]);
        // A 2 000 standard estimate exceeds the budget...
        assert!(!k
            .can_open_new_position(&snap, "TSLA", Direction::Long, 2_000.0, Tier::Standard)
            .is_allowed());
        // ...but the same estimate on an extreme-tier symbol is scaled 0.4x.
        assert!(k
            .can_open_new_position(&snap, "TSLA", Direction::Long, 2_000.0, Tier::Extreme)
            .is_allowed());
    }

    #[test]
    fn broker_fatal_recurrence_halts() {
        let k = kernel();
        k.record_broker_fatal("AAPL");
        k.record_broker_fatal("AAPL"); // same symbol does not escalate
        assert!(!k.is_halted());
        k.record_broker_fatal("MSFT");
        assert!(!k.is_halted());
        k.record_broker_fatal("TSLA");
        assert!(k.is_halted());
    }

    #[test]
    fn snapshot_drawdown_formula() {
        let mut snap = snapshot(96_000.0, vec![]);
        snap.peak_equity = 120_000.0;
        assert!((snap.drawdown() - 0.2).abs() < 1e-12);
    }
}
