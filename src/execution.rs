// =============================================================================
// Execution manager — five-stage validation pipeline
// =============================================================================
//
// Every TradeIntent passes through, in order:
//
//   1. Receive      — universe membership, halt state, disabled strategies,
//                     daily signal budget
//   2. Global risk  — kernel gate with the conservative max_position_value
//                     estimate
//   3. Regime       — strategy weight x aggressiveness applied to
//                     confidence; CRISIS accepts exits only
//   4. Sizing       — quantity from the sizer; zero is a rejection
//   5. Final        — exposure recomputed with the real sized notional at
//                     the live broker price, then the bracket goes out
//
// Stages for one intent run to completion before the next intent for the
// same symbol is considered (the engine drives intents sequentially).
// Every verdict — pass or reject — lands in the audit journal, so an
// approved intent logs all five stages. Re-submitting the same intent
// within a cycle (same symbol, side, strategy set, cycle id) is a no-op.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::{BrokerHandle, OrderSide};
use crate::config::{PositionLimitsConfig, SignalsConfig, StopsConfig, StrategiesConfig};
use crate::journal::{AuditRecord, Journal};
use crate::market_data::{Tier, Universe};
use crate::orders::OrderManager;
use crate::positions::{PositionMeta, PositionTracker};
use crate::regime::{MarketRegime, RegimeState};
use crate::risk::{RiskDecision, RiskKernel};
use crate::signals::{SignalKind, TradeIntent};
use crate::sizing::{PositionSizer, SizeRequest};
use crate::types::Direction;

/// Per-cycle environment the pipeline evaluates against.
pub struct CycleEnv<'a> {
    pub cycle_id: u64,
    pub universe: &'a Universe,
    pub regime: &'a RegimeState,
    /// Realized per-bar volatility of the intent's symbol, if known.
    pub realized_vol: Option<f64>,
    pub now_ms: i64,
}

/// Final verdict for one intent.
#[derive(Debug)]
pub enum PipelineOutcome {
    Approved { order_id: String, qty: f64 },
    Rejected { stage: u8, reason: String },
    /// Same (symbol, side, strategy set, cycle) already processed.
    Duplicate,
}

/// Running pipeline counters.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub received: u64,
    pub approved: u64,
    pub execution_rate: f64,
}

pub struct ExecutionManager {
    kernel: Arc<RiskKernel>,
    sizer: PositionSizer,
    tracker: Arc<PositionTracker>,
    orders: Arc<OrderManager>,
    journal: Arc<Journal>,
    broker: BrokerHandle,
    signals_config: SignalsConfig,
    strategies_config: StrategiesConfig,
    limits: PositionLimitsConfig,
    stops: StopsConfig,
    max_portfolio_exposure: f64,

    seen_intents: RwLock<HashSet<String>>,
    dedup_cycle: AtomicU64,
    received: AtomicU64,
    approved: AtomicU64,
    signals_today: AtomicU32,
}

impl ExecutionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kernel: Arc<RiskKernel>,
        sizer: PositionSizer,
        tracker: Arc<PositionTracker>,
        orders: Arc<OrderManager>,
        journal: Arc<Journal>,
        broker: BrokerHandle,
        signals_config: SignalsConfig,
        strategies_config: StrategiesConfig,
        limits: PositionLimitsConfig,
        stops: StopsConfig,
        max_portfolio_exposure: f64,
    ) -> Self {
        Self {
            kernel,
            sizer,
            tracker,
            orders,
            journal,
            broker,
            signals_config,
            strategies_config,
            limits,
            stops,
            max_portfolio_exposure,
            seen_intents: RwLock::new(HashSet::new()),
            dedup_cycle: AtomicU64::new(0),
            received: AtomicU64::new(0),
            approved: AtomicU64::new(0),
            signals_today: AtomicU32::new(0),
        }
    }

    pub fn stats(&self) -> ExecutionStats {
        let received = self.received.load(Ordering::Relaxed);
        let approved = self.approved.load(Ordering::Relaxed);
        ExecutionStats {
            received,
            approved,
            execution_rate: if received > 0 {
                approved as f64 / received as f64
            } else {
                0.0
            },
        }
    }

    /// Reset the daily signal budget at session open.
    pub fn roll_day(&self) {
        self.signals_today.store(0, Ordering::Relaxed);
    }

    fn audit(&self, env: &CycleEnv<'_>, intent: &TradeIntent, stage: u8, reason: Option<&str>) {
        self.journal.record_audit(&AuditRecord {
            ts: env.now_ms,
            cycle_id: env.cycle_id,
            intent_id: intent.id.clone(),
            symbol: intent.symbol.clone(),
            stage,
            verdict: if reason.is_none() { "PASS" } else { "REJECT" }.into(),
            reason: reason.map(str::to_string),
            summary: intent.summary(),
        });
    }

    fn reject(
        &self,
        env: &CycleEnv<'_>,
        intent: &TradeIntent,
        stage: u8,
        reason: &str,
    ) -> PipelineOutcome {
        info!(
            symbol = %intent.symbol,
            stage,
            reason,
            summary = %intent.summary(),
            "intent rejected"
        );
        self.audit(env, intent, stage, Some(reason));
        PipelineOutcome::Rejected {
            stage,
            reason: reason.to_string(),
        }
    }

    /// Run one intent through the pipeline.
    pub async fn process(&self, intent: &TradeIntent, env: &CycleEnv<'_>) -> PipelineOutcome {
        // Dedup scope is one cycle.
        if self.dedup_cycle.swap(env.cycle_id, Ordering::Relaxed) != env.cycle_id {
            self.seen_intents.write().clear();
        }
        if !self.seen_intents.write().insert(intent.dedup_key()) {
            debug!(symbol = %intent.symbol, "duplicate intent — no-op");
            return PipelineOutcome::Duplicate;
        }

        self.received.fetch_add(1, Ordering::Relaxed);

        if intent.kind.is_exit() {
            return self.process_exit(intent, env).await;
        }
        self.process_entry(intent, env).await
    }

    // -------------------------------------------------------------------------
    // Exits: the same five audited stages as entries. The risk and regime
    // gates are consulted but never block — exits reduce risk and are
    // permitted under halt and in CRISIS — while the sizing stage confirms
    // the closing quantity before the market order goes out.
    // -------------------------------------------------------------------------

    async fn process_exit(&self, intent: &TradeIntent, env: &CycleEnv<'_>) -> PipelineOutcome {
        let direction = match intent.kind {
            SignalKind::ExitLong => Direction::Long,
            SignalKind::ExitShort => Direction::Short,
            _ => unreachable!("process_exit called with entry kind"),
        };

        // ── Stage 1: Receive — an open position in the intent's direction
        //    that is not already closing ─────────────────────────────────
        let Some(position) = self.tracker.position(&intent.symbol) else {
            return self.reject(env, intent, 1, "NO_POSITION");
        };
        if position.direction != direction || position.closing {
            return self.reject(env, intent, 1, "NO_POSITION");
        }
        self.audit(env, intent, 1, None);

        // ── Stage 2: Global risk — consulted and logged; closing a
        //    position only shrinks exposure, so the gate cannot deny ─────
        let snapshot = self.tracker.snapshot();
        let exposure_before = self.kernel.exposure(&snapshot);
        debug!(
            symbol = %intent.symbol,
            exposure = format!("{exposure_before:.2}"),
            halt = %self.kernel.halt_state(),
            "exit passes the risk gate"
        );
        self.audit(env, intent, 2, None);

        // ── Stage 3: Regime — every regime accepts exits, CRISIS included
        debug!(symbol = %intent.symbol, regime = %env.regime.regime, "exit passes the regime gate");
        self.audit(env, intent, 3, None);

        // ── Stage 4: Sizing — confirm the closing quantity ──────────────
        let qty = match self.sizer.confirm_exit(position.qty) {
            Ok(qty) => qty,
            Err(rejection) => {
                return self.reject(env, intent, 4, &format!("SIZING_{rejection}"));
            }
        };
        self.audit(env, intent, 4, None);

        // ── Stage 5: Final — mark the position closing and hand off ─────
        let Some(exit) = self.tracker.request_strategy_exit(&intent.symbol, direction) else {
            return self.reject(env, intent, 5, "NO_POSITION");
        };
        let close_side = match direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };
        match self
            .orders
            .submit_market_close(&intent.symbol, close_side, qty, &exit.reason.to_string())
            .await
        {
            Ok(order_id) => {
                self.audit(env, intent, 5, None);
                self.approved.fetch_add(1, Ordering::Relaxed);
                PipelineOutcome::Approved { order_id, qty }
            }
            Err(e) => {
                self.tracker.clear_closing(&intent.symbol);
                self.reject(env, intent, 5, &format!("BROKER: {e}"))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Entries: all five stages.
    // -------------------------------------------------------------------------

    async fn process_entry(&self, intent: &TradeIntent, env: &CycleEnv<'_>) -> PipelineOutcome {
        let Some(direction) = intent.kind.entry_direction() else {
            return self.reject(env, intent, 1, "NOT_AN_ENTRY");
        };

        // ── Stage 1: Receive ────────────────────────────────────────────
        if !env.universe.contains(&intent.symbol) {
            return self.reject(env, intent, 1, "NOT_IN_UNIVERSE");
        }
        if self.kernel.is_halted() {
            return self.reject(env, intent, 1, "HALTED");
        }
        if let Some(disabled) = intent
            .strategies
            .iter()
            .find(|id| !self.strategies_config.is_enabled(**id))
        {
            return self.reject(env, intent, 1, &format!("STRATEGY_DISABLED: {disabled}"));
        }
        if self.signals_today.load(Ordering::Relaxed) >= self.signals_config.max_signals_per_day {
            return self.reject(env, intent, 1, "DAILY_SIGNAL_BUDGET");
        }
        self.audit(env, intent, 1, None);

        let tier = env.universe.tier(&intent.symbol).unwrap_or(Tier::Standard);

        // ── Stage 2: Global risk (conservative estimate) ────────────────
        let snapshot = self.tracker.snapshot();
        match self.kernel.can_open_new_position(
            &snapshot,
            &intent.symbol,
            direction,
            self.limits.max_position_value,
            tier,
        ) {
            RiskDecision::Allow => self.audit(env, intent, 2, None),
            RiskDecision::Deny { reason } => {
                return self.reject(env, intent, 2, &reason.to_string());
            }
        }

        // ── Stage 3: Regime ─────────────────────────────────────────────
        if env.regime.regime == MarketRegime::Crisis {
            return self.reject(env, intent, 3, "REGIME_CRISIS");
        }
        let weight = env.regime.mean_weight(&intent.strategies);
        let adjusted_confidence = intent.confidence * weight * env.regime.aggressiveness;
        let regime_floor = self.signals_config.confidence_floor * env.regime.aggressiveness;
        if adjusted_confidence < regime_floor {
            return self.reject(
                env,
                intent,
                3,
                &format!(
                    "CONFIDENCE_BELOW_REGIME_FLOOR: {adjusted_confidence:.3} < {regime_floor:.3}"
                ),
            );
        }
        self.audit(env, intent, 3, None);

        // ── Stage 4: Sizing ─────────────────────────────────────────────
        let exposure = self.kernel.exposure(&snapshot);
        let headroom = (self.max_portfolio_exposure * snapshot.equity - exposure).max(0.0);
        let request = SizeRequest {
            symbol: intent.symbol.clone(),
            entry: intent.entry,
            stop: intent.stop,
            confidence: adjusted_confidence,
            equity: snapshot.equity,
            tier,
            realized_vol: env.realized_vol,
            stats: self.tracker.trade_stats(),
            exposure_headroom: headroom,
        };
        let qty = match self.sizer.size(intent.sizing_method, &request) {
            Ok(qty) => qty,
            Err(rejection) => {
                return self.reject(env, intent, 4, &format!("SIZING_{rejection}"));
            }
        };
        self.audit(env, intent, 4, None);

        // ── Stage 5: Final check with the real sized notional ───────────
        // Live broker price when available; otherwise the conservative
        // max_position_value fallback. Never a per-share constant.
        let notional = match self.broker.current_price(&intent.symbol).await {
            Ok(Some(price)) if price > 0.0 => qty * price,
            _ => {
                warn!(
                    symbol = %intent.symbol,
                    "no live price at final check — using max_position_value fallback"
                );
                self.limits.max_position_value
            }
        };
        // The notional is already tier-scaled through the sized quantity, so
        // the kernel sees it with a neutral tier.
        let final_snapshot = self.tracker.snapshot();
        match self.kernel.can_open_new_position(
            &final_snapshot,
            &intent.symbol,
            direction,
            notional,
            Tier::Standard,
        ) {
            RiskDecision::Allow => {}
            RiskDecision::Deny { reason } => {
                return self.reject(env, intent, 5, &reason.to_string());
            }
        }

        // Protective levels must sit on the correct sides before any order
        // goes out; a violation here is fatal.
        let meta = PositionMeta {
            direction,
            stop: Some(intent.stop),
            take: Some(intent.take),
            trailing_percent: self.stops.trailing_percent,
        };
        if let Err(e) = self.tracker.register_entry(&intent.symbol, intent.entry, meta) {
            warn!(symbol = %intent.symbol, error = %e, "invariant violation — halting");
            self.kernel.operator_halt("INVARIANT_VIOLATION");
            return self.reject(env, intent, 5, "INVARIANT_VIOLATION");
        }

        let entry_side = match direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        };
        let strategy_label = intent
            .strategies
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("+");

        match self
            .orders
            .submit_bracket_entry(
                &intent.symbol,
                entry_side,
                qty,
                intent.stop,
                intent.take,
                &strategy_label,
                env.cycle_id,
            )
            .await
        {
            Ok(order_id) => {
                self.audit(env, intent, 5, None);
                self.approved.fetch_add(1, Ordering::Relaxed);
                self.signals_today.fetch_add(1, Ordering::Relaxed);
                info!(
                    symbol = %intent.symbol,
                    order_id = %order_id,
                    qty,
                    confidence = format!("{:.3}", adjusted_confidence),
                    "intent approved and submitted"
                );
                PipelineOutcome::Approved { order_id, qty }
            }
            Err(e) => {
                self.tracker.clear_pending_entry(&intent.symbol);
                self.reject(env, intent, 5, &format!("BROKER: {e}"))
            }
        }
    }
}
