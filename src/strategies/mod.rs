// =============================================================================
// Strategy runtime — capability trait, enumerated registry, per-cycle driver
// =============================================================================
//
// Each strategy is a value behind the `Strategy` trait:
//
//   analyze(bars)            -> EnrichedBars (appends the indicator series
//                               the strategy needs)
//   generate_signal(...)     -> at most one non-Hold Signal per symbol per
//                               cycle
//   compute_stop / compute_take
//                            -> price levels from the strategy's ATR or
//                               fixed-percent policy
//
// Strategies are constructed from the enumerated `StrategyId` registry;
// unknown ids never get this far (they fail config parsing). A strategy
// error disables that strategy for the remainder of the cycle only.
// =============================================================================

pub mod ema_cross;
pub mod mean_reversion;
pub mod momentum;
pub mod opening_range;
pub mod pairs;
pub mod rsi_divergence;
pub mod volume_breakout;
pub mod vwap_cross;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{StopMode, StopPolicy, StrategiesConfig, StrategyParams, TakeMode, TakePolicy};
use crate::errors::EngineError;
use crate::indicators::atr::current_atr;
use crate::market_data::Bar;
use crate::signals::Signal;
use crate::types::Direction;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Enumerated strategy identifiers. Config references these by snake_case
/// name; an unknown name is a parse error, not a runtime fallback.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    EmaCross,
    VwapCross,
    VolumeBreakout,
    RsiDivergence,
    MeanReversion,
    Momentum,
    OpeningRange,
    Pairs,
}

impl StrategyId {
    pub const ALL: [StrategyId; 8] = [
        Self::EmaCross,
        Self::VwapCross,
        Self::VolumeBreakout,
        Self::RsiDivergence,
        Self::MeanReversion,
        Self::Momentum,
        Self::OpeningRange,
        Self::Pairs,
    ];
}

impl std::fmt::Display for StrategyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EmaCross => "ema_cross",
            Self::VwapCross => "vwap_cross",
            Self::VolumeBreakout => "volume_breakout",
            Self::RsiDivergence => "rsi_divergence",
            Self::MeanReversion => "mean_reversion",
            Self::Momentum => "momentum",
            Self::OpeningRange => "opening_range",
            Self::Pairs => "pairs",
        };
        write!(f, "{name}")
    }
}

/// Build the strategy value for an id with its configured parameters.
pub fn build(id: StrategyId, params: StrategyParams) -> Box<dyn Strategy> {
    match id {
        StrategyId::EmaCross => Box::new(ema_cross::EmaCross::new(params)),
        StrategyId::VwapCross => Box::new(vwap_cross::VwapCross::new(params)),
        StrategyId::VolumeBreakout => Box::new(volume_breakout::VolumeBreakout::new(params)),
        StrategyId::RsiDivergence => Box::new(rsi_divergence::RsiDivergence::new(params)),
        StrategyId::MeanReversion => Box::new(mean_reversion::MeanReversion::new(params)),
        StrategyId::Momentum => Box::new(momentum::Momentum::new(params)),
        StrategyId::OpeningRange => Box::new(opening_range::OpeningRange::new(params)),
        StrategyId::Pairs => Box::new(pairs::Pairs::new(params)),
    }
}

// ---------------------------------------------------------------------------
// EnrichedBars and CycleContext
// ---------------------------------------------------------------------------

/// Bars plus the indicator series a strategy appended during `analyze`.
pub struct EnrichedBars {
    pub bars: Vec<Bar>,
    series: HashMap<&'static str, Vec<Option<f64>>>,
}

impl EnrichedBars {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self {
            bars,
            series: HashMap::new(),
        }
    }

    /// Append an aligned indicator series under a name.
    pub fn append(&mut self, name: &'static str, series: Vec<Option<f64>>) {
        debug_assert_eq!(series.len(), self.bars.len(), "series must align to bars");
        self.series.insert(name, series);
    }

    pub fn series(&self, name: &str) -> Option<&[Option<f64>]> {
        self.series.get(name).map(|v| v.as_slice())
    }

    /// Latest defined value of a named series.
    pub fn latest(&self, name: &str) -> Option<f64> {
        crate::indicators::latest(self.series(name)?)
    }

    /// Value of a named series `index` bars back from the end (0 = last).
    pub fn nth_from_end(&self, name: &str, index: usize) -> Option<f64> {
        crate::indicators::nth_from_end(self.series(name)?, index)
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }
}

/// Per-cycle context shared by every strategy invocation.
pub struct CycleContext {
    pub cycle_id: u64,
    /// Wall-clock now, epoch milliseconds.
    pub now_ms: i64,
    /// Bars of the market index proxy for the same timeframe. Used by the
    /// pairs strategy and the correlation enhancer.
    pub proxy_bars: Vec<Bar>,
    /// Minutes until the session close, when inside a session.
    pub minutes_to_close: Option<i64>,
    /// Minutes since the session open, when inside a session.
    pub minutes_since_open: Option<i64>,
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

pub trait Strategy: Send + Sync {
    fn id(&self) -> StrategyId;

    fn params(&self) -> &StrategyParams;

    /// Compute and attach the indicator series this strategy reads.
    fn analyze(&self, bars: Vec<Bar>) -> Result<EnrichedBars, EngineError>;

    /// Evaluate the entry predicate. At most one non-Hold signal per symbol
    /// per cycle; `None` means Hold.
    fn generate_signal(
        &self,
        symbol: &str,
        enriched: &EnrichedBars,
        ctx: &CycleContext,
    ) -> Result<Option<Signal>, EngineError>;

    /// Protective stop for an entry at `entry`, from the strategy's policy.
    fn compute_stop(&self, direction: Direction, entry: f64, bars: &[Bar]) -> f64 {
        let policy = self
            .params()
            .stop_loss
            .unwrap_or_else(StopPolicy::default);
        stop_from_policy(policy, direction, entry, bars)
    }

    /// Take-profit for an entry at `entry` with stop at `stop`.
    fn compute_take(&self, direction: Direction, entry: f64, stop: f64) -> f64 {
        let policy = self
            .params()
            .take_profit
            .unwrap_or_else(TakePolicy::default);
        take_from_policy(policy, direction, entry, stop)
    }
}

/// Shared stop computation: ATR multiple or fixed percent, on the loss side
/// of the entry.
pub fn stop_from_policy(
    policy: StopPolicy,
    direction: Direction,
    entry: f64,
    bars: &[Bar],
) -> f64 {
    let distance = match policy.mode {
        StopMode::Atr => match current_atr(bars, 14) {
            Some(atr) => atr * policy.atr_multiplier,
            // ATR not ready: fall back to the percent leg of the policy.
            None => entry * policy.percent / 100.0,
        },
        StopMode::Percent => entry * policy.percent / 100.0,
    };
    entry - direction.sign() * distance
}

/// Shared take computation on the profit side of the entry.
pub fn take_from_policy(policy: TakePolicy, direction: Direction, entry: f64, stop: f64) -> f64 {
    let distance = match policy.mode {
        TakeMode::RiskReward => (entry - stop).abs() * policy.risk_reward,
        TakeMode::Percent => entry * policy.percent / 100.0,
    };
    entry + direction.sign() * distance
}

// ---------------------------------------------------------------------------
// Shared entry gates
// ---------------------------------------------------------------------------

/// Volume gate shared by every strategy that declares `volume_filter`:
/// current bar volume must clear the absolute floor and the ratio threshold.
pub fn volume_gate(params: &StrategyParams, enriched: &EnrichedBars) -> bool {
    if !params.volume_filter {
        return true;
    }
    let Some(last) = enriched.bars.last() else {
        return false;
    };
    if last.volume < params.min_volume {
        return false;
    }
    let volumes = crate::market_data::volumes(&enriched.bars);
    match crate::indicators::volume::current_volume_ratio(&volumes, params.lookback) {
        Some(ratio) => ratio >= params.volume_threshold,
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Per-cycle runtime
// ---------------------------------------------------------------------------

/// Runs the enabled strategies over one symbol's bars. A strategy that
/// errors is disabled for the remainder of the cycle; the others continue.
pub struct StrategyRuntime {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyRuntime {
    /// Build the enabled strategies. Per-strategy stop/take overrides are
    /// resolved here against the global stops block, so every strategy
    /// carries a concrete policy.
    pub fn from_config(config: &StrategiesConfig, stops: &crate::config::StopsConfig) -> Self {
        let strategies = config
            .enabled
            .iter()
            .map(|&id| {
                let mut params = config.params_for(id);
                params.stop_loss.get_or_insert(stops.stop_loss);
                params.take_profit.get_or_insert(stops.take_profit);
                build(id, params)
            })
            .collect();
        Self { strategies }
    }

    pub fn ids(&self) -> Vec<StrategyId> {
        self.strategies.iter().map(|s| s.id()).collect()
    }

    /// Evaluate every enabled strategy for one symbol. Returns the non-Hold
    /// signals and the ids of strategies disabled by errors this cycle.
    pub fn evaluate_symbol(
        &self,
        symbol: &str,
        bars: &[Bar],
        ctx: &CycleContext,
        disabled_this_cycle: &mut Vec<StrategyId>,
    ) -> Vec<Signal> {
        let mut signals = Vec::new();

        for strategy in &self.strategies {
            let id = strategy.id();
            if disabled_this_cycle.contains(&id) {
                continue;
            }

            let enriched = match strategy.analyze(bars.to_vec()) {
                Ok(enriched) => enriched,
                Err(e) => {
                    warn!(strategy = %id, symbol, error = %e, "strategy analyze failed — disabling for this cycle");
                    disabled_this_cycle.push(id);
                    continue;
                }
            };

            match strategy.generate_signal(symbol, &enriched, ctx) {
                Ok(Some(signal)) => {
                    debug!(
                        strategy = %id,
                        symbol,
                        kind = %signal.kind,
                        confidence = signal.confidence,
                        "signal generated"
                    );
                    signals.push(signal);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(strategy = %id, symbol, error = %e, "strategy signal failed — disabling for this cycle");
                    disabled_this_cycle.push(id);
                }
            }
        }

        signals
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::market_data::Timeframe;

    /// Deterministic bar series builder for strategy tests.
    pub fn bars_from_closes(closes: &[f64], volume: f64) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                symbol: "TEST".into(),
                timeframe: Timeframe::Min30,
                open_time: i as i64 * 1_800_000,
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume,
            })
            .collect()
    }

    pub fn ctx() -> CycleContext {
        CycleContext {
            cycle_id: 1,
            now_ms: 0,
            proxy_bars: Vec::new(),
            minutes_to_close: Some(120),
            minutes_since_open: Some(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    #[test]
    fn registry_builds_every_id() {
        for id in StrategyId::ALL {
            let strategy = build(id, StrategyParams::default());
            assert_eq!(strategy.id(), id);
        }
    }

    #[test]
    fn strategy_id_serde_names() {
        let id: StrategyId = serde_json::from_str("\"ema_cross\"").unwrap();
        assert_eq!(id, StrategyId::EmaCross);
        assert!(serde_json::from_str::<StrategyId>("\"coin_flip\"").is_err());
        assert_eq!(format!("{}", StrategyId::VolumeBreakout), "volume_breakout");
    }

    #[test]
    fn percent_stop_sits_on_loss_side() {
        let policy = StopPolicy {
            mode: StopMode::Percent,
            atr_multiplier: 2.0,
            percent: 2.0,
        };
        let long_stop = stop_from_policy(policy, Direction::Long, 100.0, &[]);
        assert!((long_stop - 98.0).abs() < 1e-10);
        let short_stop = stop_from_policy(policy, Direction::Short, 100.0, &[]);
        assert!((short_stop - 102.0).abs() < 1e-10);
    }

    #[test]
    fn take_risk_reward_multiplies_stop_distance() {
        let policy = TakePolicy {
            mode: TakeMode::RiskReward,
            risk_reward: 2.0,
            percent: 4.0,
        };
        let take = take_from_policy(policy, Direction::Long, 100.0, 98.0);
        assert!((take - 104.0).abs() < 1e-10);
        let take = take_from_policy(policy, Direction::Short, 100.0, 102.0);
        assert!((take - 96.0).abs() < 1e-10);
    }

    #[test]
    fn enriched_bars_series_roundtrip() {
        let bars = test_support::bars_from_closes(&[1.0, 2.0, 3.0], 100.0);
        let mut enriched = EnrichedBars::new(bars);
        enriched.append("x", vec![None, Some(1.0), Some(2.0)]);
        assert_eq!(enriched.latest("x"), Some(2.0));
        assert_eq!(enriched.nth_from_end("x", 1), Some(1.0));
        assert_eq!(enriched.latest("missing"), None);
    }
}
