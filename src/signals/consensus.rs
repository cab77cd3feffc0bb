// =============================================================================
// Signal consensus — multi-strategy agreement per symbol per cycle
// =============================================================================
//
// Entries: a TradeIntent is produced only when at least
// `min_strategies_agreement` non-Hold signals agree on a side. The composite
// confidence is the regime-weighted mean of the contributors' confidences.
// A tie between sides produces Hold (no intent).
//
// Exits: never gated on agreement — a single exit signal is enough to put an
// exit intent in front of the pipeline.
// =============================================================================

use tracing::debug;

use crate::config::{SignalsConfig, SizingConfig};
use crate::regime::RegimeState;
use crate::signals::{Signal, SignalKind, TradeIntent};
use crate::strategies::StrategyId;

/// Collapse one symbol's signals for one cycle into at most one entry intent
/// and any number of exit intents.
pub fn build_intents(
    cycle_id: u64,
    symbol: &str,
    signals: &[Signal],
    config: &SignalsConfig,
    sizing: &SizingConfig,
    regime: &RegimeState,
    now_ms: i64,
) -> Vec<TradeIntent> {
    let mut intents = Vec::new();

    // --- Exit intents pass straight through ------------------------------
    for kind in [SignalKind::ExitLong, SignalKind::ExitShort] {
        let best = signals
            .iter()
            .filter(|s| s.kind == kind)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        if let Some(signal) = best {
            intents.push(TradeIntent::new(
                cycle_id,
                symbol,
                kind,
                signal.confidence,
                vec![signal.strategy],
                regime.regime,
                sizing.method,
                signal.suggested_entry,
                signal.suggested_stop,
                signal.suggested_take,
                now_ms,
            ));
        }
    }

    // --- Entry consensus --------------------------------------------------
    let longs: Vec<&Signal> = signals.iter().filter(|s| s.kind == SignalKind::Long).collect();
    let shorts: Vec<&Signal> = signals.iter().filter(|s| s.kind == SignalKind::Short).collect();
    // With confirmation off, one strategy is allowed to act alone.
    let min_agreement = if config.require_confirmation {
        config.min_strategies_agreement as usize
    } else {
        1
    };

    let (side, contributors) = if longs.len() >= min_agreement && longs.len() > shorts.len() {
        (SignalKind::Long, longs)
    } else if shorts.len() >= min_agreement && shorts.len() > longs.len() {
        (SignalKind::Short, shorts)
    } else {
        if !longs.is_empty() && longs.len() == shorts.len() {
            debug!(symbol, "consensus tie between sides — holding");
        }
        return intents;
    };

    // Regime-weighted mean confidence.
    let mut weight_sum = 0.0;
    let mut weighted_conf = 0.0;
    for signal in &contributors {
        let w = regime.weight_for(signal.strategy);
        weight_sum += w;
        weighted_conf += w * signal.confidence;
    }
    let confidence = if weight_sum > 0.0 {
        weighted_conf / weight_sum
    } else {
        0.0
    };

    // Levels come from the most confident contributor.
    let anchor = contributors
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .expect("contributors is non-empty");

    let strategies: Vec<StrategyId> = contributors.iter().map(|s| s.strategy).collect();

    debug!(
        symbol,
        side = %side,
        confidence = format!("{:.3}", confidence),
        contributors = contributors.len(),
        "consensus reached"
    );

    intents.push(TradeIntent::new(
        cycle_id,
        symbol,
        side,
        confidence,
        strategies,
        regime.regime,
        sizing.method,
        anchor.suggested_entry,
        anchor.suggested_stop,
        anchor.suggested_take,
        now_ms,
    ));
    intents
}
