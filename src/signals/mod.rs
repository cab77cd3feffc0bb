// =============================================================================
// Signals — strategy output and vetted trade intents
// =============================================================================
//
// A Signal lives for exactly one cycle. Signals that clear consensus are
// promoted to TradeIntents, which carry the composite confidence, the
// contributing strategy set, a regime tag, and the chosen sizing method into
// the execution pipeline.
// =============================================================================

pub mod consensus;
pub mod enhancer;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SizingMethod;
use crate::regime::MarketRegime;
use crate::strategies::StrategyId;
use crate::types::Direction;

/// What a signal asks for. Hold implies no downstream action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Long,
    Short,
    ExitLong,
    ExitShort,
    Hold,
}

impl SignalKind {
    /// Direction of the position this signal opens (entries only).
    pub fn entry_direction(self) -> Option<Direction> {
        match self {
            Self::Long => Some(Direction::Long),
            Self::Short => Some(Direction::Short),
            _ => None,
        }
    }

    pub fn is_entry(self) -> bool {
        matches!(self, Self::Long | Self::Short)
    }

    pub fn is_exit(self) -> bool {
        matches!(self, Self::ExitLong | Self::ExitShort)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::ExitLong => write!(f, "EXIT_LONG"),
            Self::ExitShort => write!(f, "EXIT_SHORT"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Coarse signal strength bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalStrength {
    Weak,
    Moderate,
    Strong,
}

/// One strategy's verdict for one symbol in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub kind: SignalKind,
    pub strength: SignalStrength,
    pub strategy: StrategyId,
    /// Probability-like scalar in [0, 1].
    pub confidence: f64,
    pub suggested_entry: f64,
    pub suggested_stop: f64,
    pub suggested_take: f64,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// A consensus-vetted candidate order, one-to-one with an order prior to
/// validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: String,
    pub cycle_id: u64,
    pub symbol: String,
    pub kind: SignalKind,
    /// Composite confidence after consensus and enhancement.
    pub confidence: f64,
    /// Contributing strategies, sorted for a stable dedup key.
    pub strategies: Vec<StrategyId>,
    pub regime: MarketRegime,
    pub sizing_method: SizingMethod,
    pub entry: f64,
    pub stop: f64,
    pub take: f64,
    pub timestamp: i64,
}

impl TradeIntent {
    pub fn new(
        cycle_id: u64,
        symbol: impl Into<String>,
        kind: SignalKind,
        confidence: f64,
        mut strategies: Vec<StrategyId>,
        regime: MarketRegime,
        sizing_method: SizingMethod,
        entry: f64,
        stop: f64,
        take: f64,
        timestamp: i64,
    ) -> Self {
        strategies.sort();
        Self {
            id: Uuid::new_v4().to_string(),
            cycle_id,
            symbol: symbol.into(),
            kind,
            confidence,
            strategies,
            regime,
            sizing_method,
            entry,
            stop,
            take,
            timestamp,
        }
    }

    /// Re-submitting the same intent within one cycle is a no-op; this key
    /// defines "the same".
    pub fn dedup_key(&self) -> String {
        let strategies: Vec<String> = self.strategies.iter().map(|s| s.to_string()).collect();
        format!(
            "{}|{}|{}|{}",
            self.symbol,
            self.kind,
            strategies.join("+"),
            self.cycle_id
        )
    }

    /// Short human-readable form for audit records.
    pub fn summary(&self) -> String {
        format!(
            "{} {} conf={:.3} entry={:.2} strategies={:?}",
            self.symbol, self.kind, self.confidence, self.entry, self.strategies
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert!(SignalKind::Long.is_entry());
        assert!(SignalKind::ExitShort.is_exit());
        assert!(!SignalKind::Hold.is_entry());
        assert!(!SignalKind::Hold.is_exit());
        assert_eq!(SignalKind::Long.entry_direction(), Some(Direction::Long));
        assert_eq!(SignalKind::ExitLong.entry_direction(), None);
    }

    #[test]
    fn strength_ordering() {
        assert!(SignalStrength::Weak < SignalStrength::Moderate);
        assert!(SignalStrength::Moderate < SignalStrength::Strong);
    }

    #[test]
    fn dedup_key_is_order_insensitive() {
        let a = TradeIntent::new(
            7,
            "AAPL",
            SignalKind::Long,
            0.7,
            vec![StrategyId::VolumeBreakout, StrategyId::EmaCross],
            MarketRegime::Ranging,
            SizingMethod::RiskBased,
            150.0,
            147.0,
            156.0,
            0,
        );
        let b = TradeIntent::new(
            7,
            "AAPL",
            SignalKind::Long,
            0.9, // confidence does not participate in the key
            vec![StrategyId::EmaCross, StrategyId::VolumeBreakout],
            MarketRegime::Ranging,
            SizingMethod::RiskBased,
            151.0,
            148.0,
            157.0,
            0,
        );
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn dedup_key_distinguishes_cycles() {
        let mk = |cycle| {
            TradeIntent::new(
                cycle,
                "AAPL",
                SignalKind::Long,
                0.7,
                vec![StrategyId::EmaCross],
                MarketRegime::Ranging,
                SizingMethod::RiskBased,
                150.0,
                147.0,
                156.0,
                0,
            )
        };
        assert_ne!(mk(1).dedup_key(), mk(2).dedup_key());
    }
}
