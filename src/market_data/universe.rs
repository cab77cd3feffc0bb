// =============================================================================
// Symbol universe — ordered tickers with tier classification
// =============================================================================
//
// The tier controls a per-symbol sizing multiplier: volatile names are sized
// down before any other clamp applies. The universe is mutated only at
// configured refresh points, never mid-cycle.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

/// Volatility tier of a symbol. Controls the sizing multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Standard,
    Elevated,
    Extreme,
}

impl Tier {
    /// Fraction of the base position size allowed for this tier.
    pub fn size_multiplier(self) -> f64 {
        match self {
            Self::Standard => 1.0,
            Self::Elevated => 0.7,
            Self::Extreme => 0.4,
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Self::Standard
    }
}

/// Per-symbol metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub symbol: String,
    #[serde(default)]
    pub tier: Tier,
}

/// Screener floors applied when the universe is refreshed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenerConfig {
    #[serde(default)]
    pub min_avg_volume: f64,
    #[serde(default)]
    pub min_market_cap: f64,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            min_avg_volume: 0.0,
            min_market_cap: 0.0,
        }
    }
}

/// Ordered set of tradable symbols with metadata.
#[derive(Debug, Clone, Default)]
pub struct Universe {
    symbols: Vec<SymbolMeta>,
}

impl Universe {
    pub fn new(symbols: Vec<SymbolMeta>) -> Self {
        info!(count = symbols.len(), "universe initialised");
        Self { symbols }
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|m| m.symbol == symbol)
    }

    pub fn tier(&self, symbol: &str) -> Option<Tier> {
        self.symbols
            .iter()
            .find(|m| m.symbol == symbol)
            .map(|m| m.tier)
    }

    /// Tickers in configured order.
    pub fn tickers(&self) -> Vec<String> {
        self.symbols.iter().map(|m| m.symbol.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Replace the symbol set. Called only at configured refresh points.
    pub fn replace(&mut self, symbols: Vec<SymbolMeta>) {
        info!(
            old = self.symbols.len(),
            new = symbols.len(),
            "universe refreshed"
        );
        self.symbols = symbols;
    }

    /// Drop symbols whose trailing average volume sits below the screener
    /// floor. Symbols without a volume reading are kept: a data gap is not
    /// grounds for eviction. Runs only at configured refresh points.
    pub fn apply_volume_screen(
        &mut self,
        avg_volumes: &std::collections::HashMap<String, f64>,
        config: &ScreenerConfig,
    ) {
        if config.min_avg_volume <= 0.0 {
            return;
        }
        let before = self.symbols.len();
        self.symbols.retain(|m| match avg_volumes.get(&m.symbol) {
            Some(&avg) => avg >= config.min_avg_volume,
            None => true,
        });
        if self.symbols.len() != before {
            info!(
                dropped = before - self.symbols.len(),
                floor = config.min_avg_volume,
                "volume screen applied"
            );
        }
    }
}
